/// Percentile of `values` with linear interpolation between the closest ranks.
///
/// Returns `None` for an empty sequence or a percentile outside `[0, 100]`.
pub fn calculate_percentile(values: &[f64], percentile: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=100.0).contains(&percentile) {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = percentile / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_bounds_then_min_and_max() {
        let values = [7.0, -3.0, 12.0, 5.0, 5.0];
        assert_eq!(calculate_percentile(&values, 0.0), Some(-3.0));
        assert_eq!(calculate_percentile(&values, 100.0), Some(12.0));
    }

    #[test]
    fn given_median_of_even_count_then_interpolated() {
        assert_eq!(calculate_percentile(&[1.0, 2.0, 3.0, 4.0], 50.0), Some(2.5));
    }

    #[test]
    fn given_between_ranks_then_linear() {
        // rank = 0.9 * 4 = 3.6 -> 40 + 0.6 * 10
        let values = [10.0, 20.0, 30.0, 40.0, 50.0];
        let p90 = calculate_percentile(&values, 90.0).unwrap();
        assert!((p90 - 46.0).abs() < 1e-9);
    }

    #[test]
    fn given_single_value_then_it_is_every_percentile() {
        assert_eq!(calculate_percentile(&[42.0], 0.0), Some(42.0));
        assert_eq!(calculate_percentile(&[42.0], 37.5), Some(42.0));
    }

    #[test]
    fn given_empty_or_out_of_range_then_none() {
        assert_eq!(calculate_percentile(&[], 50.0), None);
        assert_eq!(calculate_percentile(&[1.0], 101.0), None);
        assert_eq!(calculate_percentile(&[1.0], -1.0), None);
        assert_eq!(calculate_percentile(&[1.0], f64::NAN), None);
    }
}
