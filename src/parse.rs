//! Conversions from the line-oriented text the cgroup v1 control files expose.
//!
//! The kernel uses four encodings (see Documentation/cgroup-v1/cgroups.txt):
//!
//! ```text
//! newline separated     VAL0\nVAL1\n...
//! space separated       VAL0 VAL1 ...\n
//! flat keyed            KEY0 VAL0\nKEY1 VAL1\n...
//! nested keyed          KEY0 SUB_KEY0 VAL\nKEY1 SUB_KEY1 VAL\n...
//! ```
//!
//! Nothing in here touches the filesystem; callers pass the content they already read.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("line {line}: {value:?} is not an integer")]
    NotAnInteger { line: usize, value: String },

    #[error("line {line}: expected `KEY VALUE`, got {record:?}")]
    NotAPair { line: usize, record: String },
}

/// Splits content into records. A trailing terminator does not start an empty record.
fn records(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .split_terminator('\n')
        .enumerate()
        .map(|(ix, record)| (ix + 1, record))
}

fn integer(line: usize, value: &str) -> Result<i64, Error> {
    value.parse().map_err(|_| Error::NotAnInteger {
        line,
        value: value.to_owned(),
    })
}

pub fn parse_newline_values(content: &str) -> Result<Vec<i64>, Error> {
    records(content)
        .map(|(line, record)| integer(line, record))
        .collect()
}

/// Only the first line is considered; runs of spaces and a trailing space yield no tokens.
pub fn parse_space_values(content: &str) -> Vec<String> {
    content
        .split('\n')
        .next()
        .unwrap_or_default()
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Later records for the same key overwrite earlier ones.
pub fn parse_flat_keyed(content: &str) -> Result<HashMap<String, i64>, Error> {
    let mut ret = HashMap::new();

    for (line, record) in records(content) {
        match record.split(' ').collect::<Vec<_>>()[..] {
            [key, value] => {
                ret.insert(key.to_owned(), integer(line, value)?);
            }
            _ => {
                return Err(Error::NotAPair {
                    line,
                    record: record.to_owned(),
                })
            }
        }
    }

    Ok(ret)
}

/// Records with fewer than three fields are skipped: the kernel may hand back a partially
/// written record, and totals lines such as `Total 1024` have only two.
pub fn parse_nested_keyed(content: &str) -> Result<HashMap<String, HashMap<String, i64>>, Error> {
    let mut ret: HashMap<String, HashMap<String, i64>> = HashMap::new();

    for (line, record) in records(content) {
        let fields: Vec<&str> = record.split(' ').collect();
        if let [key, sub_key, value, ..] = fields[..] {
            let value = integer(line, value)?;
            ret.entry(key.to_owned())
                .or_default()
                .insert(sub_key.to_owned(), value);
        }
    }

    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_newline_values_then_trailing_terminator_is_dropped() {
        assert_eq!(parse_newline_values("10\n20\n30\n"), Ok(vec![10, 20, 30]));
    }

    #[test]
    fn given_empty_content_then_no_values() {
        assert_eq!(parse_newline_values(""), Ok(vec![]));
        assert!(parse_flat_keyed("").unwrap().is_empty());
        assert!(parse_nested_keyed("").unwrap().is_empty());
    }

    #[test]
    fn given_unterminated_last_value_then_it_is_kept() {
        assert_eq!(parse_newline_values("-1"), Ok(vec![-1]));
    }

    #[test]
    fn given_non_integer_line_then_format_error() {
        assert_eq!(
            parse_newline_values("10\nabc\n"),
            Err(Error::NotAnInteger {
                line: 2,
                value: "abc".to_string()
            })
        );
    }

    #[test]
    fn given_space_values_then_blank_tokens_collapse() {
        assert_eq!(parse_space_values("a b  c \n"), vec!["a", "b", "c"]);
    }

    #[test]
    fn given_multiline_space_values_then_only_first_line_is_read() {
        assert_eq!(parse_space_values("1 2\n3 4\n"), vec!["1", "2"]);
        assert!(parse_space_values("").is_empty());
    }

    #[test]
    fn given_flat_keyed_then_map() {
        let map = parse_flat_keyed("x 1\ny 2\n").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["x"], 1);
        assert_eq!(map["y"], 2);
    }

    #[test]
    fn given_duplicate_flat_key_then_last_wins() {
        let map = parse_flat_keyed("8:0 100\n8:0 200\n").unwrap();
        assert_eq!(map["8:0"], 200);
    }

    #[test]
    fn given_flat_keyed_without_pair_then_format_error() {
        assert_eq!(
            parse_flat_keyed("bad\n"),
            Err(Error::NotAPair {
                line: 1,
                record: "bad".to_string()
            })
        );
        assert!(parse_flat_keyed("a 1 2\n").is_err());
        assert!(parse_flat_keyed("a one\n").is_err());
    }

    #[test]
    fn given_nested_keyed_then_sub_keys_merge() {
        let map = parse_nested_keyed("dev1 read 100\ndev1 write 50\n").unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["dev1"]["read"], 100);
        assert_eq!(map["dev1"]["write"], 50);
    }

    #[test]
    fn given_short_nested_line_then_it_is_skipped() {
        let map = parse_nested_keyed("dev1\n").unwrap();
        assert!(map.is_empty());

        let map = parse_nested_keyed("8:0 Read 4096\n8:0 Write 0\nTotal 4096\n").unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["8:0"]["Read"], 4096);
    }

    #[test]
    fn given_nested_value_not_integer_then_format_error() {
        assert!(parse_nested_keyed("dev1 read lots\n").is_err());
    }
}
