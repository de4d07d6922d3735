use cgctl::{calculate_percentile, Config, Pid, ResourceGroup, SysFs, Unit};

fn main() -> Result<(), cgctl::Error> {
    let mut args = std::env::args();

    let lim = std::env::var("LIMIT").is_ok();
    let name = args.nth(1).expect("Pass group name");
    let bin = args.next().expect("Pass bin");
    let args: Vec<String> = args.collect();

    println!("B({}), O({:?}), N({}), L({})", bin, args, name, lim);

    let config = match std::env::var("CGROUP_ROOT") {
        Ok(root) => Config::default().with_root(root),
        Err(_) => Config::default(),
    };
    let group = ResourceGroup::create(SysFs, config, &name)?;

    if lim {
        group.set_shares(1.0)?;
        group.set_cores(1.0)?;
        group.set_memory_limit(Some(512), Unit::Megabytes)?;
        group.set_max_pids(64)?;

        if let Ok(device) = std::env::var("IO_DEVICE") {
            group.set_io_read_bps(&device, 1024 * 1024)?;
            group.set_io_write_bps(&device, 1024 * 1024)?;
        }
    }

    let mut child = std::process::Command::new(&bin).args(&args).spawn()?;
    let pid = Pid::from(&child);
    group.add_task(pid)?;
    println!("Status: {:#?}", group);

    let status = child.wait()?;
    println!("Exit: {}", status);

    if let Ok(usage) = group.usage_percpu() {
        println!("Usage per cpu (ns): {:?}", usage);
        let samples: Vec<f64> = usage.iter().map(|ns| *ns as f64).collect();
        for p in [50.0, 99.0] {
            if let Some(value) = calculate_percentile(&samples, p) {
                println!("p{}: {:.0}", p, value);
            }
        }
    }

    group.delete()?;
    Ok(())
}
