use core::fmt;
use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::{Config, RemovalScope, ThrottlePolicy},
    fs::ControlFs,
    parse, Pid, MEMORY_UNLIMITED, TASKS,
};

pub const CPU_SHARES: &str = "cpu.shares";
pub const CFS_PERIOD: &str = "cpu.cfs_period_us";
pub const CFS_QUOTA: &str = "cpu.cfs_quota_us";
pub const CPU_STAT: &str = "cpu.stat";
pub const USAGE_PERCPU: &str = "cpuacct.usage_percpu";
pub const MEM_LIMIT: &str = "memory.limit_in_bytes";
pub const MEM_STAT: &str = "memory.stat";
pub const PIDS_MAX: &str = "pids.max";
pub const IO_SERVICE_BYTES: &str = "blkio.throttle.io_service_bytes";
pub const IO_SERVICED: &str = "blkio.throttle.io_serviced";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to {op} {}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("Pid {0} does not exist")]
    NoSuchProcess(Pid),

    #[error("{0} hierarchy not available in this group")]
    MissingSubsystem(Subsystem),

    #[error("{0:?} is not a valid group name")]
    InvalidName(String),

    #[error("{0} unknown subsystem name")]
    UnknownSubsystem(String),

    #[error("{0} unknown unit, must be one of bytes, kilobytes, megabytes, gigabytes")]
    UnknownUnit(String),

    #[error("Limit {0:?} must be convertible to an int")]
    InvalidLimit(String),

    #[error("{0} is not a positive number of cores")]
    InvalidCores(f64),

    #[error("{0:?} is not a device identifier")]
    InvalidDevice(String),

    #[error("Malformed {}", path.display())]
    Format {
        path: PathBuf,
        source: parse::Error,
    },

    #[error("Unexpected contents {contents:?} in {}", path.display())]
    Unexpected { path: PathBuf, contents: String },
}

/// Coarse classification of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The kernel interface refused or failed an operation.
    ResourceGroup,
    /// Caller-supplied input was rejected before touching the kernel.
    Validation,
    /// A control file did not hold the expected record shape.
    Format,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. } | Error::NoSuchProcess(_) | Error::MissingSubsystem(_) => {
                ErrorKind::ResourceGroup
            }
            Error::InvalidName(_)
            | Error::UnknownSubsystem(_)
            | Error::UnknownUnit(_)
            | Error::InvalidLimit(_)
            | Error::InvalidCores(_)
            | Error::InvalidDevice(_) => ErrorKind::Validation,
            Error::Format { .. } | Error::Unexpected { .. } => ErrorKind::Format,
        }
    }
}

fn io_error<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> Error + 'a {
    move |source| Error::Io {
        op,
        path: path.to_owned(),
        source,
    }
}

fn format_error(path: &Path) -> impl FnOnce(parse::Error) -> Error + '_ {
    move |source| Error::Format {
        path: path.to_owned(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subsystem {
    Cpu,
    Memory,
    BlkIo,
    Pids,
}

impl Subsystem {
    pub const fn all() -> &'static [Subsystem] {
        &[
            Subsystem::Cpu,
            Subsystem::Memory,
            Subsystem::BlkIo,
            Subsystem::Pids,
        ]
    }

    /// Directory of the hierarchy under the mount point.
    pub const fn hierarchy(&self) -> &'static str {
        match self {
            Subsystem::Cpu => "cpu,cpuacct",
            Subsystem::Memory => "memory",
            Subsystem::BlkIo => "blkio",
            Subsystem::Pids => "pids",
        }
    }

    /// Shared subsystems are driven at the hierarchy root instead of a per-group directory.
    /// Block I/O throttle device maps are only honoured there.
    pub const fn is_shared(&self) -> bool {
        matches!(self, Subsystem::BlkIo)
    }
}

impl From<&Subsystem> for &str {
    fn from(value: &Subsystem) -> Self {
        match value {
            Subsystem::Cpu => "cpu",
            Subsystem::Memory => "memory",
            Subsystem::BlkIo => "blkio",
            Subsystem::Pids => "pids",
        }
    }
}

impl TryFrom<&str> for Subsystem {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "cpu" => Ok(Subsystem::Cpu),
            "memory" => Ok(Subsystem::Memory),
            "blkio" => Ok(Subsystem::BlkIo),
            "pids" => Ok(Subsystem::Pids),
            _ => Err(Error::UnknownSubsystem(value.to_string())),
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.into())
    }
}

/// Unit of a memory limit. Each step is a factor of 1024.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Bytes,
    Kilobytes,
    Megabytes,
    Gigabytes,
}

impl Unit {
    const fn multiplier(&self) -> i64 {
        match self {
            Unit::Bytes => 1,
            Unit::Kilobytes => 1 << 10,
            Unit::Megabytes => 1 << 20,
            Unit::Gigabytes => 1 << 30,
        }
    }

    pub fn to_bytes(&self, limit: i64) -> Result<i64, Error> {
        limit
            .checked_mul(self.multiplier())
            .ok_or_else(|| Error::InvalidLimit(format!("{} {}", limit, self)))
    }
}

impl FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bytes" => Ok(Unit::Bytes),
            "kilobytes" => Ok(Unit::Kilobytes),
            "megabytes" => Ok(Unit::Megabytes),
            "gigabytes" => Ok(Unit::Gigabytes),
            _ => Err(Error::UnknownUnit(s.to_string())),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Unit::Bytes => "bytes",
            Unit::Kilobytes => "kilobytes",
            Unit::Megabytes => "megabytes",
            Unit::Gigabytes => "gigabytes",
        })
    }
}

/// Converts a textual limit and unit into the value for `memory.limit_in_bytes`.
///
/// The unit is checked first; no limit means [`MEMORY_UNLIMITED`].
pub fn format_memory_value(limit: Option<&str>, unit: &str) -> Result<i64, Error> {
    let unit = unit.parse::<Unit>()?;
    match limit {
        None => Ok(MEMORY_UNLIMITED),
        Some(limit) => {
            let limit = limit
                .trim()
                .parse::<i64>()
                .map_err(|_| Error::InvalidLimit(limit.to_string()))?;
            unit.to_bytes(limit)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleMetric {
    ReadBps,
    WriteBps,
    ReadIops,
    WriteIops,
}

impl ThrottleMetric {
    pub const fn file(&self) -> &'static str {
        match self {
            ThrottleMetric::ReadBps => "blkio.throttle.read_bps_device",
            ThrottleMetric::WriteBps => "blkio.throttle.write_bps_device",
            ThrottleMetric::ReadIops => "blkio.throttle.read_iops_device",
            ThrottleMetric::WriteIops => "blkio.throttle.write_iops_device",
        }
    }
}

fn validate_cores(cores: f64) -> Result<f64, Error> {
    if cores.is_finite() && cores > 0.0 {
        Ok(cores)
    } else {
        Err(Error::InvalidCores(cores))
    }
}

/// A named group spanning several hierarchies.
///
/// Operations are plain sequences of blocking reads and writes. Nothing is locked, so callers
/// sharing a group between threads must serialize access themselves.
#[derive(Debug)]
pub struct ResourceGroup<F> {
    name: String,
    fs: F,
    config: Config,
    hierarchies: BTreeMap<Subsystem, PathBuf>,
}

impl<F: ControlFs> ResourceGroup<F> {
    /// Provisions the group in every subsystem.
    pub fn create(fs: F, config: Config, name: &str) -> Result<Self, Error> {
        Self::create_with(fs, config, name, Subsystem::all())
    }

    /// Provisions the group in `subsystems` only. Directories that already exist are reused.
    pub fn create_with(
        fs: F,
        config: Config,
        name: &str,
        subsystems: &[Subsystem],
    ) -> Result<Self, Error> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(Error::InvalidName(name.to_string()));
        }

        let mut hierarchies = BTreeMap::new();
        for subsystem in subsystems {
            let mut path = config.root.join(subsystem.hierarchy());
            if !subsystem.is_shared() {
                path.push(name);
            }

            ensure_dir(&fs, &path)?;
            hierarchies.insert(*subsystem, path);
        }

        info!("Created group {} in {:?}", name, hierarchies.keys());

        Ok(Self {
            name: name.to_string(),
            fs,
            config,
            hierarchies,
        })
    }

    /// Removes the group directory from every per-group hierarchy. Shared roots stay.
    ///
    /// The kernel refuses while tasks or child groups remain; move them out first.
    pub fn delete(&self) -> Result<(), Error> {
        for (subsystem, path) in &self.hierarchies {
            if subsystem.is_shared() {
                continue;
            }

            self.fs
                .remove_dir(path)
                .map_err(io_error("remove", path))?;
            debug!("Removed {}", path.display());
        }

        info!("Deleted group {}", self.name);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subsystems(&self) -> impl Iterator<Item = Subsystem> + '_ {
        self.hierarchies.keys().copied()
    }

    pub fn path(&self, subsystem: Subsystem) -> Result<&Path, Error> {
        self.hierarchies
            .get(&subsystem)
            .map(PathBuf::as_path)
            .ok_or(Error::MissingSubsystem(subsystem))
    }

    fn control_file(&self, subsystem: Subsystem, name: &str) -> Result<PathBuf, Error> {
        Ok(self.path(subsystem)?.join(name))
    }

    fn write(&self, path: &Path, value: impl fmt::Display) -> Result<(), Error> {
        self.fs
            .write_file(path, &format!("{}\n", value))
            .map_err(io_error("write", path))?;
        debug!("Wrote {} to {}", value, path.display());
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<String, Error> {
        self.fs.read_file(path).map_err(io_error("read", path))
    }

    fn read_value(&self, subsystem: Subsystem, name: &str) -> Result<i64, Error> {
        let path = self.control_file(subsystem, name)?;
        let contents = self.read(&path)?;

        match parse::parse_newline_values(&contents).map_err(format_error(&path))?[..] {
            [value] => Ok(value),
            _ => Err(Error::Unexpected { path, contents }),
        }
    }

    /// Sets the relative CPU weight to `shares_per_core × cores`.
    pub fn set_shares(&self, cores: f64) -> Result<(), Error> {
        let cores = validate_cores(cores)?;
        let shares = (self.config.shares_per_core as f64 * cores).round() as u64;
        self.write(&self.control_file(Subsystem::Cpu, CPU_SHARES)?, shares)
    }

    /// Caps CPU time at `cores` CPUs' worth per CFS period.
    ///
    /// The period and quota are two writes. If the quota write fails the period has already
    /// changed; re-apply the call.
    pub fn set_cores(&self, cores: f64) -> Result<(), Error> {
        let cores = validate_cores(cores)?;
        let period = self.config.cfs_period_us;
        let quota = (period as f64 * cores).round() as u64;

        self.write(&self.control_file(Subsystem::Cpu, CFS_PERIOD)?, period)?;
        self.write(&self.control_file(Subsystem::Cpu, CFS_QUOTA)?, quota)
    }

    /// `None` removes the ceiling.
    pub fn set_memory_limit(&self, limit: Option<i64>, unit: Unit) -> Result<(), Error> {
        let path = self.control_file(Subsystem::Memory, MEM_LIMIT)?;
        let value = match limit {
            Some(limit) => unit.to_bytes(limit)?,
            None => self.config.memory_unlimited,
        };

        self.write(&path, value)
    }

    pub fn set_io_read_bps(&self, device: &str, bytes_per_second: u64) -> Result<(), Error> {
        self.set_throttle(ThrottleMetric::ReadBps, device, bytes_per_second)
    }

    pub fn set_io_write_bps(&self, device: &str, bytes_per_second: u64) -> Result<(), Error> {
        self.set_throttle(ThrottleMetric::WriteBps, device, bytes_per_second)
    }

    pub fn set_io_read_iops(&self, device: &str, iops: u64) -> Result<(), Error> {
        self.set_throttle(ThrottleMetric::ReadIops, device, iops)
    }

    pub fn set_io_write_iops(&self, device: &str, iops: u64) -> Result<(), Error> {
        self.set_throttle(ThrottleMetric::WriteIops, device, iops)
    }

    /// Writes `<device> <value>` to the throttle file of `metric`, according to the
    /// configured [`ThrottlePolicy`].
    pub fn set_throttle(&self, metric: ThrottleMetric, device: &str, value: u64) -> Result<(), Error> {
        if device.is_empty() || device.contains(char::is_whitespace) {
            return Err(Error::InvalidDevice(device.to_string()));
        }

        let path = self.control_file(Subsystem::BlkIo, metric.file())?;
        let record = format!("{} {}\n", device, value);

        let written = match self.config.throttle_policy {
            ThrottlePolicy::Truncate => self.fs.write_file(&path, &record),
            ThrottlePolicy::Append => self.fs.append_file(&path, &record),
            ThrottlePolicy::Replace => {
                let mut entries: BTreeMap<String, i64> = match self.fs.read_file(&path) {
                    Ok(contents) => parse::parse_flat_keyed(&contents)
                        .map_err(format_error(&path))?
                        .into_iter()
                        .collect(),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
                    Err(err) => return Err(io_error("read", &path)(err)),
                };
                entries.remove(device);

                let mut records: Vec<String> = entries
                    .iter()
                    .map(|(device, value)| format!("{} {}\n", device, value))
                    .collect();
                records.push(record);

                self.fs.write_records(&path, &records)
            }
        };
        written.map_err(io_error("write", &path))?;

        debug!("Throttled {} to {} in {}", device, value, path.display());
        Ok(())
    }

    pub fn set_max_pids(&self, limit: u64) -> Result<(), Error> {
        self.write(&self.control_file(Subsystem::Pids, PIDS_MAX)?, limit)
    }

    /// Pid 0 is refused outright: written to `tasks` it names the writer itself.
    fn ensure_alive(&self, pid: Pid) -> Result<(), Error> {
        if *pid != 0 && self.fs.is_alive(pid) {
            Ok(())
        } else {
            warn!("Pid {} does not exist", pid);
            Err(Error::NoSuchProcess(pid))
        }
    }

    fn members(&self, tasks: &Path) -> Result<Vec<i64>, Error> {
        let contents = self.read(tasks)?;
        parse::parse_newline_values(&contents).map_err(format_error(tasks))
    }

    /// Attaches `pid` to every provisioned hierarchy it is not already part of.
    pub fn add_task(&self, pid: Pid) -> Result<(), Error> {
        self.ensure_alive(pid)?;

        for path in self.hierarchies.values() {
            let tasks = path.join(TASKS);
            if !self.members(&tasks)?.contains(&i64::from(*pid)) {
                self.fs
                    .append_file(&tasks, &format!("{}\n", pid))
                    .map_err(io_error("append", &tasks))?;
                debug!("Attached {} to {}", pid, path.display());
            }
        }

        info!("Added task {} to group {}", pid, self.name);
        Ok(())
    }

    /// Moves `pid` out of the group by attaching it to the hierarchy root.
    ///
    /// With [`RemovalScope::CpuOnly`] only the CPU hierarchy is touched and the task stays in
    /// the group's other hierarchies. A pid that is not a member is left alone.
    pub fn remove_task(&self, pid: Pid) -> Result<(), Error> {
        self.ensure_alive(pid)?;

        let scope: Vec<Subsystem> = match self.config.removal_scope {
            RemovalScope::CpuOnly => vec![Subsystem::Cpu],
            RemovalScope::AllSubsystems => self
                .subsystems()
                .filter(|subsystem| !subsystem.is_shared())
                .collect(),
        };

        for subsystem in scope {
            let tasks = self.control_file(subsystem, TASKS)?;
            if !self.members(&tasks)?.contains(&i64::from(*pid)) {
                continue;
            }

            let root_tasks = self.config.root.join(subsystem.hierarchy()).join(TASKS);
            self.fs
                .append_file(&root_tasks, &format!("{}\n", pid))
                .map_err(io_error("append", &root_tasks))?;
            debug!("Moved {} to the {} root", pid, subsystem);
        }

        info!("Removed task {} from group {}", pid, self.name);
        Ok(())
    }

    /// Tasks currently attached to the group in `subsystem`.
    pub fn tasks(&self, subsystem: Subsystem) -> Result<Vec<Pid>, Error> {
        let path = self.control_file(subsystem, TASKS)?;
        self.members(&path)?
            .into_iter()
            .map(|pid| {
                Pid::try_from(pid).map_err(|_| Error::Unexpected {
                    path: path.clone(),
                    contents: pid.to_string(),
                })
            })
            .collect()
    }

    pub fn shares(&self) -> Result<i64, Error> {
        self.read_value(Subsystem::Cpu, CPU_SHARES)
    }

    pub fn cfs_period_us(&self) -> Result<i64, Error> {
        self.read_value(Subsystem::Cpu, CFS_PERIOD)
    }

    /// `-1` when no quota is set.
    pub fn cfs_quota_us(&self) -> Result<i64, Error> {
        self.read_value(Subsystem::Cpu, CFS_QUOTA)
    }

    pub fn memory_limit(&self) -> Result<i64, Error> {
        self.read_value(Subsystem::Memory, MEM_LIMIT)
    }

    /// `None` when the kernel reports `max`.
    pub fn max_pids(&self) -> Result<Option<u64>, Error> {
        let path = self.control_file(Subsystem::Pids, PIDS_MAX)?;
        let contents = self.read(&path)?;
        let unexpected = || Error::Unexpected {
            path: path.clone(),
            contents: contents.clone(),
        };

        match parse::parse_space_values(&contents).as_slice() {
            [max] if max == "max" => Ok(None),
            [limit] => limit.parse().map(Some).map_err(|_| unexpected()),
            _ => Err(unexpected()),
        }
    }

    /// Per-device entries of a throttle file.
    pub fn throttle(&self, metric: ThrottleMetric) -> Result<HashMap<String, i64>, Error> {
        self.read_flat_keyed(Subsystem::BlkIo, metric.file())
    }

    /// `nr_periods`, `nr_throttled` and `throttled_time` from `cpu.stat`.
    pub fn cpu_stat(&self) -> Result<HashMap<String, i64>, Error> {
        self.read_flat_keyed(Subsystem::Cpu, CPU_STAT)
    }

    pub fn memory_stat(&self) -> Result<HashMap<String, i64>, Error> {
        self.read_flat_keyed(Subsystem::Memory, MEM_STAT)
    }

    /// CPU time in nanoseconds consumed on each CPU.
    pub fn usage_percpu(&self) -> Result<Vec<u64>, Error> {
        let path = self.control_file(Subsystem::Cpu, USAGE_PERCPU)?;
        let contents = self.read(&path)?;

        parse::parse_space_values(&contents)
            .iter()
            .map(|usage| {
                usage.parse().map_err(|_| Error::Unexpected {
                    path: path.clone(),
                    contents: usage.clone(),
                })
            })
            .collect()
    }

    /// Bytes transferred per device and operation.
    pub fn io_service_bytes(&self) -> Result<HashMap<String, HashMap<String, i64>>, Error> {
        self.read_nested_keyed(Subsystem::BlkIo, IO_SERVICE_BYTES)
    }

    /// I/O operations issued per device and operation.
    pub fn io_serviced(&self) -> Result<HashMap<String, HashMap<String, i64>>, Error> {
        self.read_nested_keyed(Subsystem::BlkIo, IO_SERVICED)
    }

    fn read_flat_keyed(&self, subsystem: Subsystem, name: &str) -> Result<HashMap<String, i64>, Error> {
        let path = self.control_file(subsystem, name)?;
        parse::parse_flat_keyed(&self.read(&path)?).map_err(format_error(&path))
    }

    fn read_nested_keyed(
        &self,
        subsystem: Subsystem,
        name: &str,
    ) -> Result<HashMap<String, HashMap<String, i64>>, Error> {
        let path = self.control_file(subsystem, name)?;
        parse::parse_nested_keyed(&self.read(&path)?).map_err(format_error(&path))
    }
}

fn ensure_dir<F: ControlFs>(fs: &F, path: &Path) -> Result<(), Error> {
    if fs.is_dir(path) {
        debug!("Reusing {}", path.display());
        return Ok(());
    }

    match fs.create_dir(path) {
        Ok(()) => {
            debug!("Created {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && fs.is_dir(path) => Ok(()),
        Err(err) => Err(io_error("create", path)(err)),
    }
}
