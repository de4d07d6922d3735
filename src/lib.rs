//! Resource groups over the cgroup v1 hierarchies.
//!
//! A [`ResourceGroup`] spans the `cpu,cpuacct`, `memory` and `pids` hierarchies plus the
//! shared `blkio` root, sets CPU, memory, block I/O and process-count limits through their
//! control files, and moves tasks in and out.
//!
//! ```no_run
//! use cgctl::{Config, Pid, ResourceGroup, SysFs, Unit};
//!
//! # fn main() -> Result<(), cgctl::Error> {
//! let group = ResourceGroup::create(SysFs, Config::default(), "bench")?;
//! group.set_cores(2.0)?;
//! group.set_memory_limit(Some(512), Unit::Megabytes)?;
//! group.add_task(Pid::from(std::process::id()))?;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod cgroup;
pub mod config;
pub mod fs;
pub mod parse;
pub mod stats;

pub use cgroup::{format_memory_value, ResourceGroup, Subsystem, ThrottleMetric, Unit};
pub use config::{Config, RemovalScope, ThrottlePolicy};
pub use fs::{ControlFs, MemFs, SysFs};
pub use stats::calculate_percentile;

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const SHARES_PER_CORE: u64 = 1024;
pub const CFS_PERIOD_US: u64 = 200_000;
pub const MEMORY_UNLIMITED: i64 = -1;
pub const TASKS: &str = "tasks";

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    Cgroup(#[from] cgroup::Error),
    #[error(transparent)]
    Format(#[from] parse::Error),
}

/// Process or thread ID as written to a `tasks` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl From<u32> for Pid {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

impl From<&std::process::Child> for Pid {
    fn from(child: &std::process::Child) -> Self {
        Self(child.id())
    }
}

impl TryFrom<i64> for Pid {
    type Error = std::num::TryFromIntError;

    fn try_from(pid: i64) -> Result<Self, Self::Error> {
        u32::try_from(pid).map(Self)
    }
}

impl std::ops::Deref for Pid {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
