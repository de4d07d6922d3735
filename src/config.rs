use std::path::{Path, PathBuf};

use crate::{CFS_PERIOD_US, CGROUP_ROOT, MEMORY_UNLIMITED, SHARES_PER_CORE};

/// How a per-device throttle file is updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottlePolicy {
    /// Read the current entries, replace the line for the device, write every entry back.
    Replace,
    /// Append a new `<device> <value>` line, leaving older lines in place.
    Append,
    /// Overwrite the file with the single new line.
    Truncate,
}

/// Which hierarchies `remove_task` moves a task out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalScope {
    CpuOnly,
    AllSubsystems,
}

/// Settings shared by every group a manager creates.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Mount point holding one directory per hierarchy.
    pub root: PathBuf,
    pub shares_per_core: u64,
    /// Fixed CFS period in microseconds.
    pub cfs_period_us: u64,
    /// Written to `memory.limit_in_bytes` when no limit is requested.
    pub memory_unlimited: i64,
    pub throttle_policy: ThrottlePolicy,
    pub removal_scope: RemovalScope,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from(CGROUP_ROOT),
            shares_per_core: SHARES_PER_CORE,
            cfs_period_us: CFS_PERIOD_US,
            memory_unlimited: MEMORY_UNLIMITED,
            throttle_policy: ThrottlePolicy::Replace,
            removal_scope: RemovalScope::CpuOnly,
        }
    }
}

impl Config {
    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        self.root = root.as_ref().to_owned();
        self
    }

    pub fn with_throttle_policy(mut self, policy: ThrottlePolicy) -> Self {
        self.throttle_policy = policy;
        self
    }

    pub fn with_removal_scope(mut self, scope: RemovalScope) -> Self {
        self.removal_scope = scope;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_default_config_then_kernel_defaults() {
        let config = Config::default();
        assert_eq!(config.root, Path::new("/sys/fs/cgroup"));
        assert_eq!(config.shares_per_core, 1024);
        assert_eq!(config.cfs_period_us, 200_000);
        assert_eq!(config.memory_unlimited, -1);
        assert_eq!(config.throttle_policy, ThrottlePolicy::Replace);
        assert_eq!(config.removal_scope, RemovalScope::CpuOnly);
    }

    #[test]
    fn given_overrides_then_only_those_fields_change() {
        let config = Config::default()
            .with_root("/tmp/scratch")
            .with_throttle_policy(ThrottlePolicy::Append)
            .with_removal_scope(RemovalScope::AllSubsystems);

        assert_eq!(config.root, Path::new("/tmp/scratch"));
        assert_eq!(config.throttle_policy, ThrottlePolicy::Append);
        assert_eq!(config.removal_scope, RemovalScope::AllSubsystems);
        assert_eq!(config.cfs_period_us, CFS_PERIOD_US);
    }
}
