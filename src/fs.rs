//! Filesystem capability used by [`ResourceGroup`](crate::cgroup::ResourceGroup).
//!
//! [`SysFs`] drives the mounted cgroup hierarchies. [`MemFs`] keeps the tree in memory and
//! mimics the parts of cgroupfs behaviour the manager relies on, so groups can be exercised
//! without privileges.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashSet},
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::debug;
use nix::{
    errno::Errno,
    sys::signal::kill,
    unistd::Pid as RawPid,
};

use crate::{Pid, TASKS};

pub trait ControlFs {
    fn is_dir(&self, path: &Path) -> bool;

    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Fails while the kernel still holds tasks or child groups under `path`.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    fn read_file(&self, path: &Path) -> io::Result<String>;

    /// Truncates, then writes `contents`.
    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()>;

    fn append_file(&self, path: &Path, contents: &str) -> io::Result<()>;

    /// Truncates, then writes each record separately. Control files accept one rule per write.
    fn write_records(&self, path: &Path, records: &[String]) -> io::Result<()> {
        self.write_file(path, &records.concat())
    }

    /// Zero-effect check that `pid` names an existing process.
    fn is_alive(&self, pid: Pid) -> bool;
}

impl<T: ControlFs + ?Sized> ControlFs for &T {
    fn is_dir(&self, path: &Path) -> bool {
        (**self).is_dir(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        (**self).create_dir(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        (**self).remove_dir(path)
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        (**self).read_file(path)
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        (**self).write_file(path, contents)
    }

    fn append_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        (**self).append_file(path, contents)
    }

    fn write_records(&self, path: &Path, records: &[String]) -> io::Result<()> {
        (**self).write_records(path, records)
    }

    fn is_alive(&self, pid: Pid) -> bool {
        (**self).is_alive(pid)
    }
}

/// The real kernel interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysFs;

impl ControlFs for SysFs {
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn append_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(contents.as_bytes())
    }

    fn write_records(&self, path: &Path, records: &[String]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        for record in records {
            file.write_all(record.as_bytes())?;
        }

        Ok(())
    }

    fn is_alive(&self, pid: Pid) -> bool {
        // kill(0, ..) addresses our own process group.
        let raw = match i32::try_from(*pid) {
            Ok(raw) if raw > 0 => raw,
            _ => return false,
        };

        match kill(RawPid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists, but belongs to someone we may not signal.
            Err(Errno::EPERM) => true,
            Err(err) => {
                debug!("Liveness probe for {} failed({})", pid, err);
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct Tree {
    mounts: BTreeSet<PathBuf>,
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, String>,
    live: HashSet<Pid>,
    writes: Vec<PathBuf>,
    unreadable: BTreeSet<PathBuf>,
    unwritable: BTreeSet<PathBuf>,
}

/// In-memory stand-in for a cgroupfs mount.
///
/// Like the kernel, a new directory comes with an empty `tasks` file, a pid written to a
/// `tasks` file leaves every other group of the same hierarchy, and removing a directory
/// drops its control files but fails with `EBUSY` while `tasks` lists a pid or a child
/// directory remains.
#[derive(Debug, Default)]
pub struct MemFs {
    tree: RefCell<Tree>,
}

fn busy() -> io::Error {
    io::Error::from_raw_os_error(Errno::EBUSY as i32)
}

fn denied() -> io::Error {
    io::Error::from_raw_os_error(Errno::EACCES as i32)
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} does not exist", path.display()),
    )
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts a hierarchy at `path`, creating missing parents.
    pub fn mount(&self, path: impl AsRef<Path>) -> &Self {
        let path = path.as_ref();
        let mut tree = self.tree.borrow_mut();
        for dir in path.ancestors().filter(|dir| !dir.as_os_str().is_empty()) {
            tree.dirs.insert(dir.to_owned());
        }
        tree.mounts.insert(path.to_owned());
        tree.files.entry(path.join(TASKS)).or_default();
        drop(tree);
        self
    }

    pub fn put_file(&self, path: impl AsRef<Path>, contents: &str) -> &Self {
        self.tree
            .borrow_mut()
            .files
            .insert(path.as_ref().to_owned(), contents.to_owned());
        self
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.tree.borrow().files.get(path.as_ref()).cloned()
    }

    /// Marks `pid` as a running process.
    pub fn spawn(&self, pid: Pid) -> &Self {
        self.tree.borrow_mut().live.insert(pid);
        self
    }

    pub fn exit(&self, pid: Pid) -> &Self {
        self.tree.borrow_mut().live.remove(&pid);
        self
    }

    /// Reads of `path` fail with `EACCES` from now on.
    pub fn fail_reads_from(&self, path: impl AsRef<Path>) -> &Self {
        self.tree
            .borrow_mut()
            .unreadable
            .insert(path.as_ref().to_owned());
        self
    }

    /// Writes and appends to `path` fail with `EACCES` from now on, leaving it untouched.
    pub fn fail_writes_to(&self, path: impl AsRef<Path>) -> &Self {
        self.tree
            .borrow_mut()
            .unwritable
            .insert(path.as_ref().to_owned());
        self
    }

    /// Every path successfully written or appended to, in order.
    pub fn writes(&self) -> Vec<PathBuf> {
        self.tree.borrow().writes.clone()
    }

    fn writable(tree: &Tree, path: &Path) -> io::Result<()> {
        if tree.unwritable.contains(path) {
            return Err(denied());
        }
        match path.parent() {
            Some(parent) if tree.dirs.contains(parent) => Ok(()),
            _ => Err(not_found(path)),
        }
    }
}

impl Tree {
    fn hierarchy(&self, path: &Path) -> Option<PathBuf> {
        self.mounts
            .iter()
            .filter(|mount| path.starts_with(mount))
            .max_by_key(|mount| mount.components().count())
            .cloned()
    }

    /// Drops the pids in `contents` from every other `tasks` file of the hierarchy `path` is in.
    fn migrate(&mut self, path: &Path, contents: &str) {
        if path.file_name().map_or(true, |name| name != TASKS) {
            return;
        }
        let hierarchy = match self.hierarchy(path) {
            Some(hierarchy) => hierarchy,
            None => return,
        };
        let moved: Vec<&str> = contents.split_whitespace().collect();

        for (file, tasks) in self.files.iter_mut() {
            if file == path
                || file.file_name().map_or(true, |name| name != TASKS)
                || !file.starts_with(&hierarchy)
            {
                continue;
            }

            let kept: String = tasks
                .lines()
                .filter(|pid| !moved.contains(pid))
                .map(|pid| format!("{}\n", pid))
                .collect();
            *tasks = kept;
        }
    }
}

impl ControlFs for MemFs {
    fn is_dir(&self, path: &Path) -> bool {
        self.tree.borrow().dirs.contains(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.borrow_mut();
        if tree.dirs.contains(path) || tree.files.contains_key(path) {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        Self::writable(&tree, path)?;

        tree.dirs.insert(path.to_owned());
        tree.files.insert(path.join(TASKS), String::new());
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.borrow_mut();
        if !tree.dirs.contains(path) {
            return Err(not_found(path));
        }

        let has_children = tree
            .dirs
            .iter()
            .any(|dir| dir.parent() == Some(path));
        let has_tasks = tree
            .files
            .get(&path.join(TASKS))
            .map_or(false, |tasks| !tasks.trim().is_empty());
        if has_children || has_tasks {
            return Err(busy());
        }

        tree.files.retain(|file, _| file.parent() != Some(path));
        tree.dirs.remove(path);
        Ok(())
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        let tree = self.tree.borrow();
        if tree.unreadable.contains(path) {
            return Err(denied());
        }
        tree.files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut tree = self.tree.borrow_mut();
        Self::writable(&tree, path)?;

        tree.writes.push(path.to_owned());
        tree.migrate(path, contents);
        tree.files.insert(path.to_owned(), contents.to_owned());
        Ok(())
    }

    fn append_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut tree = self.tree.borrow_mut();
        Self::writable(&tree, path)?;

        tree.writes.push(path.to_owned());
        tree.migrate(path, contents);
        tree.files
            .entry(path.to_owned())
            .or_default()
            .push_str(contents);
        Ok(())
    }

    fn is_alive(&self, pid: Pid) -> bool {
        self.tree.borrow().live.contains(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cgctl-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&dir).unwrap();
        dir
    }

    #[test]
    fn given_own_pid_then_alive() {
        let pid = Pid::from(std::process::id());
        assert!(SysFs.is_alive(pid));
    }

    #[test]
    fn given_pid_above_pid_max_then_not_alive() {
        let pid_max: u32 = std::fs::read_to_string("/proc/sys/kernel/pid_max")
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(pid_max < i32::MAX as u32);
        assert!(!SysFs.is_alive(Pid::from(pid_max + 1)));
    }

    #[test]
    fn given_pid_zero_then_not_alive() {
        assert!(!SysFs.is_alive(Pid::from(0u32)));
    }

    #[test]
    fn given_out_of_range_pid_then_not_alive() {
        assert!(!SysFs.is_alive(Pid::from(u32::MAX)));
    }

    #[test]
    fn given_scratch_dir_then_sysfs_reads_back_writes() {
        let root = scratch();
        let group = root.join("g1");
        SysFs.create_dir(&group).unwrap();
        assert!(SysFs.is_dir(&group));

        let shares = group.join("cpu.shares");
        SysFs.write_file(&shares, "2048\n").unwrap();
        assert_eq!(SysFs.read_file(&shares).unwrap(), "2048\n");

        let tasks = group.join(TASKS);
        SysFs.append_file(&tasks, "1\n").unwrap();
        SysFs.append_file(&tasks, "2\n").unwrap();
        assert_eq!(SysFs.read_file(&tasks).unwrap(), "1\n2\n");

        let throttle = group.join("blkio.throttle.read_bps_device");
        let records = vec!["8:0 1\n".to_string(), "8:16 2\n".to_string()];
        SysFs.write_records(&throttle, &records).unwrap();
        assert_eq!(SysFs.read_file(&throttle).unwrap(), "8:0 1\n8:16 2\n");

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn given_new_dir_then_memfs_adds_empty_tasks() {
        let fs = MemFs::new();
        fs.mount("/cg/cpu");
        fs.create_dir(Path::new("/cg/cpu/g1")).unwrap();

        assert!(fs.is_dir(Path::new("/cg/cpu/g1")));
        assert_eq!(fs.file("/cg/cpu/g1/tasks"), Some(String::new()));
        assert!(fs.writes().is_empty());
    }

    #[test]
    fn given_missing_parent_then_memfs_create_fails() {
        let fs = MemFs::new();
        let err = fs.create_dir(Path::new("/cg/cpu/g1")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn given_existing_file_then_memfs_create_fails() {
        let fs = MemFs::new();
        fs.mount("/cg").put_file("/cg/g1", "");
        let err = fs.create_dir(Path::new("/cg/g1")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn given_populated_tasks_then_memfs_remove_is_busy() {
        let fs = MemFs::new();
        fs.mount("/cg/cpu/g1").put_file("/cg/cpu/g1/tasks", "42\n");

        let err = fs.remove_dir(Path::new("/cg/cpu/g1")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::EBUSY as i32));
        assert!(fs.is_dir(Path::new("/cg/cpu/g1")));
    }

    #[test]
    fn given_child_group_then_memfs_remove_is_busy() {
        let fs = MemFs::new();
        fs.mount("/cg/cpu/g1/nested");
        assert!(fs.remove_dir(Path::new("/cg/cpu/g1")).is_err());
    }

    #[test]
    fn given_empty_group_then_memfs_remove_drops_control_files() {
        let fs = MemFs::new();
        fs.mount("/cg/cpu/g1").put_file("/cg/cpu/g1/cpu.shares", "1024\n");

        fs.remove_dir(Path::new("/cg/cpu/g1")).unwrap();
        assert!(!fs.is_dir(Path::new("/cg/cpu/g1")));
        assert_eq!(fs.file("/cg/cpu/g1/cpu.shares"), None);
        assert!(fs.is_dir(Path::new("/cg/cpu")));
    }

    #[test]
    fn given_pid_written_to_tasks_then_it_leaves_sibling_groups_of_that_hierarchy() {
        let fs = MemFs::new();
        fs.mount("/cg/cpu").mount("/cg/memory");
        fs.create_dir(Path::new("/cg/cpu/g1")).unwrap();
        fs.create_dir(Path::new("/cg/memory/g1")).unwrap();
        fs.append_file(Path::new("/cg/cpu/g1/tasks"), "42\n").unwrap();
        fs.append_file(Path::new("/cg/memory/g1/tasks"), "42\n").unwrap();

        fs.append_file(Path::new("/cg/cpu/tasks"), "42\n").unwrap();

        assert_eq!(fs.file("/cg/cpu/g1/tasks"), Some(String::new()));
        assert_eq!(fs.file("/cg/cpu/tasks"), Some("42\n".to_string()));
        assert_eq!(fs.file("/cg/memory/g1/tasks"), Some("42\n".to_string()));
    }

    #[test]
    fn given_failing_paths_then_memfs_denies_and_keeps_contents() {
        let fs = MemFs::new();
        fs.mount("/cg/cpu")
            .put_file("/cg/cpu/cpu.shares", "1024\n")
            .fail_writes_to("/cg/cpu/cpu.shares")
            .fail_reads_from("/cg/cpu/tasks");

        let err = fs
            .write_file(Path::new("/cg/cpu/cpu.shares"), "2048\n")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(fs
            .append_file(Path::new("/cg/cpu/cpu.shares"), "1\n")
            .is_err());
        assert_eq!(fs.file("/cg/cpu/cpu.shares").as_deref(), Some("1024\n"));
        assert!(fs.writes().is_empty());

        let err = fs.read_file(Path::new("/cg/cpu/tasks")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::EACCES as i32));
    }

    #[test]
    fn given_memfs_then_liveness_follows_spawn_and_exit() {
        let fs = MemFs::new();
        let pid = Pid::from(7u32);
        assert!(!fs.is_alive(pid));
        fs.spawn(pid);
        assert!(fs.is_alive(pid));
        fs.exit(pid);
        assert!(!fs.is_alive(pid));
    }
}
