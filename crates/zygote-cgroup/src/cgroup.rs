//! A single child cgroup: freezer, limits, PID enrolment, teardown

use crossbeam_channel::Sender;
use log::debug;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use zygote_core::{Result, ZygoteError};

/// Ceiling on the freezer spin-poll
const FREEZE_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between freezer state reads
const FREEZE_POLL: Duration = Duration::from_millis(1);
/// rmdir / empty-procs retry budget
pub(crate) const RMDIR_RETRIES: u32 = 100;
pub(crate) const RMDIR_RETRY_DELAY: Duration = Duration::from_millis(5);

const MB: u64 = 1024 * 1024;

/// One child cgroup under a pool's subtree.
///
/// Holds the recycle channel of its pool so `release` can hand the
/// cgroup back instead of destroying it.
#[derive(Debug)]
pub struct Cgroup {
    name: String,
    group_path: PathBuf,
    mem_limit_mb: AtomicU32,
    recycle: Sender<Cgroup>,
}

impl Cgroup {
    pub(crate) fn new(name: String, pool_path: &PathBuf, recycle: Sender<Cgroup>) -> Result<Self> {
        let group_path = pool_path.join(&name);
        fs::create_dir(&group_path).map_err(|e| ZygoteError::CgroupIo {
            cgroup: group_path.display().to_string(),
            reason: format!("mkdir: {}", e),
        })?;
        debug!("created [CGROUP {}]", name);
        Ok(Self {
            name,
            group_path,
            mem_limit_mb: AtomicU32::new(0),
            recycle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_path(&self) -> &PathBuf {
        &self.group_path
    }

    /// Path to a resource file inside this cgroup
    pub fn resource_path(&self, resource: &str) -> PathBuf {
        self.group_path.join(resource)
    }

    /// Path to this cgroup's `cgroup.procs` file
    pub fn procs_path(&self) -> PathBuf {
        self.resource_path("cgroup.procs")
    }

    /// Open `cgroup.procs` for writing, e.g. to hand the fd to a
    /// child process or a fork peer
    pub fn open_procs_file(&self) -> Result<File> {
        let path = self.procs_path();
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| ZygoteError::CgroupIo {
                cgroup: self.group_path.display().to_string(),
                reason: format!("open {}: {}", path.display(), e),
            })
    }

    fn io_err(&self, reason: String) -> ZygoteError {
        ZygoteError::CgroupIo {
            cgroup: self.group_path.display().to_string(),
            reason,
        }
    }

    fn write_resource(&self, resource: &str, content: &str) -> Result<()> {
        let path = self.resource_path(resource);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| self.io_err(format!("open {}: {}", resource, e)))?;
        file.write_all(content.as_bytes())
            .map_err(|e| self.io_err(format!("write {} to {}: {}", content, resource, e)))
    }

    pub fn try_write_int(&self, resource: &str, val: i64) -> Result<()> {
        self.write_resource(resource, &val.to_string())
    }

    pub fn try_write_string(&self, resource: &str, val: &str) -> Result<()> {
        self.write_resource(resource, val)
    }

    pub fn try_read_int(&self, resource: &str) -> Result<i64> {
        let path = self.resource_path(resource);
        let raw =
            fs::read_to_string(&path).map_err(|e| self.io_err(format!("read {}: {}", resource, e)))?;
        raw.trim()
            .parse::<i64>()
            .map_err(|e| self.io_err(format!("parse {}: {}", resource, e)))
    }

    fn set_freeze_state(&self, state: i64) -> Result<()> {
        self.try_write_int("cgroup.freeze", state)?;

        let start = Instant::now();
        loop {
            let observed = self.try_read_int("cgroup.freeze")?;
            if observed == state {
                return Ok(());
            }
            if start.elapsed() > FREEZE_TIMEOUT {
                return Err(ZygoteError::FreezeTimeout {
                    cgroup: self.group_path.display().to_string(),
                    timeout_ms: FREEZE_TIMEOUT.as_millis() as u64,
                });
            }
            thread::sleep(FREEZE_POLL);
        }
    }

    /// Freeze every process in the cgroup
    pub fn pause(&self) -> Result<()> {
        self.set_freeze_state(1)
    }

    /// Thaw the cgroup
    pub fn unpause(&self) -> Result<()> {
        self.set_freeze_state(0)
    }

    /// Memory usage in MB, rounded up
    pub fn mem_usage_mb(&self) -> Result<u32> {
        let usage = self.try_read_int("memory.current")? as u64;
        Ok(((usage + MB - 1) / MB) as u32)
    }

    pub fn mem_limit_mb(&self) -> u32 {
        self.mem_limit_mb.load(Ordering::SeqCst)
    }

    /// Set `memory.max`, reading the limit back. The kernel may round
    /// the value, so anything within 1 MiB of the request is accepted.
    pub fn set_mem_limit_mb(&self, mb: u32) -> Result<()> {
        if mb == self.mem_limit_mb.load(Ordering::SeqCst) {
            return Ok(());
        }

        let bytes = mb as i64 * MB as i64;
        self.try_write_int("memory.max", bytes)?;

        let observed = self.try_read_int("memory.max")?;
        let diff = observed - bytes;
        if !(-(MB as i64)..=MB as i64).contains(&diff) {
            return Err(self.io_err(format!(
                "memory.max set to {} but kernel reports {} (beyond 1MB tolerance)",
                bytes, observed
            )));
        }

        self.mem_limit_mb.store(mb, Ordering::SeqCst);
        Ok(())
    }

    /// Limit to a percentage of one core
    pub fn set_cpu_percent(&self, percent: u32) -> Result<()> {
        let period = 100_000u32;
        let quota = period / 100 * percent;
        self.try_write_string("cpu.max", &format!("{} {}", quota, period))
    }

    /// Enrol a PID. Every write to `cgroup.procs` adds one process,
    /// so this appends rather than replacing.
    pub fn add_pid(&self, pid: &str) -> Result<()> {
        let path = self.procs_path();
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| self.io_err(format!("open cgroup.procs: {}", e)))?;
        file.write_all(format!("{}\n", pid).as_bytes())
            .map_err(|e| self.io_err(format!("enrol pid {}: {}", pid, e)))
    }

    /// All PIDs currently in the cgroup
    pub fn pids(&self) -> Result<Vec<String>> {
        let raw = fs::read_to_string(self.procs_path())
            .map_err(|e| self.io_err(format!("read cgroup.procs: {}", e)))?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        Ok(trimmed.lines().map(|s| s.to_string()).collect())
    }

    /// Kill every process in the cgroup. The cgroup should be frozen
    /// first so nothing new is spawned mid-kill.
    pub fn kill_all_procs(&self) -> Result<()> {
        self.try_write_int("cgroup.kill", 1)
    }

    /// Return the cgroup to the pool's recycle queue, or destroy it
    /// if the queue is full. The cgroup must be empty of processes.
    pub fn release(self) -> Result<()> {
        for attempt in (0..=RMDIR_RETRIES).rev() {
            let pids = self.pids()?;
            if pids.is_empty() {
                break;
            }
            if attempt == 0 {
                return Err(ZygoteError::CgroupBusy {
                    cgroup: self.group_path.display().to_string(),
                });
            }
            debug!(
                "[CGROUP {}] still has {} procs, retrying in 5ms",
                self.name,
                pids.len()
            );
            thread::sleep(RMDIR_RETRY_DELAY);
        }

        match self.recycle.clone().try_send(self) {
            Ok(()) => Ok(()),
            Err(err) => {
                let cg = err.into_inner();
                debug!("[CGROUP {}] recycle queue full, destroying", cg.name);
                cg.destroy()
            }
        }
    }

    /// Remove the cgroup directory, retrying around transient EBUSY
    /// from late kernel bookkeeping
    pub fn destroy(self) -> Result<()> {
        debug!(
            "[CGROUP {}] destroying {}",
            self.name,
            self.group_path.display()
        );
        for attempt in (0..=RMDIR_RETRIES).rev() {
            match fs::remove_dir(&self.group_path) {
                Ok(()) => return Ok(()),
                Err(_) if attempt > 0 => thread::sleep(RMDIR_RETRY_DELAY),
                Err(_) => {
                    return Err(ZygoteError::CgroupBusy {
                        cgroup: self.group_path.display().to_string(),
                    })
                }
            }
        }
        unreachable!("rmdir retry loop always returns");
    }

    /// Build a Cgroup over an arbitrary directory (for testing)
    #[doc(hidden)]
    pub fn for_testing(path: PathBuf) -> Self {
        // disconnected recycle channel: release always destroys
        let (tx, _) = crossbeam_channel::bounded(1);
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            group_path: path,
            mem_limit_mb: AtomicU32::new(0),
            recycle: tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn prepare_cgroup_dir() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cg-1");
        fs::create_dir_all(&path).unwrap();
        for (file, content) in [
            ("cgroup.freeze", "0"),
            ("cgroup.procs", ""),
            ("memory.max", "0"),
            ("memory.current", "0"),
            ("cpu.max", "max 100000"),
        ] {
            fs::write(path.join(file), content).unwrap();
        }
        (tmp, path)
    }

    #[test]
    fn test_pause_unpause_round_trip() {
        let (_tmp, path) = prepare_cgroup_dir();
        let cg = Cgroup::for_testing(path.clone());
        cg.pause().unwrap();
        assert_eq!(fs::read_to_string(path.join("cgroup.freeze")).unwrap(), "1");
        cg.unpause().unwrap();
        assert_eq!(fs::read_to_string(path.join("cgroup.freeze")).unwrap(), "0");
    }

    #[test]
    fn test_mem_limit_read_back_within_tolerance() {
        let (_tmp, path) = prepare_cgroup_dir();
        let cg = Cgroup::for_testing(path.clone());
        cg.set_mem_limit_mb(64).unwrap();
        assert_eq!(
            fs::read_to_string(path.join("memory.max")).unwrap().trim(),
            (64u64 * 1024 * 1024).to_string()
        );
        assert_eq!(cg.mem_limit_mb(), 64);
    }

    #[test]
    fn test_mem_limit_same_value_is_noop() {
        let (_tmp, path) = prepare_cgroup_dir();
        let cg = Cgroup::for_testing(path.clone());
        cg.set_mem_limit_mb(64).unwrap();
        // scribble over the file; an equal-value set must not rewrite it
        fs::write(path.join("memory.max"), "sentinel").unwrap();
        cg.set_mem_limit_mb(64).unwrap();
        assert_eq!(
            fs::read_to_string(path.join("memory.max")).unwrap(),
            "sentinel"
        );
    }

    #[test]
    fn test_mem_usage_rounds_up() {
        let (_tmp, path) = prepare_cgroup_dir();
        fs::write(path.join("memory.current"), "1048577").unwrap();
        let cg = Cgroup::for_testing(path);
        assert_eq!(cg.mem_usage_mb().unwrap(), 2);
    }

    #[test]
    fn test_cpu_percent_quota_format() {
        let (_tmp, path) = prepare_cgroup_dir();
        let cg = Cgroup::for_testing(path.clone());
        cg.set_cpu_percent(50).unwrap();
        assert_eq!(
            fs::read_to_string(path.join("cpu.max")).unwrap(),
            "50000 100000"
        );
    }

    #[test]
    fn test_pids_empty_and_parsed() {
        let (_tmp, path) = prepare_cgroup_dir();
        let cg = Cgroup::for_testing(path.clone());
        assert!(cg.pids().unwrap().is_empty());
        fs::write(path.join("cgroup.procs"), "12\n34\n").unwrap();
        assert_eq!(cg.pids().unwrap(), vec!["12", "34"]);
    }

    #[test]
    fn test_release_refuses_occupied_cgroup() {
        let (_tmp, path) = prepare_cgroup_dir();
        fs::write(path.join("cgroup.procs"), "999\n").unwrap();
        let cg = Cgroup::for_testing(path);
        let err = cg.release().unwrap_err();
        assert!(matches!(err, ZygoteError::CgroupBusy { .. }));
    }

    #[test]
    fn test_destroy_removes_empty_dir() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cg-gone");
        fs::create_dir(&path).unwrap();
        let cg = Cgroup::for_testing(path.clone());
        cg.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_destroy_busy_dir_errors() {
        let (_tmp, path) = prepare_cgroup_dir();
        let cg = Cgroup::for_testing(path.clone());
        let err = cg.destroy().unwrap_err();
        assert!(matches!(err, ZygoteError::CgroupBusy { .. }));
        assert!(path.exists());
    }
}
