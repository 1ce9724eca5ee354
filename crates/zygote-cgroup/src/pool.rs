//! Pool of pre-created cgroups under one named subtree

use crate::cgroup::{Cgroup, RMDIR_RETRIES, RMDIR_RETRY_DELAY};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use zygote_core::{Result, ZygoteError};

/// If fewer than this many cgroups are ready, more are created
pub const CGROUP_RESERVE: usize = 16;

const CGROUP_FS_ROOT: &str = "/sys/fs/cgroup";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";
const CONTROLLERS: &str = "+pids +io +memory +cpu";

fn cgroup_fs_root() -> PathBuf {
    env::var("ZYGOTE_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CGROUP_FS_ROOT))
}

/// A named cgroup v2 subtree with a background task that keeps a
/// bounded reserve of ready-to-use child cgroups.
pub struct CgroupPool {
    name: String,
    group_path: PathBuf,
    ready: Receiver<Cgroup>,
    recycle: Sender<Cgroup>,
    quit: Option<Sender<Sender<()>>>,
    task: Option<thread::JoinHandle<()>>,
}

impl CgroupPool {
    /// Create `<fs-root>/<host-scope>-<name>`, enable the controllers
    /// for child groups, and start the background producer.
    pub fn new(name: &str) -> Result<Self> {
        let scope = env::current_dir()
            .ok()
            .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "host".to_string());
        let full_name = format!("{}-{}", scope, name);
        let group_path = cgroup_fs_root().join(&full_name);

        info!("create [CGROUP POOL {}] at {}", full_name, group_path.display());
        fs::create_dir(&group_path).map_err(|e| ZygoteError::PoolInit {
            pool: full_name.clone(),
            reason: format!("mkdir {}: {}", group_path.display(), e),
        })?;
        fs::write(group_path.join(SUBTREE_CONTROL), CONTROLLERS).map_err(|e| {
            ZygoteError::PoolInit {
                pool: full_name.clone(),
                reason: format!("enable controllers: {}", e),
            }
        })?;

        let (ready_tx, ready_rx) = bounded(CGROUP_RESERVE);
        let (recycle_tx, recycle_rx) = bounded(CGROUP_RESERVE);
        let (quit_tx, quit_rx) = bounded(1);

        let worker = PoolWorker {
            pool_name: full_name.clone(),
            group_path: group_path.clone(),
            ready_tx,
            ready_rx: ready_rx.clone(),
            recycle_tx: recycle_tx.clone(),
            recycle_rx,
            quit_rx,
        };
        let task = thread::spawn(move || worker.run());

        Ok(Self {
            name: full_name,
            group_path,
            ready: ready_rx,
            recycle: recycle_tx,
            quit: Some(quit_tx),
            task: Some(task),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_path(&self) -> &PathBuf {
        &self.group_path
    }

    /// Dequeue a ready cgroup, waiting at most `timeout`
    pub fn retrieve(&self, timeout: Duration) -> Result<Cgroup> {
        self.ready
            .recv_timeout(timeout)
            .map_err(|_| ZygoteError::RetrieveTimeout {
                pool: self.name.clone(),
            })
    }

    /// Shut the background task down, drain both queues, and remove
    /// the pool's subtree directory.
    pub fn destroy(mut self) -> Result<()> {
        if let Some(quit) = self.quit.take() {
            let (ack_tx, ack_rx) = bounded(1);
            if quit.send(ack_tx).is_ok() {
                let _ = ack_rx.recv();
            }
        }
        if let Some(task) = self.task.take() {
            let _ = task.join();
        }

        info!(
            "destroying [CGROUP POOL {}] at {}",
            self.name,
            self.group_path.display()
        );
        for attempt in (0..=RMDIR_RETRIES).rev() {
            match fs::remove_dir(&self.group_path) {
                Ok(()) => return Ok(()),
                Err(_) if attempt > 0 => thread::sleep(RMDIR_RETRY_DELAY),
                Err(e) => {
                    warn!("[CGROUP POOL {}] rmdir failed: {}", self.name, e);
                    return Err(ZygoteError::CgroupBusy {
                        cgroup: self.group_path.display().to_string(),
                    });
                }
            }
        }
        unreachable!("rmdir retry loop always returns");
    }

    /// Pool over an arbitrary directory with no background producer,
    /// so `retrieve` sees exactly what tests enqueue (for testing)
    #[doc(hidden)]
    pub fn for_testing(path: PathBuf) -> (Self, Sender<Cgroup>) {
        let (ready_tx, ready_rx) = bounded(CGROUP_RESERVE);
        let (recycle_tx, _) = bounded(CGROUP_RESERVE);
        let pool = Self {
            name: "test".to_string(),
            group_path: path,
            ready: ready_rx,
            recycle: recycle_tx,
            quit: None,
            task: None,
        };
        (pool, ready_tx)
    }

    #[doc(hidden)]
    pub fn recycle_sender(&self) -> Sender<Cgroup> {
        self.recycle.clone()
    }
}

struct PoolWorker {
    pool_name: String,
    group_path: PathBuf,
    ready_tx: Sender<Cgroup>,
    ready_rx: Receiver<Cgroup>,
    recycle_tx: Sender<Cgroup>,
    recycle_rx: Receiver<Cgroup>,
    quit_rx: Receiver<Sender<()>>,
}

impl PoolWorker {
    fn run(self) {
        debug!("[CGROUP POOL {}] start creating/serving cgroups", self.pool_name);
        let mut next_id: u64 = 0;
        let done: Sender<()>;

        'serve: loop {
            // Prefer a recycled cgroup; otherwise mint a fresh one.
            // Fresh cgroups get the settings that never change;
            // recycled ones only need thawing. Per-sandbox settings
            // (memory limits) are applied by the consumer.
            let mut cg = match self.recycle_rx.try_recv() {
                Ok(cg) => {
                    if let Err(e) = cg.unpause() {
                        warn!("[CGROUP POOL {}] unpause recycled: {}", self.pool_name, e);
                    }
                    cg
                }
                Err(_) => {
                    next_id += 1;
                    let name = format!("cg-{}", next_id);
                    match Cgroup::new(name, &self.group_path, self.recycle_tx.clone()) {
                        Ok(cg) => {
                            if let Err(e) = cg
                                .try_write_int("pids.max", 10)
                                .and_then(|_| cg.try_write_int("memory.swap.max", 0))
                            {
                                error!("[CGROUP POOL {}] init cgroup: {}", self.pool_name, e);
                            }
                            cg
                        }
                        Err(e) => {
                            error!("[CGROUP POOL {}] create cgroup: {}", self.pool_name, e);
                            thread::sleep(Duration::from_millis(10));
                            continue;
                        }
                    }
                }
            };

            // enqueue onto ready, watching for the shutdown request
            loop {
                if let Ok(ack) = self.quit_rx.try_recv() {
                    debug!("[CGROUP POOL {}] received shutdown request", self.pool_name);
                    if let Err(e) = cg.destroy() {
                        warn!("[CGROUP POOL {}] destroy on shutdown: {}", self.pool_name, e);
                    }
                    done = ack;
                    break 'serve;
                }
                match self.ready_tx.send_timeout(cg, Duration::from_millis(50)) {
                    Ok(()) => break,
                    Err(crossbeam_channel::SendTimeoutError::Timeout(returned)) => cg = returned,
                    Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                        // all receivers dropped; nothing left to serve
                        return;
                    }
                }
            }
        }

        // empty both queues, freeing every cgroup
        debug!("[CGROUP POOL {}] draining queues", self.pool_name);
        loop {
            let cg = match self.ready_rx.try_recv() {
                Ok(cg) => cg,
                Err(_) => match self.recycle_rx.try_recv() {
                    Ok(cg) => cg,
                    Err(_) => break,
                },
            };
            if let Err(e) = cg.destroy() {
                warn!("[CGROUP POOL {}] destroy on drain: {}", self.pool_name, e);
            }
        }

        let _ = done.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_retrieve_zero_timeout_on_empty_pool() {
        let tmp = tempdir().unwrap();
        let (pool, _ready) = CgroupPool::for_testing(tmp.path().to_path_buf());
        let err = pool.retrieve(Duration::from_millis(0)).unwrap_err();
        assert!(matches!(err, ZygoteError::RetrieveTimeout { .. }));
    }

    #[test]
    fn test_retrieve_returns_enqueued_cgroup() {
        let tmp = tempdir().unwrap();
        let cg_dir = tmp.path().join("cg-7");
        fs::create_dir(&cg_dir).unwrap();
        let (pool, ready) = CgroupPool::for_testing(tmp.path().to_path_buf());
        ready.send(Cgroup::for_testing(cg_dir)).unwrap();
        let cg = pool.retrieve(Duration::from_millis(10)).unwrap();
        assert_eq!(cg.name(), "cg-7");
    }

    // Everything below needs a writable cgroup v2 fs; run with:
    //   sudo cargo test -- --ignored

    #[test]
    #[ignore]
    fn pool_produces_and_destroys() {
        let pool = CgroupPool::new("pool-test").unwrap();
        let cg = pool.retrieve(Duration::from_secs(1)).unwrap();
        assert!(cg.pids().unwrap().is_empty());
        cg.destroy().unwrap();
        pool.destroy().unwrap();
    }

    #[test]
    #[ignore]
    fn pool_recycles_released_cgroups() {
        let pool = CgroupPool::new("pool-recycle-test").unwrap();
        let cg = pool.retrieve(Duration::from_secs(1)).unwrap();
        let name = cg.name().to_string();
        cg.release().unwrap();
        // the recycled cgroup comes back around eventually
        let mut seen = false;
        for _ in 0..CGROUP_RESERVE * 2 {
            let cg = pool.retrieve(Duration::from_secs(1)).unwrap();
            let matched = cg.name() == name;
            cg.destroy().unwrap();
            if matched {
                seen = true;
                break;
            }
        }
        assert!(seen);
        pool.destroy().unwrap();
    }
}
