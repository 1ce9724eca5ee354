//! Shared memory budget for all sandboxes in a pool

use log::{debug, warn};
use std::sync::atomic::{AtomicI64, Ordering};
use zygote_core::{Result, ZygoteError};

/// Named memory budget. `available_mb` is what remains after every
/// live sandbox's current cgroup limit is accounted for; pausing a
/// sandbox tightens its limit and credits the difference back.
pub struct MemPool {
    name: String,
    total_mb: u32,
    available_mb: AtomicI64,
}

impl MemPool {
    pub fn new(name: &str, total_mb: u32) -> Self {
        Self {
            name: name.to_string(),
            total_mb,
            available_mb: AtomicI64::new(total_mb as i64),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_mb(&self) -> u32 {
        self.total_mb
    }

    pub fn available_mb(&self) -> i64 {
        self.available_mb.load(Ordering::SeqCst)
    }

    /// Debit `mb` for a new sandbox; fails without side effect when
    /// the budget is exhausted
    pub fn reserve(&self, mb: u32) -> Result<()> {
        let res = self
            .available_mb
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |avail| {
                if avail >= mb as i64 {
                    Some(avail - mb as i64)
                } else {
                    None
                }
            });
        match res {
            Ok(_) => Ok(()),
            Err(avail) => {
                warn!(
                    "[MEM POOL {}] {} MB requested, {} available",
                    self.name, mb, avail
                );
                Err(ZygoteError::PoolExhausted {
                    pool: self.name.clone(),
                    requested_mb: mb,
                })
            }
        }
    }

    /// Debit that always succeeds: the caller is restoring a limit it
    /// already owned (unpause), so availability may transiently read
    /// below zero, which only makes the evictor more eager.
    pub fn debit_forced(&self, mb: u32) {
        let prev = self.available_mb.fetch_sub(mb as i64, Ordering::SeqCst);
        debug!(
            "[MEM POOL {}] forced debit {} MB ({} left)",
            self.name,
            mb,
            prev - mb as i64
        );
    }

    /// Return `mb` to the budget
    pub fn credit(&self, mb: u32) {
        self.available_mb.fetch_add(mb as i64, Ordering::SeqCst);
    }
}
