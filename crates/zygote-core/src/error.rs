//! Error types for sandbox operations

use std::io;
use thiserror::Error;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, ZygoteError>;

/// Errors that can occur across the sandbox lifecycle
#[derive(Error, Debug)]
pub enum ZygoteError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("cgroup pool {pool} init failed: {reason}")]
    PoolInit { pool: String, reason: String },

    #[error("cgroup {cgroup}: {reason}")]
    CgroupIo { cgroup: String, reason: String },

    #[error("cgroup {cgroup} still busy after rmdir retries")]
    CgroupBusy { cgroup: String },

    #[error("cgroup {cgroup} freezer stuck for over {timeout_ms}ms")]
    FreezeTimeout { cgroup: String, timeout_ms: u64 },

    #[error("mount {target} failed: {reason}")]
    MountFailed { target: String, reason: String },

    #[error("sandbox {sandbox}: bootstrap template produced no code")]
    EmptyBootstrap { sandbox: String },

    #[error("socket path {path} is {len} bytes (limit 108)")]
    SockPathTooLong { path: String, len: usize },

    #[error("sandbox {sandbox} has only {spare_mb} MB spare, fork needs {needed_mb}")]
    ForkInsufficientSpare {
        sandbox: String,
        spare_mb: i64,
        needed_mb: i64,
    },

    #[error("fork from sandbox {sandbox} failed: {reason}")]
    ForkProtocol { sandbox: String, reason: String },

    #[error("no Zygote found for the requested package set")]
    NoZygote,

    #[error("sandbox {sandbox}: ref-count went negative")]
    RefCountUnderflow { sandbox: String },

    #[error("timeout waiting to retrieve cgroup from pool {pool}")]
    RetrieveTimeout { pool: String },

    #[error("unsupported runtime: {runtime}")]
    Unsupported { runtime: String },

    #[error("memory pool {pool} exhausted ({requested_mb} MB requested)")]
    PoolExhausted { pool: String, requested_mb: u32 },

    #[error("sandbox {id} not found")]
    SandboxNotFound { id: String },

    #[error("sandbox {sandbox} comms: {reason}")]
    Comms { sandbox: String, reason: String },

    #[error("sandbox {sandbox} is {state}, cannot {op}")]
    InvalidState {
        sandbox: String,
        state: String,
        op: String,
    },

    #[error("control protocol: {0}")]
    Protocol(String),

    #[error("package {pkg}: {reason}")]
    Package { pkg: String, reason: String },
}
