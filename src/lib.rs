//! zygote-rs: a Zygote-forking sandbox daemon
//!
//! A long-lived parent sandbox (a Zygote) pre-imports a working set
//! of interpreter packages; leaf sandboxes are forked from the
//! best-matching ancestor instead of cold-starting an interpreter.
//! Built for short-lived serverless workloads where cold-start
//! latency and per-sandbox memory dominate.
//!
//! # Modules
//!
//! - **sandbox**: one container: stacked bind mounts, runtime
//!   process, HTTP-over-UDS client, ref-counted parent/child forest
//! - **cache**: the import-cache trie that picks and lazily
//!   materializes Zygotes
//! - **evictor**: priority-queued reclaimer of idle sandboxes
//! - **mempool**: shared memory budget
//! - **manager**: daemon-side registry and lifecycle entry points
//! - **packages**: interfaces to the in-sandbox package installer
//! - **protocol**: control-plane record framing
//!
//! Linux only: cgroup v2, bind mounts, chroot, and `SCM_RIGHTS`
//! descriptor passing are load-bearing.

pub mod cache;
pub mod events;
pub mod evictor;
pub mod manager;
pub mod mempool;
pub mod packages;
pub mod protocol;
pub mod sandbox;

pub use cache::{CacheNode, ImportCache};
pub use events::{EventKind, SandboxEvent};
pub use evictor::Evictor;
pub use manager::{Manager, SandboxInfo};
pub use mempool::MemPool;
pub use sandbox::{Sandbox, SandboxState};
pub use zygote_core::{DaemonConfig, Meta, Result, Runtime, ZygoteError};
