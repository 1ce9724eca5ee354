//! Lifecycle events flowing from sandboxes to the evictor

use crate::sandbox::Sandbox;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;

/// Depth of the evictor's event queue
pub const EVENT_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Pause,
    Unpause,
    Fork,
    ChildExit,
    Destroy,
    /// Internal to the evictor: a non-forced eviction declined
    /// because the sandbox was not paused
    EvictionSkipped,
}

#[derive(Clone)]
pub struct SandboxEvent {
    pub kind: EventKind,
    pub sandbox: Arc<Sandbox>,
}

pub type EventSender = Sender<SandboxEvent>;
pub type EventReceiver = Receiver<SandboxEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    bounded(EVENT_QUEUE_DEPTH)
}
