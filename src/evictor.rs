//! Priority-queued memory reclaimer
//!
//! Sandboxes are ranked by `2 * children + (1 if running)`. Paused
//! childless leaves (priority 0) go first; running leaves (priority
//! 1) only as a last resort; anything with live children (priority
//! 2+) is never picked, because no memory comes back until every
//! descendant exits anyway.

use crate::events::{EventKind, EventReceiver, EventSender, SandboxEvent};
use crate::mempool::MemPool;
use crate::sandbox::Sandbox;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;

/// Fraction of sandbox slots to keep free, in percent
pub const FREE_SANDBOXES_PERCENT_GOAL: i64 = 20;
/// Cap on in-flight evictions
pub const CONCURRENT_EVICTIONS: usize = 8;

const NUM_PRIO_QUEUES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Prio(usize),
    Evicting,
}

/// Event-driven state machine behind the evictor task. Separated
/// from the thread so the policy can be driven synchronously.
pub(crate) struct EvictorCore {
    mem: Arc<MemPool>,
    events_tx: EventSender,
    priority: HashMap<String, i32>,
    prio_queues: [VecDeque<String>; NUM_PRIO_QUEUES],
    evicting: VecDeque<String>,
    handles: HashMap<String, Arc<Sandbox>>,
}

impl EvictorCore {
    fn new(mem: Arc<MemPool>, events_tx: EventSender) -> Self {
        Self {
            mem,
            events_tx,
            priority: HashMap::new(),
            prio_queues: Default::default(),
            evicting: VecDeque::new(),
            handles: HashMap::new(),
        }
    }

    /// Apply one lifecycle event. Priorities never go negative; a
    /// trace that would drive one below zero is a bug in the caller.
    pub(crate) fn handle_event(&mut self, event: SandboxEvent) {
        let id = event.sandbox.id().to_string();
        let mut prio = self.priority.get(&id).copied().unwrap_or(0);

        match event.kind {
            EventKind::Start => {
                if prio != 0 {
                    panic!(
                        "sandbox {} started at priority {} (must be 0)",
                        id, prio
                    );
                }
                prio += 1;
            }
            EventKind::Unpause => prio += 1,
            EventKind::Pause => prio -= 1,
            EventKind::Fork => prio += 2,
            EventKind::ChildExit => prio -= 2,
            EventKind::Destroy | EventKind::EvictionSkipped => {}
        }
        if prio < 0 {
            panic!("sandbox {} priority went to {}", id, prio);
        }

        match event.kind {
            EventKind::Destroy => {
                self.relocate(&id, None);
                self.priority.remove(&id);
                self.handles.remove(&id);
            }
            EventKind::EvictionSkipped => {
                // the victim turned out not to be paused; put it back
                if self.priority.contains_key(&id) {
                    let queue = (prio as usize).min(NUM_PRIO_QUEUES - 1);
                    self.relocate(&id, Some(Location::Prio(queue)));
                }
            }
            _ => {
                debug!("[EVICTOR] sandbox {} priority goes to {}", id, prio);
                self.priority.insert(id.clone(), prio);
                self.handles.insert(id.clone(), Arc::clone(&event.sandbox));
                let queue = (prio as usize).min(NUM_PRIO_QUEUES - 1);
                self.relocate(&id, Some(Location::Prio(queue)));
            }
        }
    }

    /// Pick 0 or more victims (policy), then destroy them
    /// asynchronously (mechanism)
    pub(crate) fn do_evictions(&mut self) {
        let total_mb = self.mem.total_mb() as i64;
        let mem_limit_mb = (total_mb / 2).max(1);

        // how many sandboxes could start right now vs. how many we
        // want to always have room for
        let free_sandboxes = self.mem.available_mb() / mem_limit_mb;
        let free_goal = 1 + (total_mb / mem_limit_mb - 2) * FREE_SANDBOXES_PERCENT_GOAL / 100;

        let mut evict_count = free_goal - free_sandboxes;
        let evict_cap = CONCURRENT_EVICTIONS as i64 - self.evicting.len() as i64;
        evict_count = evict_count.min(evict_cap);

        while evict_count > 0 && !self.prio_queues[0].is_empty() {
            self.evict_front(0, false);
            evict_count -= 1;
        }

        // evicting a running sandbox interrupts a live request, but a
        // wedged fleet is worse
        if free_sandboxes <= 0 && self.evicting.is_empty() {
            warn!("[EVICTOR] critically low on memory, evicting an active sandbox");
            if !self.prio_queues[1].is_empty() {
                self.evict_front(1, true);
            }
        }
    }

    fn evict_front(&mut self, queue: usize, force: bool) {
        let id = match self.prio_queues[queue].front() {
            Some(id) => id.clone(),
            None => return,
        };
        let sandbox = match self.handles.get(&id) {
            Some(sb) => Arc::clone(sb),
            None => return,
        };
        info!("[EVICTOR] evicting sandbox {}", id);
        self.relocate(&id, Some(Location::Evicting));

        // destroy off-thread; completion arrives as a Destroy event,
        // a decline as EvictionSkipped
        let events_tx = self.events_tx.clone();
        thread::spawn(move || {
            if force {
                if let Err(e) = sandbox.destroy() {
                    warn!("[EVICTOR] destroy {}: {}", sandbox.id(), e);
                }
            } else {
                match sandbox.destroy_if_paused() {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = events_tx.send(SandboxEvent {
                            kind: EventKind::EvictionSkipped,
                            sandbox,
                        });
                    }
                    Err(e) => warn!("[EVICTOR] destroy-if-paused: {}", e),
                }
            }
        });
    }

    /// Move a sandbox to a queue (or out of all of them)
    fn relocate(&mut self, id: &str, target: Option<Location>) {
        for queue in self.prio_queues.iter_mut() {
            queue.retain(|q| q != id);
        }
        self.evicting.retain(|q| q != id);

        match target {
            Some(Location::Prio(i)) => self.prio_queues[i].push_back(id.to_string()),
            Some(Location::Evicting) => self.evicting.push_back(id.to_string()),
            None => {}
        }
    }

    #[cfg(test)]
    fn queue_len(&self, queue: usize) -> usize {
        self.prio_queues[queue].len()
    }

    #[cfg(test)]
    fn evicting_len(&self) -> usize {
        self.evicting.len()
    }
}

/// The long-lived reclaimer task. Sandboxes report lifecycle events
/// through the sender; the task reshuffles its queues and evicts
/// when free memory drops under the goal.
pub struct Evictor {
    events_tx: EventSender,
    quit: Sender<Sender<()>>,
    task: Option<thread::JoinHandle<()>>,
}

impl Evictor {
    pub fn new(mem: Arc<MemPool>) -> Evictor {
        let (events_tx, events_rx) = crate::events::event_channel();
        let (quit_tx, quit_rx) = bounded(1);
        let core = EvictorCore::new(mem, events_tx.clone());
        let task = thread::spawn(move || run(core, events_rx, quit_rx));
        Evictor {
            events_tx,
            quit: quit_tx,
            task: Some(task),
        }
    }

    /// Sender that sandboxes use to report lifecycle events
    pub fn events(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Stop the task and wait for it to acknowledge
    pub fn shutdown(mut self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.quit.send(ack_tx).is_ok() {
            let _ = ack_rx.recv();
        }
        if let Some(task) = self.task.take() {
            let _ = task.join();
        }
    }
}

fn run(mut core: EvictorCore, events_rx: EventReceiver, quit_rx: Receiver<Sender<()>>) {
    debug!("[EVICTOR] running");
    loop {
        // block until there's at least one update (or shutdown)
        crossbeam_channel::select! {
            recv(events_rx) -> event => {
                let event = match event {
                    Ok(event) => event,
                    Err(_) => return,
                };
                core.handle_event(event);
                // drain whatever else is queued; state may be stale
                // but correctness doesn't depend on freshness
                while let Ok(event) = events_rx.try_recv() {
                    core.handle_event(event);
                }
                core.do_evictions();
            }
            recv(quit_rx) -> ack => {
                debug!("[EVICTOR] shutdown");
                if let Ok(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::sandbox::SandboxState;
    use std::time::Duration;

    fn core_with(total_mb: u32) -> (EvictorCore, Arc<MemPool>, EventReceiver) {
        let mem = Arc::new(MemPool::new("test", total_mb));
        let (tx, rx) = event_channel();
        (EvictorCore::new(Arc::clone(&mem), tx), mem, rx)
    }

    fn event(kind: EventKind, sandbox: &Arc<Sandbox>) -> SandboxEvent {
        SandboxEvent {
            kind,
            sandbox: Arc::clone(sandbox),
        }
    }

    #[test]
    fn test_priority_tracks_lifecycle() {
        let (mut core, _mem, _rx) = core_with(256);
        let sb = Sandbox::for_testing("sb", None);

        core.handle_event(event(EventKind::Start, &sb));
        assert_eq!(core.priority["sb"], 1);
        assert_eq!(core.queue_len(1), 1);

        core.handle_event(event(EventKind::Pause, &sb));
        assert_eq!(core.priority["sb"], 0);
        assert_eq!(core.queue_len(0), 1);

        core.handle_event(event(EventKind::Unpause, &sb));
        core.handle_event(event(EventKind::Fork, &sb));
        assert_eq!(core.priority["sb"], 3);
        // saturates into the sink queue
        assert_eq!(core.queue_len(2), 1);

        core.handle_event(event(EventKind::ChildExit, &sb));
        assert_eq!(core.priority["sb"], 1);

        core.handle_event(event(EventKind::Destroy, &sb));
        assert!(core.priority.is_empty());
        assert_eq!(core.queue_len(0) + core.queue_len(1) + core.queue_len(2), 0);
    }

    #[test]
    #[should_panic(expected = "priority went to")]
    fn test_negative_priority_is_fatal() {
        let (mut core, _mem, _rx) = core_with(256);
        let sb = Sandbox::for_testing("sb", None);
        core.handle_event(event(EventKind::Pause, &sb));
    }

    #[test]
    #[should_panic(expected = "must be 0")]
    fn test_start_requires_zero_priority() {
        let (mut core, _mem, _rx) = core_with(256);
        let sb = Sandbox::for_testing("sb", None);
        core.handle_event(event(EventKind::Start, &sb));
        core.handle_event(event(EventKind::Start, &sb));
    }

    /// 4 paused leaves with plenty of memory: steady state
    #[test]
    fn test_idle_fleet_with_room_is_left_alone() {
        let (mut core, mem, _rx) = core_with(256);
        for i in 0..4 {
            let sb = Sandbox::for_testing(&format!("sb-{}", i), None);
            sb.set_state_for_testing(SandboxState::Paused);
            core.handle_event(event(EventKind::Start, &sb));
            core.handle_event(event(EventKind::Pause, &sb));
        }
        // available 256, memLimit 128: free=2 >= goal=1
        core.do_evictions();
        assert_eq!(core.queue_len(0), 4);
        assert_eq!(core.evicting_len(), 0);

        // a fifth idle leaf eats one slot; free=1 still meets the goal
        let sb = Sandbox::for_testing("sb-4", None);
        sb.set_state_for_testing(SandboxState::Paused);
        core.handle_event(event(EventKind::Start, &sb));
        core.handle_event(event(EventKind::Pause, &sb));
        mem.debit_forced(128);

        core.do_evictions();
        assert_eq!(core.queue_len(0), 5);
        assert_eq!(core.evicting_len(), 0);
    }

    /// Availability under one slot: exactly one idle leaf is evicted
    #[test]
    fn test_memory_pressure_evicts_one_idle_leaf() {
        let (mut core, mem, rx) = core_with(256);
        let mut sandboxes = Vec::new();
        for i in 0..4 {
            let sb = Sandbox::for_testing(&format!("sb-{}", i), Some(core.events_tx.clone()));
            sb.set_state_for_testing(SandboxState::Paused);
            core.handle_event(event(EventKind::Start, &sb));
            core.handle_event(event(EventKind::Pause, &sb));
            sandboxes.push(sb);
        }
        mem.debit_forced(200); // free = 56/128 = 0 < goal

        core.do_evictions();
        assert_eq!(core.evicting_len(), 1);
        assert_eq!(core.queue_len(0), 3);
        // the head of queue 0 was picked
        assert!(core.evicting.contains(&"sb-0".to_string()));

        // the victim was paused, so the async destroy emits Destroy
        let destroyed = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(destroyed.kind, EventKind::Destroy);
        assert_eq!(destroyed.sandbox.id(), "sb-0");
        core.handle_event(destroyed);
        assert_eq!(core.evicting_len(), 0);
    }

    /// All running and no memory: last-resort eviction from queue 1
    #[test]
    fn test_last_resort_evicts_running_leaf() {
        let (mut core, mem, rx) = core_with(256);
        for i in 0..4 {
            let sb = Sandbox::for_testing(&format!("sb-{}", i), Some(core.events_tx.clone()));
            sb.set_state_for_testing(SandboxState::Running);
            core.handle_event(event(EventKind::Start, &sb));
        }
        mem.debit_forced(256); // free = 0

        core.do_evictions();
        assert_eq!(core.evicting_len(), 1);
        assert_eq!(core.queue_len(1), 3);

        let destroyed = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(destroyed.kind, EventKind::Destroy);
        assert_eq!(destroyed.sandbox.id(), "sb-0");
    }

    /// Sandboxes with children are never picked
    #[test]
    fn test_sink_queue_is_never_evicted() {
        let (mut core, mem, _rx) = core_with(256);
        let sb = Sandbox::for_testing("zygote", None);
        core.handle_event(event(EventKind::Start, &sb));
        core.handle_event(event(EventKind::Fork, &sb));
        assert_eq!(core.queue_len(2), 1);

        mem.debit_forced(256);
        core.do_evictions();
        assert_eq!(core.evicting_len(), 0);
        assert_eq!(core.queue_len(2), 1);
    }

    /// A non-forced eviction of a running sandbox bounces back
    #[test]
    fn test_skipped_eviction_reenqueues() {
        let (mut core, mem, rx) = core_with(256);
        // paused by priority accounting, but actually still running
        let sb = Sandbox::for_testing("sb-0", Some(core.events_tx.clone()));
        sb.set_state_for_testing(SandboxState::Running);
        core.handle_event(event(EventKind::Start, &sb));
        core.handle_event(event(EventKind::Pause, &sb));
        mem.debit_forced(256);

        core.do_evictions();
        assert_eq!(core.evicting_len(), 1);

        let skipped = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(skipped.kind, EventKind::EvictionSkipped);
        core.handle_event(skipped);
        assert_eq!(core.evicting_len(), 0);
        assert_eq!(core.queue_len(0), 1);
    }

    #[test]
    fn test_evictor_task_shutdown_acknowledges() {
        let mem = Arc::new(MemPool::new("test", 256));
        let evictor = Evictor::new(mem);
        let _tx = evictor.events();
        evictor.shutdown();
    }
}
