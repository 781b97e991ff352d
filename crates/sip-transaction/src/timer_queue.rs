// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Deadline-ordered scheduler with handle-based cancellation.
//!
//! Tasks live in a slot map keyed by handle id; the binary heap only stores
//! `(deadline, seq, id)` triples. Cancelling removes the slot and leaves the
//! heap entry behind as stale; rescheduling gives the slot a new `seq` so its
//! old heap entry no longer matches. Stale entries are skipped when popped and
//! compacted once they outnumber live ones.
//!
//! One dispatcher task per queue sleeps until the earliest deadline and is
//! woken early when a nearer deadline is inserted. Due tasks run outside the
//! lock, in `(deadline, insertion)` order. They must not block: anything heavy
//! should be handed to a channel or spawned.
//!
//! The queue follows the tokio clock, so paused-time tests are deterministic.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Opaque identity of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

struct Slot {
    seq: u64,
    deadline: Instant,
    task: Task,
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    slots: HashMap<u64, Slot>,
    next_id: u64,
    next_seq: u64,
}

impl State {
    fn live_top(&mut self) -> Option<(Instant, u64, u64)> {
        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            let (_, seq, id) = entry;
            if self.slots.get(&id).is_some_and(|slot| slot.seq == seq) {
                return Some(entry);
            }
            self.heap.pop();
        }
        None
    }

    fn push(&mut self, id: u64, deadline: Instant) -> bool {
        let earliest = self.live_top().map(|(d, _, _)| d);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((deadline, seq, id)));
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.seq = seq;
            slot.deadline = deadline;
        }
        earliest.map_or(true, |current| deadline < current)
    }

    fn take_due(&mut self, now: Instant) -> Vec<Task> {
        let mut due = Vec::new();
        while let Some((deadline, _, id)) = self.live_top() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(slot) = self.slots.remove(&id) {
                due.push(slot.task);
            }
        }
        due
    }

    fn compact(&mut self) {
        if self.heap.len() > self.slots.len() * 2 + 64 {
            self.heap = self
                .slots
                .iter()
                .map(|(id, slot)| Reverse((slot.deadline, slot.seq, *id)))
                .collect();
        }
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Arc<Notify>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.notify.notify_one();
    }
}

/// Shared handle to a timer queue. Clones refer to the same queue; the
/// dispatcher exits once the last clone is dropped.
#[derive(Clone)]
pub struct TimerQueue {
    inner: Arc<Inner>,
}

impl TimerQueue {
    /// Creates a queue and spawns its dispatcher on the current tokio runtime.
    pub fn new() -> Self {
        let notify = Arc::new(Notify::new());
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            notify: notify.clone(),
        });
        tokio::spawn(run_dispatcher(Arc::downgrade(&inner), notify));
        Self { inner }
    }

    /// Runs `task` once `delay` has elapsed.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Runs `task` at `deadline`.
    pub fn schedule_at<F>(&self, deadline: Instant, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (id, wake) = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.slots.insert(
                id,
                Slot {
                    seq: 0,
                    deadline,
                    task: Box::new(task),
                },
            );
            let wake = state.push(id, deadline);
            (id, wake)
        };
        if wake {
            self.inner.notify.notify_one();
        }
        TimerHandle(id)
    }

    /// Cancels a pending task. Returns `false` if it already fired or was
    /// cancelled before.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.slots.remove(&handle.0);
            state.compact();
            removed
        };
        // Dropped outside the lock: the task may own resources with their own Drop.
        removed.is_some()
    }

    /// Moves a pending task to `now + delay`, keeping its handle.
    ///
    /// Returns `false` when the task is no longer pending.
    pub fn reschedule(&self, handle: TimerHandle, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let wake = {
            let mut state = self.inner.state.lock();
            if !state.slots.contains_key(&handle.0) {
                return false;
            }
            let wake = state.push(handle.0, deadline);
            state.compact();
            wake
        };
        if wake {
            self.inner.notify.notify_one();
        }
        true
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.inner.state.lock().slots.contains_key(&handle.0)
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_dispatcher(inner: Weak<Inner>, notify: Arc<Notify>) {
    loop {
        let next = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let (due, next) = {
                let mut state = inner.state.lock();
                let due = state.take_due(Instant::now());
                (due, state.live_top().map(|(deadline, _, _)| deadline))
            };
            drop(inner);
            for task in due {
                task();
            }
            next
        };
        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = notify.notified() => {}
                }
            }
            None => notify.notified().await,
        }
    }
}
