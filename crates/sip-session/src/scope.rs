// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Call-ID keyed work queues with single-drainer semantics.
//!
//! Every call has a FIFO of pending work and a drain status:
//!
//! - `Idle`: nobody is draining; the next enqueue starts a drain task.
//! - `Draining`: a task owns the call's session and is popping work.
//! - `DrainPending`: work arrived while a drain was active. After the drain
//!   releases the session it re-checks the queue and restarts instead of
//!   going idle, so a trigger is never lost.
//!
//! The session is taken out of its slot for the duration of a drain and put
//! back by a guard, so it is released on every exit path including panics.
//!
//! A call entry is evicted once its queue is idle and empty and its session
//! holds no transactions, no pending timers and was not opened explicitly.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use sip_transaction::{TimerHandle, TimerQueue, TransactionKey};
use smol_str::SmolStr;
use tracing::{debug, error, warn};

use crate::session::{CallSession, SessionTimer};
use crate::stage::{Flow, MessageKind, SessionMessage, Stage};
use crate::SessionError;

/// What a drain does when the call has no session yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingSessionPolicy {
    /// Create the session on first drain.
    #[default]
    Create,
    /// Keep the work queued and retry until the session is opened with
    /// [`CallSessionScope::open`], rejecting after too many attempts.
    Defer,
    /// Fail the queued messages with [`SessionError::NoSession`].
    Reject,
}

#[derive(Debug, Clone)]
pub struct ScopeConfig {
    pub missing_session: MissingSessionPolicy,
    /// Delay between drain attempts under [`MissingSessionPolicy::Defer`].
    pub defer_retry: Duration,
    pub defer_attempts: u32,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            missing_session: MissingSessionPolicy::Create,
            defer_retry: Duration::from_millis(100),
            defer_attempts: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    Idle,
    Draining,
    DrainPending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStats {
    /// Messages that went through every stage without error.
    pub processed: u64,
    pub failed: u64,
    pub panicked: u64,
    /// Messages refused for lack of a session.
    pub rejected: u64,
    pub deferred: u64,
    pub timers_fired: u64,
    pub live_sessions: usize,
}

/// Work run against a call's session from inside its drain.
enum SessionTask {
    Sync(Box<dyn FnOnce(&mut CallSession) + Send + 'static>),
    /// Holds the session across its awaits; the call's queue waits for it.
    Async(Box<dyn for<'s> FnOnce(&'s mut CallSession) -> BoxFuture<'s, ()> + Send + 'static>),
}

enum Work {
    Message(SessionMessage),
    Timer { id: SessionTimer, task: SessionTask },
    Run(SessionTask),
    Detach(TransactionKey),
    Close,
}

struct QueueState {
    pending: VecDeque<Work>,
    status: DrainStatus,
    timers: HashMap<SessionTimer, TimerHandle>,
    deferrals: u32,
}

enum Slot {
    Absent,
    Present(CallSession),
    /// Taken by the active drain.
    InUse,
}

/// Lock order: the `calls` shard, then `slot`, then `state`.
struct CallQueue {
    call_id: SmolStr,
    slot: Mutex<Slot>,
    state: Mutex<QueueState>,
}

impl CallQueue {
    fn new(call_id: SmolStr) -> Self {
        Self {
            call_id,
            slot: Mutex::new(Slot::Absent),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                status: DrainStatus::Idle,
                timers: HashMap::new(),
                deferrals: 0,
            }),
        }
    }

    /// Appends work. Returns `true` when the caller must start a drain.
    fn push(&self, work: Work) -> bool {
        let mut state = self.state.lock();
        state.pending.push_back(work);
        match state.status {
            DrainStatus::Idle => {
                state.status = DrainStatus::Draining;
                true
            }
            DrainStatus::Draining => {
                state.status = DrainStatus::DrainPending;
                false
            }
            DrainStatus::DrainPending => false,
        }
    }

    fn pop(&self) -> Option<Work> {
        self.state.lock().pending.pop_front()
    }

    /// Called after the session has been released. Returns `true` when work
    /// arrived in the meantime and the drain must restart.
    fn finish(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            state.status = DrainStatus::Idle;
            false
        } else {
            state.status = DrainStatus::Draining;
            true
        }
    }

    fn evictable(&self) -> bool {
        let slot = self.slot.lock();
        let state = self.state.lock();
        let idle = state.status == DrainStatus::Idle
            && state.pending.is_empty()
            && state.timers.is_empty();
        idle && match &*slot {
            Slot::Absent => true,
            Slot::Present(session) => !session.pinned && session.transaction_count() == 0,
            Slot::InUse => false,
        }
    }

    /// Empties the queue of messages that cannot be processed.
    fn take_messages(&self) -> Vec<SessionMessage> {
        let mut state = self.state.lock();
        let pending: Vec<Work> = state.pending.drain(..).collect();
        let mut messages = Vec::new();
        for work in pending {
            match work {
                Work::Message(message) => messages.push(message),
                Work::Timer { id, .. } => {
                    state.timers.remove(&id);
                }
                Work::Run(_) => {
                    debug!(call_id = %self.call_id, "dropping session task without session")
                }
                Work::Detach(_) | Work::Close => {}
            }
        }
        messages
    }
}

/// Exclusive hold on a call's session for one drain.
struct SessionGuard {
    queue: Arc<CallQueue>,
    session: Option<CallSession>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut slot = self.queue.slot.lock();
        *slot = match self.session.take() {
            Some(session) => Slot::Present(session),
            None => Slot::Absent,
        };
    }
}

enum Acquired {
    Session(CallSession),
    /// A retry is scheduled; the drain keeps ownership of the queue.
    Deferred,
    Rejected(Vec<SessionMessage>),
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
    deferred: AtomicU64,
    timers_fired: AtomicU64,
}

pub(crate) struct ScopeInner {
    calls: DashMap<SmolStr, Arc<CallQueue>>,
    stages: Vec<Arc<dyn Stage>>,
    timers: TimerQueue,
    config: ScopeConfig,
    counters: Counters,
    next_timer: AtomicU64,
}

/// Serializes work per Call-ID. Cheap to clone.
#[derive(Clone)]
pub struct CallSessionScope {
    inner: Arc<ScopeInner>,
}

/// Non-owning reference to a scope, for callbacks held by longer-lived
/// components.
#[derive(Clone)]
pub struct WeakCallSessionScope {
    inner: Weak<ScopeInner>,
}

impl WeakCallSessionScope {
    pub fn upgrade(&self) -> Option<CallSessionScope> {
        self.inner.upgrade().map(CallSessionScope::from_inner)
    }
}

impl CallSessionScope {
    /// Drains must run on a tokio runtime; `timers` is usually the
    /// transaction manager's queue.
    pub fn new(stages: Vec<Arc<dyn Stage>>, timers: TimerQueue) -> Self {
        Self::with_config(stages, timers, ScopeConfig::default())
    }

    pub fn with_config(stages: Vec<Arc<dyn Stage>>, timers: TimerQueue, config: ScopeConfig) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                calls: DashMap::new(),
                stages,
                timers,
                config,
                counters: Counters::default(),
                next_timer: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ScopeInner>) -> Self {
        Self { inner }
    }

    pub fn downgrade(&self) -> WeakCallSessionScope {
        WeakCallSessionScope {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.inner.config
    }

    /// Queues a message for its call and starts a drain if none is running.
    pub fn enqueue(&self, call_id: &str, message: SessionMessage) {
        self.enqueue_work(call_id, Work::Message(message));
    }

    /// Runs `task` with the call's session, serialized with its messages.
    pub fn submit<F>(&self, call_id: &str, task: F)
    where
        F: FnOnce(&mut CallSession) + Send + 'static,
    {
        self.enqueue_work(call_id, Work::Run(SessionTask::Sync(Box::new(task))));
    }

    /// Arms a timer whose expiry queues `task` as work for the call.
    ///
    /// The task never runs on the timer dispatcher. A pending timer keeps the
    /// call from being evicted.
    pub fn schedule<F>(&self, call_id: &str, delay: Duration, task: F) -> SessionTimer
    where
        F: FnOnce(&mut CallSession) + Send + 'static,
    {
        self.arm(call_id, delay, SessionTask::Sync(Box::new(task)))
    }

    /// Like [`schedule`](Self::schedule) for work that awaits, such as sending
    /// a response. The drain holds the call until the future completes, so the
    /// call's queued messages run strictly before or after it.
    pub fn schedule_async<F>(&self, call_id: &str, delay: Duration, task: F) -> SessionTimer
    where
        F: for<'s> FnOnce(&'s mut CallSession) -> BoxFuture<'s, ()> + Send + 'static,
    {
        self.arm(call_id, delay, SessionTask::Async(Box::new(task)))
    }

    fn arm(&self, call_id: &str, delay: Duration, task: SessionTask) -> SessionTimer {
        let id = SessionTimer(self.inner.next_timer.fetch_add(1, Ordering::Relaxed));
        let weak = self.downgrade();
        let target = SmolStr::new(call_id);
        let entry = self
            .inner
            .calls
            .entry(target.clone())
            .or_insert_with(|| Arc::new(CallQueue::new(target.clone())));
        let handle = self.inner.timers.schedule(delay, move || {
            if let Some(scope) = weak.upgrade() {
                scope.enqueue_work(&target, Work::Timer { id, task });
            }
        });
        entry.value().state.lock().timers.insert(id, handle);
        id
    }

    /// Cancels a session timer. Returns `false` if it already ran or was
    /// cancelled.
    pub fn cancel_timer(&self, call_id: &str, timer: SessionTimer) -> bool {
        let (queue, handle) = {
            let Some(entry) = self.inner.calls.get(call_id) else {
                return false;
            };
            let queue = entry.value().clone();
            let handle = queue.state.lock().timers.remove(&timer);
            (queue, handle)
        };
        let Some(handle) = handle else {
            return false;
        };
        self.inner.timers.cancel(handle);
        self.evict_if_idle(&queue);
        true
    }

    /// Removes a transaction from the call's session once it terminates.
    ///
    /// Does nothing for calls the scope does not know.
    pub fn detach(&self, call_id: &str, key: TransactionKey) -> bool {
        self.enqueue_existing(call_id, Work::Detach(key))
    }

    /// Creates the session for `call_id` ahead of any message and keeps it
    /// until [`close`](Self::close). Returns `false` if it already existed.
    pub fn open(&self, call_id: &str) -> bool {
        let target = SmolStr::new(call_id);
        let entry = self
            .inner
            .calls
            .entry(target.clone())
            .or_insert_with(|| Arc::new(CallQueue::new(target.clone())));
        let mut slot = entry.value().slot.lock();
        match &mut *slot {
            Slot::Absent => {
                let mut session = CallSession::new(target, Arc::downgrade(&self.inner));
                session.pinned = true;
                *slot = Slot::Present(session);
                debug!(call_id, "call session opened");
                true
            }
            Slot::Present(session) => {
                session.pinned = true;
                false
            }
            Slot::InUse => false,
        }
    }

    /// Ends the call's session after the work already queued for it.
    /// Pending session timers are cancelled.
    pub fn close(&self, call_id: &str) -> bool {
        self.enqueue_existing(call_id, Work::Close)
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.inner.calls.contains_key(call_id)
    }

    pub fn status(&self, call_id: &str) -> Option<DrainStatus> {
        self.inner
            .calls
            .get(call_id)
            .map(|entry| entry.value().state.lock().status)
    }

    /// Number of calls with a queue or session.
    pub fn session_count(&self) -> usize {
        self.inner.calls.len()
    }

    pub fn stats(&self) -> ScopeStats {
        let c = &self.inner.counters;
        ScopeStats {
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            deferred: c.deferred.load(Ordering::Relaxed),
            timers_fired: c.timers_fired.load(Ordering::Relaxed),
            live_sessions: self.inner.calls.len(),
        }
    }

    fn enqueue_work(&self, call_id: &str, work: Work) {
        let (queue, start) = {
            let entry = self
                .inner
                .calls
                .entry(SmolStr::new(call_id))
                .or_insert_with(|| Arc::new(CallQueue::new(SmolStr::new(call_id))));
            let queue = entry.value().clone();
            // Pushed under the shard lock so eviction cannot orphan it.
            let start = queue.push(work);
            (queue, start)
        };
        if start {
            self.spawn_drain(queue);
        }
    }

    fn enqueue_existing(&self, call_id: &str, work: Work) -> bool {
        let (queue, start) = {
            let Some(entry) = self.inner.calls.get(call_id) else {
                return false;
            };
            let queue = entry.value().clone();
            let start = queue.push(work);
            (queue, start)
        };
        if start {
            self.spawn_drain(queue);
        }
        true
    }

    fn spawn_drain(&self, queue: Arc<CallQueue>) {
        tokio::spawn(self.clone().drain(queue));
    }

    async fn drain(self, queue: Arc<CallQueue>) {
        loop {
            match self.acquire(&queue) {
                Acquired::Session(session) => {
                    let mut guard = SessionGuard {
                        queue: queue.clone(),
                        session: Some(session),
                    };
                    while let Some(work) = queue.pop() {
                        if !self.run(&mut guard, work).await {
                            break;
                        }
                    }
                }
                Acquired::Deferred => return,
                Acquired::Rejected(messages) => {
                    for message in messages {
                        self.reject(message, &queue.call_id).await;
                    }
                }
            }
            if !queue.finish() {
                break;
            }
        }
        self.evict_if_idle(&queue);
    }

    fn acquire(&self, queue: &Arc<CallQueue>) -> Acquired {
        let mut slot = queue.slot.lock();
        match std::mem::replace(&mut *slot, Slot::InUse) {
            Slot::Present(session) => {
                queue.state.lock().deferrals = 0;
                Acquired::Session(session)
            }
            Slot::InUse => {
                // Another drain holds the session; try again shortly.
                error!(call_id = %queue.call_id, "call session already in use by a drain");
                self.schedule_retry(queue);
                Acquired::Deferred
            }
            Slot::Absent => match self.inner.config.missing_session {
                MissingSessionPolicy::Create => {
                    debug!(call_id = %queue.call_id, "call session created");
                    Acquired::Session(CallSession::new(
                        queue.call_id.clone(),
                        Arc::downgrade(&self.inner),
                    ))
                }
                MissingSessionPolicy::Defer => {
                    *slot = Slot::Absent;
                    let attempt = {
                        let mut state = queue.state.lock();
                        state.deferrals += 1;
                        state.deferrals
                    };
                    if attempt <= self.inner.config.defer_attempts {
                        self.inner.counters.deferred.fetch_add(1, Ordering::Relaxed);
                        debug!(call_id = %queue.call_id, attempt, "no call session yet; deferring drain");
                        self.schedule_retry(queue);
                        Acquired::Deferred
                    } else {
                        queue.state.lock().deferrals = 0;
                        warn!(call_id = %queue.call_id, attempts = attempt - 1, "call session never opened; rejecting queued messages");
                        Acquired::Rejected(queue.take_messages())
                    }
                }
                MissingSessionPolicy::Reject => {
                    *slot = Slot::Absent;
                    Acquired::Rejected(queue.take_messages())
                }
            },
        }
    }

    fn schedule_retry(&self, queue: &Arc<CallQueue>) {
        let weak = self.downgrade();
        let queue = queue.clone();
        self.inner.timers.schedule(self.inner.config.defer_retry, move || {
            if let Some(scope) = weak.upgrade() {
                scope.spawn_drain(queue);
            }
        });
    }

    /// Processes one work item. Returns `false` when the session was closed.
    async fn run(&self, guard: &mut SessionGuard, work: Work) -> bool {
        if let Work::Close = work {
            let handles: Vec<TimerHandle> = guard
                .queue
                .state
                .lock()
                .timers
                .drain()
                .map(|(_, handle)| handle)
                .collect();
            for handle in handles {
                self.inner.timers.cancel(handle);
            }
            guard.session = None;
            debug!(call_id = %guard.queue.call_id, "call session closed");
            return false;
        }

        let queue = guard.queue.clone();
        let Some(session) = guard.session.as_mut() else {
            return false;
        };
        match work {
            Work::Message(mut message) => {
                if let MessageKind::Request(transaction) = &message.kind {
                    // Already terminated transactions would never be detached.
                    if transaction.state().is_some() {
                        session.attach(transaction.key().clone());
                    }
                }
                self.process(session, &mut message).await;
            }
            Work::Timer { id, task } => {
                let armed = queue.state.lock().timers.remove(&id).is_some();
                if armed {
                    self.inner.counters.timers_fired.fetch_add(1, Ordering::Relaxed);
                    self.run_task(session, task).await;
                }
            }
            Work::Run(task) => self.run_task(session, task).await,
            Work::Detach(key) => {
                session.detach(&key);
            }
            Work::Close => {}
        }
        true
    }

    async fn process(&self, session: &mut CallSession, message: &mut SessionMessage) {
        let call_id = session.call_id().clone();
        let outcome = AssertUnwindSafe(self.pipeline(session, message))
            .catch_unwind()
            .await;
        let counters = &self.inner.counters;
        match outcome {
            Ok(Ok(())) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(%call_id, method = %message.request.method(), error = %e, "message processing failed");
            }
            Err(panic) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                let e = SessionError::Panicked {
                    message: panic_message(panic.as_ref()),
                };
                error!(%call_id, method = %message.request.method(), error = %e, "panic while processing message");
            }
        }
    }

    async fn pipeline(
        &self,
        session: &mut CallSession,
        message: &mut SessionMessage,
    ) -> Result<(), SessionError> {
        for stage in &self.inner.stages {
            match stage.process(session, message).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    return Err(SessionError::Stage {
                        stage: SmolStr::new(stage.name()),
                        message: format!("{e:#}"),
                    })
                }
            }
        }
        Ok(())
    }

    async fn run_task(&self, session: &mut CallSession, task: SessionTask) {
        let outcome = match task {
            SessionTask::Sync(task) => std::panic::catch_unwind(AssertUnwindSafe(|| task(session))),
            SessionTask::Async(task) => {
                AssertUnwindSafe(async { task(&mut *session).await })
                    .catch_unwind()
                    .await
            }
        };
        if let Err(panic) = outcome {
            self.inner.counters.panicked.fetch_add(1, Ordering::Relaxed);
            error!(
                call_id = %session.call_id(),
                panic = %panic_message(panic.as_ref()),
                "panic in session task"
            );
        }
    }

    async fn reject(&self, message: SessionMessage, call_id: &SmolStr) {
        self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(%call_id, method = %message.request.method(), "no call session; message rejected");
        let error = SessionError::NoSession {
            call_id: call_id.clone(),
        };
        for stage in &self.inner.stages {
            stage.rejected(&message, &error).await;
        }
    }

    fn evict_if_idle(&self, queue: &Arc<CallQueue>) {
        let removed = self.inner.calls.remove_if(&queue.call_id, |_, current| {
            Arc::ptr_eq(current, queue) && current.evictable()
        });
        if removed.is_some() {
            debug!(call_id = %queue.call_id, "call session evicted");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> CallQueue {
        CallQueue::new(SmolStr::new("q@test"))
    }

    #[test]
    fn push_reports_when_a_drain_must_start() {
        let q = queue();
        assert!(q.push(Work::Close));
        assert_eq!(q.state.lock().status, DrainStatus::Draining);
        assert!(!q.push(Work::Close));
        assert_eq!(q.state.lock().status, DrainStatus::DrainPending);
        assert!(!q.push(Work::Close));
    }

    #[test]
    fn finish_restarts_only_with_pending_work() {
        let q = queue();
        q.push(Work::Close);
        q.push(Work::Close);
        assert!(q.pop().is_some());
        // One item still queued: the drain must go round again.
        assert!(q.finish());
        assert_eq!(q.state.lock().status, DrainStatus::Draining);
        assert!(q.pop().is_some());
        assert!(!q.finish());
        assert_eq!(q.state.lock().status, DrainStatus::Idle);
        assert!(q.push(Work::Close));
    }

    #[test]
    fn eviction_requires_idle_empty_unpinned_session() {
        let q = queue();
        assert!(q.evictable());

        let mut session = CallSession::new(SmolStr::new("q@test"), Weak::new());
        session.pinned = true;
        *q.slot.lock() = Slot::Present(session);
        assert!(!q.evictable());

        if let Slot::Present(session) = &mut *q.slot.lock() {
            session.pinned = false;
        }
        assert!(q.evictable());

        q.push(Work::Close);
        assert!(!q.evictable());
    }

    #[test]
    fn panic_payloads_render() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
