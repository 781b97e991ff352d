// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! State owned by one call.

use std::collections::{HashMap, HashSet};
use std::sync::Weak;
use std::time::Duration;

use futures::future::BoxFuture;
use sip_transaction::TransactionKey;
use smol_str::SmolStr;
use tokio::time::Instant;

use crate::scope::{CallSessionScope, ScopeInner};

/// Identity of a timer armed with [`CallSession::schedule`] or
/// [`CallSessionScope::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionTimer(pub(crate) u64);

/// In-memory state for one Call-ID.
///
/// Only reachable from inside a drain, so stages get `&mut` access without
/// further locking.
pub struct CallSession {
    call_id: SmolStr,
    created_at: Instant,
    transactions: HashSet<TransactionKey>,
    attributes: HashMap<SmolStr, String>,
    /// Opened explicitly; survives idle eviction until closed.
    pub(crate) pinned: bool,
    scope: Weak<ScopeInner>,
}

impl CallSession {
    pub(crate) fn new(call_id: SmolStr, scope: Weak<ScopeInner>) -> Self {
        Self {
            call_id,
            created_at: Instant::now(),
            transactions: HashSet::new(),
            attributes: HashMap::new(),
            pinned: false,
            scope,
        }
    }

    pub fn call_id(&self) -> &SmolStr {
        &self.call_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Records a transaction as belonging to this call.
    pub fn attach(&mut self, key: TransactionKey) -> bool {
        self.transactions.insert(key)
    }

    pub fn detach(&mut self, key: &TransactionKey) -> bool {
        self.transactions.remove(key)
    }

    pub fn has_transaction(&self, key: &TransactionKey) -> bool {
        self.transactions.contains(key)
    }

    pub fn transactions(&self) -> impl Iterator<Item = &TransactionKey> {
        self.transactions.iter()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) -> Option<String> {
        self.attributes.insert(SmolStr::new(name), value.into())
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        self.attributes.remove(name)
    }

    /// Runs `task` on this session after `delay`, as ordinary queued work.
    ///
    /// Returns `None` once the owning scope is gone.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Option<SessionTimer>
    where
        F: FnOnce(&mut CallSession) + Send + 'static,
    {
        let scope = CallSessionScope::from_inner(self.scope.upgrade()?);
        Some(scope.schedule(&self.call_id, delay, task))
    }

    /// Async counterpart of [`schedule`](Self::schedule); the future runs
    /// inside the call's drain with the session borrowed.
    pub fn schedule_async<F>(&self, delay: Duration, task: F) -> Option<SessionTimer>
    where
        F: for<'s> FnOnce(&'s mut CallSession) -> BoxFuture<'s, ()> + Send + 'static,
    {
        let scope = CallSessionScope::from_inner(self.scope.upgrade()?);
        Some(scope.schedule_async(&self.call_id, delay, task))
    }

    pub fn cancel_timer(&self, timer: SessionTimer) -> bool {
        match self.scope.upgrade() {
            Some(inner) => CallSessionScope::from_inner(inner).cancel_timer(&self.call_id, timer),
            None => false,
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("transactions", &self.transactions.len())
            .field("attributes", &self.attributes)
            .field("pinned", &self.pinned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_core::Method;

    #[test]
    fn tracks_transactions_and_attributes() {
        let mut session = CallSession::new(SmolStr::new("abc@host"), Weak::new());
        let key = TransactionKey::server("z9hG4bK1", &Method::Invite);

        assert!(session.attach(key.clone()));
        assert!(!session.attach(key.clone()));
        assert_eq!(session.transaction_count(), 1);
        assert!(session.detach(&key));
        assert!(!session.has_transaction(&key));

        assert_eq!(session.set_attribute("state", "early"), None);
        assert_eq!(session.set_attribute("state", "confirmed").as_deref(), Some("early"));
        assert_eq!(session.attribute("state"), Some("confirmed"));
        assert_eq!(session.remove_attribute("state").as_deref(), Some("confirmed"));
    }

    #[test]
    fn timers_need_a_live_scope() {
        let session = CallSession::new(SmolStr::new("orphan"), Weak::new());
        assert!(session.schedule(Duration::from_secs(1), |_| {}).is_none());
        assert!(session
            .schedule_async(Duration::from_secs(1), |_| Box::pin(async {}))
            .is_none());
        assert!(!session.cancel_timer(SessionTimer(7)));
    }
}
