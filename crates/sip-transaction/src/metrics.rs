// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction counters.
//!
//! [`TransactionManager`](crate::TransactionManager) records into a shared
//! [`TransactionMetrics`]; callers read a consistent copy with
//! [`TransactionMetrics::snapshot`].
//!
//! ```
//! use sip_transaction::metrics::{TransactionMetrics, TransactionOutcome};
//! use sip_transaction::{Role, TransactionTimer};
//! use sip_transport::TransportKind;
//!
//! let metrics = TransactionMetrics::new();
//! metrics.record_start(TransportKind::Udp, "OPTIONS", Role::Client);
//! metrics.record_timer_fired(TransactionTimer::E);
//! metrics.record_complete(TransportKind::Udp, "OPTIONS", Role::Client, TransactionOutcome::Timeout);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.starts_by_role.get(&Role::Client), Some(&1));
//! assert_eq!(snapshot.outcomes.get(&TransactionOutcome::Timeout), Some(&1));
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use sip_transport::TransportKind;

use crate::{Role, TransactionTimer};

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOutcome {
    /// Final response sent or received.
    Completed,
    /// Timer B, F or H fired.
    Timeout,
    TransportError,
    /// A CANCEL ended the INVITE.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub taken_at: Instant,
    pub starts_by_role: HashMap<Role, u64>,
    pub starts_by_method: HashMap<String, u64>,
    pub starts_by_transport: HashMap<TransportKind, u64>,
    pub completes_by_role: HashMap<Role, u64>,
    pub completes_by_method: HashMap<String, u64>,
    pub completes_by_transport: HashMap<TransportKind, u64>,
    pub outcomes: HashMap<TransactionOutcome, u64>,
    pub timer_fires: HashMap<TransactionTimer, u64>,
    pub retransmissions: HashMap<TransportKind, u64>,
    /// Requests absorbed as retransmissions of a live server transaction.
    pub absorbed: u64,
    pub server_transactions_rejected: u64,
    pub client_transactions_rejected: u64,
}

impl MetricsSnapshot {
    pub fn starts(&self, role: Role) -> u64 {
        self.starts_by_role.get(&role).copied().unwrap_or(0)
    }

    pub fn completes(&self, role: Role) -> u64 {
        self.completes_by_role.get(&role).copied().unwrap_or(0)
    }

    pub fn outcome(&self, outcome: TransactionOutcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    pub fn timer_fires(&self, timer: TransactionTimer) -> u64 {
        self.timer_fires.get(&timer).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct MetricsData {
    starts_by_role: HashMap<Role, u64>,
    starts_by_method: HashMap<String, u64>,
    starts_by_transport: HashMap<TransportKind, u64>,
    completes_by_role: HashMap<Role, u64>,
    completes_by_method: HashMap<String, u64>,
    completes_by_transport: HashMap<TransportKind, u64>,
    outcomes: HashMap<TransactionOutcome, u64>,
    timer_fires: HashMap<TransactionTimer, u64>,
    retransmissions: HashMap<TransportKind, u64>,
    absorbed: u64,
    server_transactions_rejected: u64,
    client_transactions_rejected: u64,
}

/// Thread-safe collector; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct TransactionMetrics {
    data: Arc<RwLock<MetricsData>>,
}

impl TransactionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self, transport: TransportKind, method: &str, role: Role) {
        let mut data = self.data.write();
        *data.starts_by_role.entry(role).or_insert(0) += 1;
        *data.starts_by_method.entry(method.to_string()).or_insert(0) += 1;
        *data.starts_by_transport.entry(transport).or_insert(0) += 1;
    }

    pub fn record_complete(
        &self,
        transport: TransportKind,
        method: &str,
        role: Role,
        outcome: TransactionOutcome,
    ) {
        let mut data = self.data.write();
        *data.completes_by_role.entry(role).or_insert(0) += 1;
        *data
            .completes_by_method
            .entry(method.to_string())
            .or_insert(0) += 1;
        *data.completes_by_transport.entry(transport).or_insert(0) += 1;
        *data.outcomes.entry(outcome).or_insert(0) += 1;
    }

    pub fn record_timer_fired(&self, timer: TransactionTimer) {
        *self.data.write().timer_fires.entry(timer).or_insert(0) += 1;
    }

    pub fn record_retransmission(&self, transport: TransportKind) {
        *self.data.write().retransmissions.entry(transport).or_insert(0) += 1;
    }

    pub fn record_absorbed(&self) {
        self.data.write().absorbed += 1;
    }

    /// An inbound request was refused because the server table is full.
    pub fn record_server_transaction_rejected(&self) {
        self.data.write().server_transactions_rejected += 1;
    }

    /// An outbound request was refused because the client table is full.
    pub fn record_client_transaction_rejected(&self) {
        self.data.write().client_transactions_rejected += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let data = self.data.read();
        MetricsSnapshot {
            taken_at: Instant::now(),
            starts_by_role: data.starts_by_role.clone(),
            starts_by_method: data.starts_by_method.clone(),
            starts_by_transport: data.starts_by_transport.clone(),
            completes_by_role: data.completes_by_role.clone(),
            completes_by_method: data.completes_by_method.clone(),
            completes_by_transport: data.completes_by_transport.clone(),
            outcomes: data.outcomes.clone(),
            timer_fires: data.timer_fires.clone(),
            retransmissions: data.retransmissions.clone(),
            absorbed: data.absorbed,
            server_transactions_rejected: data.server_transactions_rejected,
            client_transactions_rejected: data.client_transactions_rejected,
        }
    }

    pub fn reset(&self) {
        *self.data.write() = MetricsData::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_key() {
        let metrics = TransactionMetrics::new();
        metrics.record_start(TransportKind::Udp, "INVITE", Role::Server);
        metrics.record_start(TransportKind::Tcp, "INVITE", Role::Server);
        metrics.record_start(TransportKind::Udp, "OPTIONS", Role::Client);
        metrics.record_retransmission(TransportKind::Udp);
        metrics.record_retransmission(TransportKind::Udp);
        metrics.record_absorbed();
        metrics.record_server_transaction_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.starts(Role::Server), 2);
        assert_eq!(snapshot.starts(Role::Client), 1);
        assert_eq!(snapshot.starts_by_method.get("INVITE"), Some(&2));
        assert_eq!(snapshot.retransmissions.get(&TransportKind::Udp), Some(&2));
        assert_eq!(snapshot.absorbed, 1);
        assert_eq!(snapshot.server_transactions_rejected, 1);
        assert_eq!(snapshot.client_transactions_rejected, 0);
    }

    #[test]
    fn clones_share_counters_and_reset_clears() {
        let metrics = TransactionMetrics::new();
        let shared = metrics.clone();
        shared.record_timer_fired(TransactionTimer::K);
        shared.record_complete(
            TransportKind::Udp,
            "BYE",
            Role::Client,
            TransactionOutcome::Completed,
        );
        assert_eq!(metrics.snapshot().timer_fires(TransactionTimer::K), 1);
        assert_eq!(metrics.snapshot().outcome(TransactionOutcome::Completed), 1);

        metrics.reset();
        let snapshot = shared.snapshot();
        assert_eq!(snapshot.completes(Role::Client), 0);
        assert!(snapshot.timer_fires.is_empty());
    }
}
