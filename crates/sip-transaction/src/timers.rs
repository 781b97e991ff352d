// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware timer values per RFC 3261 §17 and RFC 6026.
//!
//! Retransmission timers (A, E, G) and the wait timers that only exist to
//! absorb UDP retransmissions (D, I, J, K) are zero on reliable transports.
//! Timeouts (B, F, H) and the `Accepted` lifetimes (L, M) apply everywhere.
//!
//! ```
//! use sip_transaction::{TransactionTimer, TransportAwareTimers};
//! use sip_transport::TransportKind;
//! use std::time::Duration;
//!
//! let tcp = TransportAwareTimers::new(TransportKind::Tcp);
//! assert_eq!(tcp.duration(TransactionTimer::K), Duration::ZERO);
//! assert_eq!(tcp.duration(TransactionTimer::F), Duration::from_secs(32));
//! assert!(!tcp.should_retransmit());
//! ```

use std::time::Duration;

use sip_transport::TransportKind;

use crate::TransactionTimer;

/// RFC 3261 base timer values (Table 4).
///
/// T1 should not be set below 500ms on the public internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    /// RTT estimate.
    pub t1: Duration,
    /// Maximum retransmit interval.
    pub t2: Duration,
    /// Maximum time a message stays in the network.
    pub t4: Duration,
    /// Client INVITE wait for response retransmissions (Timer D).
    pub td: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            td: Duration::from_secs(32),
        }
    }
}

/// Timer values for one transaction, fixed at creation from its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportAwareTimers {
    transport: TransportKind,
    defaults: TimerDefaults,
}

impl TransportAwareTimers {
    pub fn new(transport: TransportKind) -> Self {
        Self::with_defaults(transport, TimerDefaults::default())
    }

    pub fn with_defaults(transport: TransportKind, defaults: TimerDefaults) -> Self {
        Self {
            transport,
            defaults,
        }
    }

    /// Initial duration of `timer` on this transport.
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        let reliable = self.transport.is_reliable();
        let unless_reliable = |d: Duration| if reliable { Duration::ZERO } else { d };
        let d = &self.defaults;
        match timer {
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => {
                unless_reliable(d.t1)
            }
            TransactionTimer::B
            | TransactionTimer::F
            | TransactionTimer::H
            | TransactionTimer::L
            | TransactionTimer::M => d.t1.saturating_mul(64),
            TransactionTimer::D => unless_reliable(d.td),
            TransactionTimer::I | TransactionTimer::K => unless_reliable(d.t4),
            TransactionTimer::J => unless_reliable(d.t1.saturating_mul(64)),
        }
    }

    /// Next retransmission interval after `current`: doubled, capped at T2.
    pub fn backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.defaults.t2)
    }

    pub fn t2(&self) -> Duration {
        self.defaults.t2
    }

    /// Retransmissions only happen on unreliable transports.
    pub fn should_retransmit(&self) -> bool {
        !self.transport.is_reliable()
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn defaults(&self) -> TimerDefaults {
        self.defaults
    }
}
