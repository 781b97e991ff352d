// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-call serialization above the transaction layer.
//!
//! Messages that survive transaction matching are queued by Call-ID on a
//! [`CallSessionScope`]. Each call's queue is drained by at most one task at
//! a time, which runs every message through an ordered list of [`Stage`]s
//! with exclusive access to that call's [`CallSession`]. Distinct calls drain
//! in parallel.
//!
//! [`Engine`] wires parser output through the
//! [`TransactionManager`](sip_transaction::TransactionManager) into the scope.

use std::fmt;

use smol_str::SmolStr;

pub mod engine;
pub mod scope;
pub mod session;
pub mod stage;

pub use engine::{default_workers, shard_of, Engine, Routed};
pub use scope::{
    CallSessionScope, DrainStatus, MissingSessionPolicy, ScopeConfig, ScopeStats,
    WeakCallSessionScope,
};
pub use session::{CallSession, SessionTimer};
pub use stage::{Flow, MessageKind, SessionMessage, Stage, ViaReceivedStage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session exists for the call and the policy does not create one.
    NoSession { call_id: SmolStr },
    /// A stage returned an error.
    Stage { stage: SmolStr, message: String },
    /// A stage panicked.
    Panicked { message: String },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSession { call_id } => write!(f, "no call session for {}", call_id),
            Self::Stage { stage, message } => write!(f, "stage {} failed: {}", stage, message),
            Self::Panicked { message } => write!(f, "stage panicked: {}", message),
        }
    }
}

impl std::error::Error for SessionError {}
