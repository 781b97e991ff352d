// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 transaction layer.
//!
//! - [`timer_queue::TimerQueue`]: cancellable deadline scheduler driving every
//!   protocol timer
//! - [`fsm`]: pure server and client state machines (`event -> actions`)
//! - [`manager::TransactionManager`]: branch-keyed registry that owns the
//!   machines, applies their actions and runs outbound failover
//! - [`hops`]: next-hop resolution seam and blacklist

use sip_core::{top_via, Method, Request, Response};
use smol_str::SmolStr;

pub mod fsm;
pub mod hops;
pub mod manager;
pub mod metrics;
pub mod requests;
pub mod timer_queue;
pub mod timers;

pub use fsm::{
    ClientAction, ClientEvent, ClientTransactionFsm, ServerAction, ServerEvent,
    ServerTransactionFsm, TerminateReason,
};
pub use hops::{Hop, HopBlacklist, Resolver, StaticResolver, SystemResolver};
pub use manager::{
    ClientTransactionHandle, ClientTransactionListener, Inbound, ManagerConfig,
    ServerTransactionHandle, TransactionError, TransactionLimits, TransactionManager,
    TransportContext, TransportDispatcher,
};
pub use timer_queue::{TimerHandle, TimerQueue};
pub use timers::{TimerDefaults, TransportAwareTimers};

/// Timers referenced by the transaction state machines (RFC 3261 §17, RFC 6026).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    /// INVITE request retransmission.
    A,
    /// INVITE transaction timeout.
    B,
    /// Wait for non-2xx response retransmissions.
    D,
    /// Non-INVITE request retransmission.
    E,
    /// Non-INVITE transaction timeout.
    F,
    /// INVITE final response retransmission.
    G,
    /// Wait for ACK.
    H,
    /// Wait for ACK retransmissions.
    I,
    /// Wait for non-INVITE request retransmissions.
    J,
    /// Wait for non-INVITE response retransmissions.
    K,
    /// Server INVITE `Accepted` lifetime.
    L,
    /// Client INVITE `Accepted` lifetime.
    M,
}

/// Server transaction states. `Confirmed` is only reached by INVITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Accepted,
    Terminated,
}

/// Client transaction states. INVITE starts in `Calling`, others in `Trying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Accepted,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

const CANCEL_PREFIX: &str = "cancel-";

/// Registry key: one transaction per (branch, role).
///
/// CANCEL shares its branch with the INVITE it targets, so its key carries a
/// `cancel-` prefix to let both transactions coexist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub role: Role,
}

impl TransactionKey {
    pub fn new(branch: &str, method: &Method, role: Role) -> Self {
        let branch = if matches!(method, Method::Cancel) {
            SmolStr::new(format!("{CANCEL_PREFIX}{branch}"))
        } else {
            SmolStr::new(branch)
        };
        Self { branch, role }
    }

    pub fn server(branch: &str, method: &Method) -> Self {
        Self::new(branch, method, Role::Server)
    }

    pub fn client(branch: &str, method: &Method) -> Self {
        Self::new(branch, method, Role::Client)
    }

    /// Key of the server transaction a request belongs to.
    pub fn for_request(req: &Request, role: Role) -> Option<Self> {
        let branch = request_branch(req)?;
        Some(Self::new(&branch, req.method(), role))
    }

    /// Key of the client transaction a response answers.
    pub fn for_response(res: &Response) -> Option<Self> {
        let via = top_via(&res.headers)?;
        let branch = via.branch()?;
        let cseq = sip_core::CSeq::parse(res.headers.get("CSeq")?)?;
        Some(Self::client(branch, &cseq.method))
    }

    pub fn is_cancel(&self) -> bool {
        self.branch.starts_with(CANCEL_PREFIX)
    }

    /// The wire branch, without the CANCEL prefix.
    pub fn wire_branch(&self) -> &str {
        self.branch
            .strip_prefix(CANCEL_PREFIX)
            .unwrap_or(self.branch.as_str())
    }
}

/// Branch parameter of the topmost Via.
pub fn request_branch(req: &Request) -> Option<SmolStr> {
    let via = top_via(&req.headers)?;
    via.branch().map(SmolStr::new)
}
