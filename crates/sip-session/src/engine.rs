// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Routes parsed messages through the transaction layer into call queues.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::future::join_all;

use sip_core::{Request, SipMessage};
use sip_parse::validate_message;
use sip_transaction::{Inbound, TransactionKey, TransactionManager, TransportContext};
use sip_transport::InboundPacket;
use smol_str::SmolStr;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, instrument, warn};

use crate::scope::CallSessionScope;
use crate::stage::{MessageKind, SessionMessage};

/// Packets a single ingress worker may have waiting.
const WORKER_BACKLOG: usize = 256;

/// One ingress worker per available core.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Ingress worker that handles `call_id` out of `workers`.
pub fn shard_of(call_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    call_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Where [`Engine::on_message`] sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Queued on its call's scope.
    Queued,
    /// Consumed by the transaction layer.
    Absorbed,
    /// A response matched to a client transaction.
    Matched,
    /// A response with no client transaction.
    Unmatched,
    Dropped(&'static str),
    /// Refused by the transaction limits.
    Rejected,
    /// Failed header validation.
    Invalid,
}

/// Parser output in, stage pipeline out.
#[derive(Clone)]
pub struct Engine {
    manager: TransactionManager,
    scope: CallSessionScope,
}

impl Engine {
    /// Installs a termination hook on `manager` that detaches finished
    /// transactions from their call sessions.
    pub fn new(manager: TransactionManager, scope: CallSessionScope) -> Self {
        let weak = scope.downgrade();
        manager.set_termination_hook(Arc::new(move |key: &TransactionKey, call_id: &SmolStr| {
            if let Some(scope) = weak.upgrade() {
                scope.detach(call_id, key.clone());
            }
        }));
        Self { manager, scope }
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    pub fn scope(&self) -> &CallSessionScope {
        &self.scope
    }

    pub async fn on_message(&self, message: SipMessage, ctx: TransportContext) -> Routed {
        if let Err(e) = validate_message(&message) {
            warn!(peer = %ctx.peer, error = %e, "dropping invalid message");
            return Routed::Invalid;
        }
        match message {
            SipMessage::Request(request) => self.on_request(request, ctx).await,
            SipMessage::Response(response) => {
                if self.manager.receive_response(response).await {
                    Routed::Matched
                } else {
                    debug!(peer = %ctx.peer, "response matched no client transaction");
                    Routed::Unmatched
                }
            }
        }
    }

    async fn on_request(&self, request: Request, ctx: TransportContext) -> Routed {
        match self.manager.receive_request(request, ctx.clone()).await {
            Inbound::Deliver {
                request,
                transaction,
            } => self.queue(request, ctx, MessageKind::Request(transaction)),
            Inbound::ForwardAck(ack) => self.queue(ack, ctx, MessageKind::Ack),
            Inbound::Cancelled { cancel, invite } => {
                info!(branch = %invite.key().branch, "INVITE cancelled by peer");
                self.queue(cancel, ctx, MessageKind::Cancelled { invite })
            }
            Inbound::Absorbed => Routed::Absorbed,
            Inbound::Dropped { reason } => Routed::Dropped(reason),
            Inbound::Rejected => Routed::Rejected,
        }
    }

    fn queue(&self, request: Request, ctx: TransportContext, kind: MessageKind) -> Routed {
        let Some(call_id) = request.headers.get("Call-ID").cloned() else {
            return Routed::Dropped("missing Call-ID");
        };
        self.scope
            .enqueue(&call_id, SessionMessage::new(request, ctx, kind));
        Routed::Queued
    }

    /// Feeds packets from the transport listeners until every sender is gone,
    /// on [`default_workers`] ingress workers.
    pub async fn run(self, rx: mpsc::Receiver<InboundPacket>) {
        self.run_with_workers(rx, default_workers()).await
    }

    /// Shards packets over `workers` tasks by Call-ID.
    ///
    /// A call always lands on the same worker, so its messages reach the
    /// transaction layer and the scope in arrival order, while a send stuck on
    /// one worker leaves calls on the others running. Packets for a worker
    /// whose backlog is full are dropped; the peer's retransmission recovers
    /// them.
    pub async fn run_with_workers(self, mut rx: mpsc::Receiver<InboundPacket>, workers: usize) {
        let workers = workers.max(1);
        let mut lanes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (lane_tx, lane_rx) = mpsc::channel(WORKER_BACKLOG);
            lanes.push(lane_tx);
            handles.push(tokio::spawn(self.clone().work(index, lane_rx)));
        }

        while let Some(packet) = rx.recv().await {
            let shard = {
                let call_id = packet.message.call_id().map(|c| c.as_str()).unwrap_or_default();
                shard_of(call_id, workers)
            };
            let Some(lane) = lanes.get(shard) else {
                continue;
            };
            match lane.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(packet)) => {
                    warn!(peer = %packet.peer, worker = shard, "ingress worker backlogged; dropping packet");
                }
                Err(TrySendError::Closed(packet)) => {
                    error!(peer = %packet.peer, worker = shard, "ingress worker gone; dropping packet");
                }
            }
        }
        debug!("inbound channel closed");

        drop(lanes);
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!(%e, "ingress worker failed");
            }
        }
    }

    async fn work(self, index: usize, mut rx: mpsc::Receiver<InboundPacket>) {
        while let Some(packet) = rx.recv().await {
            self.handle_packet(index, packet).await;
        }
    }

    #[instrument(name = "handle_packet", skip(self, packet), fields(transport = %packet.transport.as_str(), peer = %packet.peer))]
    async fn handle_packet(&self, worker: usize, packet: InboundPacket) {
        let ctx = TransportContext::new(packet.transport, packet.peer, packet.stream);
        let routed = self.on_message(packet.message, ctx).await;
        debug!(?routed, "packet routed");
    }
}
