// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Ordered message-processing stages run inside a call's drain.

use anyhow::Result;
use async_trait::async_trait;
use sip_core::{replace_top_via, top_via, Request};
use sip_transaction::{ServerTransactionHandle, TransportContext};
use smol_str::SmolStr;

use crate::{CallSession, SessionError};

/// How a request reached the session layer.
#[derive(Clone)]
pub enum MessageKind {
    /// A new request; answer it through the handle.
    Request(ServerTransactionHandle),
    /// An ACK outside any server transaction (2xx ACK).
    Ack,
    /// The peer cancelled this INVITE. The CANCEL has already been answered;
    /// the INVITE still needs a final response (normally 487).
    Cancelled { invite: ServerTransactionHandle },
}

impl std::fmt::Debug for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request(handle) => write!(f, "Request({})", handle.key().branch),
            MessageKind::Ack => write!(f, "Ack"),
            MessageKind::Cancelled { invite } => write!(f, "Cancelled({})", invite.key().branch),
        }
    }
}

/// A queued request together with its origin.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub request: Request,
    pub ctx: TransportContext,
    pub kind: MessageKind,
}

impl SessionMessage {
    pub fn new(request: Request, ctx: TransportContext, kind: MessageKind) -> Self {
        Self { request, ctx, kind }
    }

    pub fn call_id(&self) -> Option<&SmolStr> {
        self.request.headers.get("Call-ID")
    }

    /// The server transaction answering this message, if it has one.
    pub fn transaction(&self) -> Option<&ServerTransactionHandle> {
        match &self.kind {
            MessageKind::Request(handle) => Some(handle),
            MessageKind::Cancelled { invite } => Some(invite),
            MessageKind::Ack => None,
        }
    }
}

/// Whether the remaining stages see the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// One step of the processing pipeline.
///
/// Stages run in registration order. An `Err` or a panic ends processing of
/// that message only; the drain moves on to the next queued one.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process(&self, session: &mut CallSession, message: &mut SessionMessage)
        -> Result<Flow>;

    /// Called for messages the scope refuses to process (no session under
    /// the `Defer`/`Reject` policies).
    async fn rejected(&self, _message: &SessionMessage, _error: &SessionError) {}
}

/// Stamps `received` and fills `rport` on the top Via (RFC 3261 §18.2.1,
/// RFC 3581) from the transport peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ViaReceivedStage;

#[async_trait]
impl Stage for ViaReceivedStage {
    fn name(&self) -> &str {
        "via-received"
    }

    async fn process(
        &self,
        _session: &mut CallSession,
        message: &mut SessionMessage,
    ) -> Result<Flow> {
        let Some(mut via) = top_via(&message.request.headers) else {
            return Ok(Flow::Continue);
        };
        let peer = message.ctx.peer;
        let ip = peer.ip().to_string();
        let mut changed = false;
        if via.host.as_str() != ip.as_str() {
            via.set_param("received", Some(&ip));
            changed = true;
        }
        if matches!(via.param("rport"), Some(None)) {
            via.set_param("rport", Some(&peer.port().to_string()));
            changed = true;
        }
        if changed {
            replace_top_via(&mut message.request.headers, &via);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_core::{Headers, Method, RequestLine, SipUri};
    use sip_transport::TransportKind;
    use std::net::SocketAddr;
    use std::sync::Weak;

    fn ack(via: &str) -> SessionMessage {
        let mut headers = Headers::new();
        headers.push("Via", via);
        headers.push("Call-ID", "via@test");
        headers.push("CSeq", "1 ACK");
        let request = Request::new(
            RequestLine::new(Method::Ack, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
        .unwrap();
        let peer = SocketAddr::from(([192, 0, 2, 9], 5070));
        SessionMessage::new(
            request,
            TransportContext::new(TransportKind::Udp, peer, None),
            MessageKind::Ack,
        )
    }

    #[tokio::test]
    async fn stamps_received_and_rport() {
        let mut session = CallSession::new(SmolStr::new("via@test"), Weak::new());
        let mut message = ack("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKv1;rport");

        let flow = ViaReceivedStage.process(&mut session, &mut message).await.unwrap();
        assert_eq!(flow, Flow::Continue);

        let via = top_via(&message.request.headers).unwrap();
        assert_eq!(via.param("received"), Some(Some("192.0.2.9")));
        assert_eq!(via.param("rport"), Some(Some("5070")));
        assert_eq!(via.branch(), Some("z9hG4bKv1"));
    }

    #[tokio::test]
    async fn leaves_matching_via_alone() {
        let mut session = CallSession::new(SmolStr::new("via@test"), Weak::new());
        let original = "SIP/2.0/UDP 192.0.2.9:5070;branch=z9hG4bKv2";
        let mut message = ack(original);

        ViaReceivedStage.process(&mut session, &mut message).await.unwrap();

        assert_eq!(message.request.headers.get("Via").map(|v| v.as_str()), Some(original));
        assert_eq!(message.call_id().map(|c| c.as_str()), Some("via@test"));
        assert!(message.transaction().is_none());
    }
}
