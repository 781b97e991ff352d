// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Request dispatcher that routes SIP requests to method handlers.
use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sip_core::{Method, Request};
use sip_session::{CallSession, Flow, MessageKind, SessionError, SessionMessage, Stage};
use sip_transaction::ServerTransactionHandle;
use tracing::{debug, info, warn};

use crate::handlers::{invite::InviteHandler, options::OptionsHandler, RequestHandler};

/// Final pipeline stage of the daemon.
///
/// - Registered methods go to their handler.
/// - Requests with Max-Forwards 0 get 483.
/// - Methods without a handler get 501.
/// - Cancelled INVITEs get 487.
pub struct RequestDispatcher {
    handlers: HashMap<Method, Arc<dyn RequestHandler>>,
}

impl RequestDispatcher {
    /// Dispatcher answering OPTIONS (advertising `server`) and ringing
    /// INVITEs for `ring_timeout`.
    pub fn new(server: &str, ring_timeout: Duration) -> Self {
        let mut dispatcher = Self {
            handlers: HashMap::new(),
        };
        dispatcher.register(Arc::new(InviteHandler::new(ring_timeout)));
        let mut methods: Vec<String> = vec!["ACK".to_owned(), "CANCEL".to_owned()];
        methods.extend(dispatcher.handlers.values().map(|h| h.method().to_owned()));
        methods.push("OPTIONS".to_owned());
        let allow: Vec<&str> = methods.iter().map(String::as_str).collect();
        let options = OptionsHandler::new(&allow, server);
        dispatcher.register(Arc::new(options));
        dispatcher
    }

    pub fn register(&mut self, handler: Arc<dyn RequestHandler>) {
        self.handlers
            .insert(Method::from_token(handler.method()), handler);
    }

    async fn dispatch(
        &self,
        request: &Request,
        handle: &ServerTransactionHandle,
        session: &mut CallSession,
    ) -> Result<()> {
        // RFC 3261 §8.2.2.2 / §16.3: nothing is forwarded here, but a zero
        // Max-Forwards still must not be processed.
        let max_forwards = request
            .headers
            .get("Max-Forwards")
            .and_then(|v| v.trim().parse::<u32>().ok());
        if max_forwards == Some(0) {
            warn!(method = %request.method(), "Max-Forwards is 0, rejecting with 483");
            handle
                .send_final(request.response(483, "Too Many Hops")?)
                .await?;
            return Ok(());
        }

        match self.handlers.get(request.method()) {
            Some(handler) => handler.handle(request, handle, session).await,
            None => {
                debug!(method = %request.method(), "no handler registered for method");
                handle
                    .send_final(request.response(501, "Not Implemented")?)
                    .await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Stage for RequestDispatcher {
    fn name(&self) -> &str {
        "dispatcher"
    }

    async fn process(
        &self,
        session: &mut CallSession,
        message: &mut SessionMessage,
    ) -> Result<Flow> {
        match &message.kind {
            MessageKind::Request(handle) => {
                self.dispatch(&message.request, handle, session).await?;
            }
            MessageKind::Cancelled { invite } => {
                let original = invite
                    .request()
                    .ok_or_else(|| anyhow!("cancelled INVITE already terminated"))?;
                invite
                    .send_final(original.response(487, "Request Terminated")?)
                    .await?;
                info!(call_id = %session.call_id(), "answered cancelled INVITE with 487");
            }
            MessageKind::Ack => {
                debug!(call_id = %session.call_id(), "ACK for 2xx received");
            }
        }
        Ok(Flow::Stop)
    }

    async fn rejected(&self, message: &SessionMessage, error: &SessionError) {
        let Some(handle) = message.transaction() else {
            return;
        };
        let response = match handle.request() {
            Some(original) => original.response(480, "Temporarily Unavailable"),
            None => return,
        };
        let sent = match response {
            Ok(response) => handle.send_final(response).await.map_err(anyhow::Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            warn!(reason = %error, error = %e, "could not refuse request without session");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use sip_core::SipMessage;
    use sip_parse::parse_message;
    use sip_session::{CallSessionScope, Engine, Routed};
    use sip_transaction::{
        StaticResolver, TransactionManager, TransportContext, TransportDispatcher,
    };
    use sip_transport::TransportKind;
    use tokio::time::sleep;

    use super::*;

    #[derive(Default)]
    struct Wire {
        sent: Mutex<Vec<Bytes>>,
    }

    impl Wire {
        fn responses(&self) -> Vec<sip_core::Response> {
            self.sent
                .lock()
                .iter()
                .filter_map(|bytes| match parse_message(bytes) {
                    Ok(SipMessage::Response(res)) => Some(res),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl TransportDispatcher for Wire {
        async fn dispatch(&self, _ctx: &TransportContext, payload: Bytes) -> Result<()> {
            self.sent.lock().push(payload);
            Ok(())
        }
    }

    fn engine(wire: Arc<Wire>) -> Engine {
        let manager = TransactionManager::new(wire, Arc::new(StaticResolver::default()));
        let stages: Vec<Arc<dyn Stage>> = vec![Arc::new(RequestDispatcher::new(
            "siphond-test",
            Duration::from_secs(20),
        ))];
        let scope = CallSessionScope::new(stages, manager.timer_queue());
        Engine::new(manager, scope)
    }

    fn request(method: &str, branch: &str, max_forwards: u32) -> SipMessage {
        let text = format!(
            "{method} sip:siphond@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.0.2.4:5060;branch={branch}\r\n\
             Max-Forwards: {max_forwards}\r\n\
             From: <sip:alice@example.com>;tag=f1\r\n\
             To: <sip:siphond@example.com>\r\n\
             Call-ID: {branch}@test\r\n\
             CSeq: 1 {method}\r\n\
             Content-Length: 0\r\n\r\n"
        );
        parse_message(text.as_bytes()).unwrap()
    }

    fn ctx() -> TransportContext {
        TransportContext::new(
            TransportKind::Udp,
            SocketAddr::from(([192, 0, 2, 4], 5060)),
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn options_is_answered_with_allow() {
        let wire = Arc::new(Wire::default());
        let engine = engine(wire.clone());

        let routed = engine.on_message(request("OPTIONS", "z9hG4bKo1", 70), ctx()).await;
        assert_eq!(routed, Routed::Queued);
        sleep(Duration::from_millis(5)).await;

        let responses = wire.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].code(), 200);
        assert_eq!(
            responses[0].headers.get("Allow").map(|v| v.as_str()),
            Some("ACK, CANCEL, INVITE, OPTIONS")
        );
        assert_eq!(
            responses[0].headers.get("Server").map(|v| v.as_str()),
            Some("siphond-test")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_methods_and_exhausted_hops_are_refused() {
        let wire = Arc::new(Wire::default());
        let engine = engine(wire.clone());

        engine.on_message(request("MESSAGE", "z9hG4bKm1", 70), ctx()).await;
        engine.on_message(request("OPTIONS", "z9hG4bKm2", 0), ctx()).await;
        sleep(Duration::from_millis(5)).await;

        let mut codes: Vec<u16> = wire.responses().iter().map(|r| r.code()).collect();
        codes.sort_unstable();
        assert_eq!(codes, vec![483, 501]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_invite_gets_487() {
        let wire = Arc::new(Wire::default());
        let engine = engine(wire.clone());

        engine.on_message(request("INVITE", "z9hG4bKi1", 70), ctx()).await;
        sleep(Duration::from_millis(5)).await;
        let cancel = engine.on_message(request("CANCEL", "z9hG4bKi1", 70), ctx()).await;
        assert_eq!(cancel, Routed::Queued);
        sleep(Duration::from_millis(5)).await;

        let codes: Vec<u16> = wire.responses().iter().map(|r| r.code()).collect();
        assert_eq!(codes, vec![100, 180, 200, 487]);

        // The ring timer finds the call over and stays silent.
        sleep(Duration::from_secs(25)).await;
        assert!(wire.responses().iter().all(|r| r.code() != 480));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_invite_is_declined_after_ringing() {
        let wire = Arc::new(Wire::default());
        let engine = engine(wire.clone());

        engine.on_message(request("INVITE", "z9hG4bKi2", 70), ctx()).await;
        sleep(Duration::from_secs(19)).await;
        let codes: Vec<u16> = wire.responses().iter().map(|r| r.code()).collect();
        assert_eq!(codes, vec![100, 180]);

        sleep(Duration::from_secs(2)).await;
        let responses = wire.responses();
        // Timer G may already have retransmitted the 480.
        assert!(responses.len() >= 3);
        assert_eq!(responses[2].code(), 480);
        assert!(engine.scope().contains("z9hG4bKi2@test"));
    }

    #[tokio::test(start_paused = true)]
    async fn decline_is_sent_from_inside_the_call() {
        let wire = Arc::new(Wire::default());
        let engine = engine(wire.clone());

        engine.on_message(request("INVITE", "z9hG4bKi3", 70), ctx()).await;
        sleep(Duration::from_millis(5)).await;

        // Queued on the call at the instant the ring timer fires.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let observer = wire.clone();
        sleep(Duration::from_secs(20)).await;
        engine.scope().submit("z9hG4bKi3@test", move |session| {
            let declined = observer.responses().iter().any(|r| r.code() == 480);
            let _ = tx.send((session.attribute("state").map(str::to_owned), declined));
        });

        let (state, declined) = rx.recv().await.unwrap();
        // Either the call ran the decline to completion first, or not at all yet.
        assert_eq!(state.as_deref() == Some("declined"), declined);

        sleep(Duration::from_secs(1)).await;
        let codes: Vec<u16> = wire.responses().iter().map(|r| r.code()).collect();
        assert!(codes.contains(&480));
        assert!(!codes.contains(&487));
    }
}
