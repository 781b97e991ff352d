// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// INVITE request handler.
///
/// The daemon never answers calls. It rings (180) and declines with 480 once
/// the ring timeout expires; a CANCEL received meanwhile ends the call with
/// 487 instead.
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use sip_core::Request;
use sip_session::CallSession;
use sip_transaction::{ServerState, ServerTransactionHandle};
use tracing::{debug, info, warn};

use super::RequestHandler;

pub struct InviteHandler {
    ring_timeout: Duration,
}

impl InviteHandler {
    pub fn new(ring_timeout: Duration) -> Self {
        Self { ring_timeout }
    }
}

#[async_trait]
impl RequestHandler for InviteHandler {
    async fn handle(
        &self,
        request: &Request,
        handle: &ServerTransactionHandle,
        session: &mut CallSession,
    ) -> Result<()> {
        let ringing = request.response(180, "Ringing")?;
        let decline = request.response(480, "Temporarily Unavailable")?;
        handle.send_provisional(ringing).await?;
        session.set_attribute("state", "ringing");

        let handle = handle.clone();
        let timer = session.schedule_async(self.ring_timeout, move |session| {
            async move {
                if handle.state() != Some(ServerState::Proceeding) {
                    debug!(call_id = %session.call_id(), "ring timeout after call ended");
                    return;
                }
                match handle.send_final(decline).await {
                    Ok(()) => {
                        session.set_attribute("state", "declined");
                        info!(call_id = %session.call_id(), "ring timeout, declined with 480");
                    }
                    Err(e) => warn!(call_id = %session.call_id(), error = %e, "failed to decline INVITE"),
                }
            }
            .boxed()
        });
        if timer.is_none() {
            warn!(call_id = %session.call_id(), "session scope gone; INVITE left ringing");
        }
        Ok(())
    }

    fn method(&self) -> &str {
        "INVITE"
    }
}
