// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// OPTIONS request handler.
///
/// Responds with 200 OK carrying Allow, Accept and Server headers.
use anyhow::Result;
use async_trait::async_trait;
use sip_core::Request;
use sip_session::CallSession;
use sip_transaction::ServerTransactionHandle;
use smol_str::SmolStr;
use tracing::info;

use super::RequestHandler;

pub struct OptionsHandler {
    allow: SmolStr,
    server: SmolStr,
}

impl OptionsHandler {
    pub fn new(allow: &[&str], server: &str) -> Self {
        Self {
            allow: SmolStr::new(allow.join(", ")),
            server: SmolStr::new(server),
        }
    }
}

#[async_trait]
impl RequestHandler for OptionsHandler {
    async fn handle(
        &self,
        request: &Request,
        handle: &ServerTransactionHandle,
        session: &mut CallSession,
    ) -> Result<()> {
        let mut response = request.response(200, "OK")?;
        response.headers.push("Allow", self.allow.clone());
        response.headers.push("Accept", "application/sdp");
        response.headers.push("Server", self.server.clone());
        handle.send_final(response).await?;

        info!(
            call_id = %session.call_id(),
            from = %request.headers.get("From").map(|v| v.as_str()).unwrap_or(""),
            "answered OPTIONS"
        );
        Ok(())
    }

    fn method(&self) -> &str {
        "OPTIONS"
    }
}
