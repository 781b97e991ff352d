// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Request handler trait and method-specific handlers.
use anyhow::Result;
use async_trait::async_trait;
use sip_core::Request;
use sip_session::CallSession;
use sip_transaction::ServerTransactionHandle;

pub mod invite;
pub mod options;

/// Handles one SIP method inside a call's drain.
///
/// The handler answers through `handle`; it has exclusive use of the call's
/// session for the duration of the call.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        request: &Request,
        handle: &ServerTransactionHandle,
        session: &mut CallSession,
    ) -> Result<()>;

    /// Returns the SIP method this handler is responsible for.
    fn method(&self) -> &str;
}
