// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Periodic outbound OPTIONS keep-alive.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};
use sip_core::{generate_tag, Headers, Method, Request, RequestLine, Response, SipUri};
use sip_transaction::{ClientTransactionListener, TransactionError, TransactionManager};
use smol_str::SmolStr;
use tokio::time;
use tracing::{info, warn};

const DEFAULT_MAX_FORWARDS: &str = "70";

#[derive(Debug, Clone)]
pub struct PingConfig {
    pub target: SipUri,
    pub from: SipUri,
    pub interval: Duration,
    pub user_agent: SmolStr,
}

impl PingConfig {
    pub fn new(target: &str, from: &str, interval: Duration, user_agent: &str) -> Result<Self> {
        let target =
            SipUri::parse(target).ok_or_else(|| anyhow!("invalid ping target URI: {target}"))?;
        let from = SipUri::parse(from).ok_or_else(|| anyhow!("invalid ping From URI: {from}"))?;
        Ok(Self {
            target,
            from,
            interval,
            user_agent: SmolStr::new(user_agent),
        })
    }
}

/// Logs the outcome of one ping.
struct PingListener {
    target: SmolStr,
    cseq: u32,
}

#[async_trait]
impl ClientTransactionListener for PingListener {
    async fn on_response(&self, response: &Response) {
        if response.start.is_provisional() {
            return;
        }
        info!(
            uri = %self.target,
            cseq = self.cseq,
            code = response.code(),
            "OPTIONS ping answered"
        );
    }

    async fn on_timeout(&self) {
        warn!(uri = %self.target, cseq = self.cseq, "OPTIONS ping timed out");
    }

    async fn on_error(&self, error: &TransactionError) {
        warn!(uri = %self.target, cseq = self.cseq, %error, "OPTIONS ping failed");
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Builds one ping. The transaction manager adds the Via.
pub fn build_ping(config: &PingConfig, call_id: &str, cseq: u32) -> Result<Request> {
    let mut headers = Headers::new();
    headers.push("Max-Forwards", DEFAULT_MAX_FORWARDS);
    headers.push(
        "From",
        format!("<{}>;tag={}", config.from, generate_tag()),
    );
    headers.push("To", format!("<{}>", config.target));
    headers.push("Call-ID", call_id);
    headers.push("CSeq", format!("{cseq} OPTIONS"));
    headers.push("User-Agent", config.user_agent.clone());
    Ok(Request::new(
        RequestLine::new(Method::Options, config.target.clone()),
        headers,
        Bytes::new(),
    )?)
}

/// Sends a ping every `interval` through the hop list the resolver returns.
/// All pings share one Call-ID with increasing CSeq.
pub fn spawn_ping(manager: TransactionManager, config: PingConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let call_id = format!("{}@siphond", random_token(12));
        let mut ticker = time::interval(config.interval);
        let mut cseq: u32 = 1;
        loop {
            ticker.tick().await;
            let listener = Arc::new(PingListener {
                target: SmolStr::new(config.target.to_string()),
                cseq,
            });
            let sent = match build_ping(&config, &call_id, cseq) {
                Ok(request) => manager.send(request, listener).await.map_err(|e| anyhow!(e)),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(uri = %config.target, error = %e, "failed to start OPTIONS ping");
            }
            cseq = cseq.saturating_add(1);
        }
    })
}
