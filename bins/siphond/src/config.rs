// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Daemon configuration file.
//!
//! Every field is optional in the JSON file; missing ones take the values
//! from [`DaemonConfig::default`].

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use sip_session::{default_workers, MissingSessionPolicy, ScopeConfig};
use sip_transaction::{ManagerConfig, TimerDefaults, TransactionLimits};
use smol_str::SmolStr;

/// Mirror of [`MissingSessionPolicy`] for the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    #[default]
    Create,
    Defer,
    Reject,
}

impl From<SessionPolicy> for MissingSessionPolicy {
    fn from(policy: SessionPolicy) -> Self {
        match policy {
            SessionPolicy::Create => MissingSessionPolicy::Create,
            SessionPolicy::Defer => MissingSessionPolicy::Defer,
            SessionPolicy::Reject => MissingSessionPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// T1 in milliseconds.
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub max_server_transactions: usize,
    pub max_client_transactions: usize,
    /// How long a failed hop is skipped.
    pub blacklist_secs: u64,
    /// `host[:port]` placed in Vias of outbound requests. Defaults to the
    /// UDP bind address.
    pub via_sent_by: Option<String>,
    pub missing_session: SessionPolicy,
    pub defer_retry_ms: u64,
    pub defer_attempts: u32,
    pub user_agent: String,
    /// How long INVITEs ring before they are declined.
    pub ring_timeout_secs: u64,
    /// Seconds between outbound OPTIONS pings.
    pub ping_interval_secs: u64,
    /// Ingress workers sharing inbound packets by Call-ID. 0 picks one per core.
    pub ingress_workers: usize,
    /// URI placed in From of outbound pings.
    pub ping_from: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4_000,
            t4_ms: 5_000,
            max_server_transactions: 10_000,
            max_client_transactions: 10_000,
            blacklist_secs: 300,
            via_sent_by: None,
            missing_session: SessionPolicy::Create,
            defer_retry_ms: 100,
            defer_attempts: 50,
            user_agent: "siphond/0.1".to_owned(),
            ring_timeout_secs: 20,
            ping_interval_secs: 30,
            ingress_workers: 0,
            ping_from: "sip:siphond@localhost".to_owned(),
        }
    }
}

impl DaemonConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn timer_defaults(&self) -> TimerDefaults {
        let t1 = Duration::from_millis(self.t1_ms);
        TimerDefaults {
            t1,
            t2: Duration::from_millis(self.t2_ms),
            t4: Duration::from_millis(self.t4_ms),
            td: t1 * 64,
        }
    }

    pub fn manager_config(&self, default_sent_by: &str) -> ManagerConfig {
        ManagerConfig {
            timers: self.timer_defaults(),
            limits: TransactionLimits::new(
                self.max_server_transactions,
                self.max_client_transactions,
            ),
            via_sent_by: SmolStr::new(self.via_sent_by.as_deref().unwrap_or(default_sent_by)),
            blacklist_duration: Duration::from_secs(self.blacklist_secs),
        }
    }

    pub fn ingress_workers(&self) -> usize {
        match self.ingress_workers {
            0 => default_workers(),
            n => n,
        }
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn scope_config(&self) -> ScopeConfig {
        ScopeConfig {
            missing_session: self.missing_session.into(),
            defer_retry: Duration::from_millis(self.defer_retry_ms),
            defer_attempts: self.defer_attempts,
        }
    }
}
