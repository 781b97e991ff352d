// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use sip_session::{CallSessionScope, Engine, Stage, ViaReceivedStage};
use sip_transaction::{SystemResolver, TransactionManager, TransportDispatcher};
use sip_transport::InboundPacket;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod dispatcher;
mod handlers;
mod ping;
mod transport;

use config::DaemonConfig;
use dispatcher::RequestDispatcher;
use ping::{spawn_ping, PingConfig};
use transport::start_transports;

/// SIP daemon answering OPTIONS, ringing INVITEs and refusing everything else
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Bind address (UDP)
    #[arg(long, default_value = "0.0.0.0:5060")]
    udp_bind: String,
    /// Bind address (TCP)
    #[arg(long, default_value = "0.0.0.0:5060")]
    tcp_bind: String,
    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// SIP URI to send periodic OPTIONS pings to
    #[arg(long)]
    ping_target: Option<String>,
    /// Overrides the ping interval from the configuration file
    #[arg(long)]
    ping_interval_secs: Option<u64>,
}

#[tokio::main]
/// Entry point for the SIP UDP/TCP daemon.
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let Args {
        udp_bind,
        tcp_bind,
        config,
        ping_target,
        ping_interval_secs,
    } = Args::parse();

    let config = match config {
        Some(path) => DaemonConfig::load(&path).await?,
        None => DaemonConfig::default(),
    };

    let (tx, rx) = mpsc::channel::<InboundPacket>(1024);
    let transports = start_transports(&udp_bind, &tcp_bind, tx).await?;
    let dispatcher: Arc<dyn TransportDispatcher> = transports.dispatcher.clone();

    let manager = TransactionManager::with_config(
        dispatcher,
        Arc::new(SystemResolver),
        config.manager_config(&transports.udp_local.to_string()),
    );
    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(ViaReceivedStage),
        Arc::new(RequestDispatcher::new(&config.user_agent, config.ring_timeout())),
    ];
    let scope = CallSessionScope::with_config(stages, manager.timer_queue(), config.scope_config());
    let engine = Engine::new(manager.clone(), scope);

    if let Some(target) = ping_target {
        let interval = Duration::from_secs(ping_interval_secs.unwrap_or(config.ping_interval_secs));
        let ping = PingConfig::new(&target, &config.ping_from, interval, &config.user_agent)?;
        info!(uri = %ping.target, ?interval, "sending periodic OPTIONS pings");
        spawn_ping(manager, ping);
    }

    let workers = config.ingress_workers();
    info!(
        udp = %transports.udp_local,
        tcp = %transports.tcp_local,
        workers,
        "siphond started"
    );
    engine.run_with_workers(rx, workers).await;
    Ok(())
}
