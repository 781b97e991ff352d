// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Transport layer initialization and dispatcher implementation.
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sip_transaction::{TransportContext, TransportDispatcher};
use sip_transport::{run_udp, send_stream, send_tcp, send_udp, serve_tcp, InboundPacket, TransportKind};
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::mpsc,
};
use tracing::error;

/// Addresses the daemon listens on, plus its outbound dispatcher.
pub struct Transports {
    pub dispatcher: Arc<SiphonTransportDispatcher>,
    pub udp_local: SocketAddr,
    pub tcp_local: SocketAddr,
}

/// Binds UDP and TCP, spawns their receive loops and returns the dispatcher
/// used for every outbound message.
pub async fn start_transports(
    udp_bind: &str,
    tcp_bind: &str,
    tx: mpsc::Sender<InboundPacket>,
) -> Result<Transports> {
    let udp_socket = Arc::new(UdpSocket::bind(udp_bind).await?);
    let udp_local = udp_socket.local_addr()?;
    let tcp_listener = TcpListener::bind(tcp_bind).await?;
    let tcp_local = tcp_listener.local_addr()?;

    tokio::spawn({
        let socket = Arc::clone(&udp_socket);
        let tx = tx.clone();
        async move {
            if let Err(e) = run_udp(socket, tx).await {
                error!(%e, "UDP listener exited");
            }
        }
    });

    tokio::spawn(async move {
        if let Err(e) = serve_tcp(tcp_listener, tx).await {
            error!(%e, "TCP listener exited");
        }
    });

    Ok(Transports {
        dispatcher: Arc::new(SiphonTransportDispatcher::new(udp_socket)),
        udp_local,
        tcp_local,
    })
}

/// Sends over the connection a request arrived on when there is one, a new
/// TCP connection otherwise, and the shared UDP socket for datagrams.
pub struct SiphonTransportDispatcher {
    udp_socket: Arc<UdpSocket>,
}

impl SiphonTransportDispatcher {
    pub fn new(udp_socket: Arc<UdpSocket>) -> Self {
        Self { udp_socket }
    }
}

#[async_trait]
impl TransportDispatcher for SiphonTransportDispatcher {
    async fn dispatch(&self, ctx: &TransportContext, payload: Bytes) -> Result<()> {
        if let Some(writer) = &ctx.stream {
            return send_stream(writer, payload).await;
        }
        match ctx.transport {
            TransportKind::Udp => send_udp(self.udp_socket.as_ref(), &ctx.peer, &payload).await,
            TransportKind::Tcp => send_tcp(&ctx.peer, &payload).await,
            TransportKind::Tls => Err(anyhow!(
                "no TLS connection to {} and outbound TLS is not supported",
                ctx.peer
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_payloads_reach_the_peer() {
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dispatcher = SiphonTransportDispatcher::new(local);

        let ctx = TransportContext::new(TransportKind::Udp, peer.local_addr().unwrap(), None);
        dispatcher
            .dispatch(&ctx, Bytes::from_static(b"OPTIONS"))
            .await
            .unwrap();

        let mut buf = [0u8; 32];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OPTIONS");
    }

    #[tokio::test]
    async fn stream_writer_wins_over_transport() {
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let dispatcher = SiphonTransportDispatcher::new(local);
        let (writer, mut rx) = mpsc::channel(1);

        let ctx = TransportContext::new(
            TransportKind::Tls,
            SocketAddr::from(([127, 0, 0, 1], 5061)),
            Some(writer),
        );
        dispatcher
            .dispatch(&ctx, Bytes::from_static(b"SIP/2.0 200 OK"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"SIP/2.0 200 OK"));
    }

    #[tokio::test]
    async fn outbound_tls_without_connection_fails() {
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let dispatcher = SiphonTransportDispatcher::new(local);
        let ctx = TransportContext::new(
            TransportKind::Tls,
            SocketAddr::from(([127, 0, 0, 1], 5061)),
            None,
        );
        assert!(dispatcher.dispatch(&ctx, Bytes::new()).await.is_err());
    }
}
