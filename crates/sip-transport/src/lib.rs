// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Network listeners feeding parsed SIP messages to the engine.
//!
//! UDP sockets share one datagram-mode [`MessageParser`]; every TCP
//! connection owns a stream-mode parser for its lifetime. A stream framing
//! error closes the connection since the byte stream cannot be resynchronised.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use sip_core::SipMessage;
use sip_parse::{MessageParser, ParserState};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// RFC 5626 keep-alive pong.
const PONG: &[u8] = b"\r\n";

/// Indicates which transport carried an inbound or outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// Returns the lowercase transport string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
        }
    }

    /// Returns the Via header transport token.
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::Udp.via_transport(), "UDP");
    /// assert_eq!(TransportKind::Tls.via_transport(), "TLS");
    /// ```
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// Parses a Via or URI transport token, ignoring case.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            _ => None,
        }
    }

    pub fn is_stream_based(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }

    /// Reliable transports skip request and response retransmission.
    pub fn is_reliable(&self) -> bool {
        self.is_stream_based()
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls)
    }
}

/// A parsed message together with where it came from.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub message: SipMessage,
    /// Writer for the originating connection on stream transports.
    pub stream: Option<mpsc::Sender<Bytes>>,
}

/// Runs a UDP receive loop and forwards parsed messages to the channel.
///
/// Malformed datagrams are logged and dropped; the loop keeps going.
pub async fn run_udp(socket: Arc<UdpSocket>, tx: mpsc::Sender<InboundPacket>) -> Result<()> {
    let bind = socket.local_addr()?;
    info!(%bind, "listening (udp)");
    let mut parser = MessageParser::datagram();
    let mut buf = vec![0u8; 65_535];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(%e, "udp recv_from error");
                continue;
            }
        };
        if n == buf.len() {
            warn!(%peer, max = n, "udp datagram likely truncated (buffer full)");
        }
        let messages = match parser.feed(&buf[..n]) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(%peer, error = %e, "dropping malformed datagram");
                continue;
            }
        };
        for message in messages {
            let packet = InboundPacket {
                transport: TransportKind::Udp,
                peer,
                message,
                stream: None,
            };
            if tx.send(packet).await.is_err() {
                error!("receiver dropped; shutting down udp loop");
                return Ok(());
            }
        }
    }
}

/// Sends a UDP datagram using an existing bound socket.
pub async fn send_udp(socket: &UdpSocket, to: &SocketAddr, data: &[u8]) -> Result<()> {
    socket.send_to(data, to).await?;
    Ok(())
}

/// Binds `bind` and accepts TCP connections.
pub async fn run_tcp(bind: &str, tx: mpsc::Sender<InboundPacket>) -> Result<()> {
    let listener = TcpListener::bind(bind).await?;
    serve_tcp(listener, tx).await
}

/// Accepts connections on an already bound listener, one task per connection.
pub async fn serve_tcp(listener: TcpListener, tx: mpsc::Sender<InboundPacket>) -> Result<()> {
    let bind = listener.local_addr()?;
    info!(%bind, "listening (tcp)");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(%e, "tcp accept error");
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            run_stream_session(peer, stream, TransportKind::Tcp, tx).await;
        });
    }
}

/// Connects to the destination and writes the bytes over TCP.
pub async fn send_tcp(to: &SocketAddr, data: &[u8]) -> Result<()> {
    let mut stream = TcpStream::connect(to).await?;
    stream.write_all(data).await?;
    Ok(())
}

/// Sends bytes through a connection's writer channel.
pub async fn send_stream(writer: &mpsc::Sender<Bytes>, data: Bytes) -> Result<()> {
    writer
        .send(data)
        .await
        .map_err(|_| anyhow!("connection writer dropped"))
}

/// Drives one stream connection until EOF, I/O error or a framing error,
/// then closes it even while transactions still hold its writer.
pub async fn run_stream_session<S>(
    peer: SocketAddr,
    stream: S,
    transport: TransportKind,
    tx: mpsc::Sender<InboundPacket>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(32);
    let (closed_tx, mut closed_rx) = oneshot::channel::<()>();

    // Transactions keep clones of `writer_tx` long after the read side is
    // done, so the writer stops on `closed_rx` rather than on channel close.
    let writer_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = &mut closed_rx => break,
                next = writer_rx.recv() => {
                    let Some(buf) = next else { break };
                    if let Err(e) = writer.write_all(&buf).await {
                        error!(%e, %peer, "{} write error", transport.as_str());
                        break;
                    }
                }
            }
        }
        // Later sends on stale writers fail instead of queueing.
        writer_rx.close();
        let _ = writer.shutdown().await;
    });

    let mut parser = MessageParser::stream();
    let mut buf = BytesMut::with_capacity(4096);
    'read: loop {
        buf.clear();
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(%peer, "{} connection closed by peer", transport.as_str());
                break;
            }
            Ok(_) => {
                let pings = parser.keepalives();
                let fed = parser.feed(&buf);
                for _ in pings..parser.keepalives() {
                    let _ = writer_tx.send(Bytes::from_static(PONG)).await;
                }
                let messages = match fed {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(%peer, error = %e, "stream framing error; closing connection");
                        break;
                    }
                };
                for message in messages {
                    let packet = InboundPacket {
                        transport,
                        peer,
                        message,
                        stream: Some(writer_tx.clone()),
                    };
                    if tx.send(packet).await.is_err() {
                        error!("receiver dropped; shutting down {:?} session", transport);
                        break 'read;
                    }
                }
                if parser.state() == ParserState::Error {
                    warn!(%peer, "stream framing error; closing connection");
                    break;
                }
            }
            Err(e) => {
                error!(%e, %peer, "{} read error", transport.as_str());
                break;
            }
        }
    }

    drop(writer_tx);
    let _ = closed_tx.send(());
    let _ = writer_handle.await;
    debug!(%peer, "{} connection torn down", transport.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_parse() {
        assert_eq!(TransportKind::parse("UDP"), Some(TransportKind::Udp));
        assert_eq!(TransportKind::parse("  tcp "), Some(TransportKind::Tcp));
        assert_eq!(TransportKind::parse("Tls"), Some(TransportKind::Tls));
        assert_eq!(TransportKind::parse("sctp"), None);
        assert_eq!(TransportKind::parse(""), None);
    }

    #[test]
    fn reliability_follows_stream_transports() {
        assert!(!TransportKind::Udp.is_reliable());
        assert!(TransportKind::Tcp.is_reliable());
        assert!(TransportKind::Tls.is_reliable());
        assert!(TransportKind::Tls.is_secure());
        assert!(!TransportKind::Tcp.is_secure());
    }

    #[test]
    fn via_tokens_round_trip() {
        for kind in [TransportKind::Udp, TransportKind::Tcp, TransportKind::Tls] {
            assert_eq!(TransportKind::parse(kind.via_transport()), Some(kind));
            assert_eq!(TransportKind::parse(kind.as_str()), Some(kind));
        }
    }
}
