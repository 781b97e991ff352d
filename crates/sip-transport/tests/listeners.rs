// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Duration;

use sip_core::SipMessage;
use sip_transport::{run_udp, serve_tcp, InboundPacket, TransportKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

const OPTIONS: &str = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
    Via: SIP/2.0/TCP client.example.com;branch=z9hG4bKabc\r\n\
    From: <sip:alice@example.com>;tag=1\r\n\
    To: <sip:bob@example.com>\r\n\
    Call-ID: listener-test\r\n\
    CSeq: 1 OPTIONS\r\n\
    Content-Length: 0\r\n\r\n";

async fn next(rx: &mut mpsc::Receiver<InboundPacket>) -> InboundPacket {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("packet in time")
        .expect("channel open")
}

#[tokio::test]
async fn udp_drops_garbage_and_delivers_valid_datagrams() {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    tokio::spawn(run_udp(socket, tx));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"not sip at all\r\n\r\n", addr).await.unwrap();
    client.send_to(OPTIONS.as_bytes(), addr).await.unwrap();

    let packet = next(&mut rx).await;
    assert_eq!(packet.transport, TransportKind::Udp);
    assert_eq!(packet.peer, client.local_addr().unwrap());
    assert!(packet.stream.is_none());
    assert_eq!(
        packet.message.call_id().map(|c| c.as_str()),
        Some("listener-test")
    );
}

#[tokio::test]
async fn tcp_frames_fragments_and_answers_keepalives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    tokio::spawn(serve_tcp(listener, tx));

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (head, tail) = OPTIONS.split_at(40);
    client.write_all(head.as_bytes()).await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(tail.as_bytes()).await.unwrap();
    client.write_all(b"\r\n\r\n").await.unwrap();

    let packet = next(&mut rx).await;
    assert_eq!(packet.transport, TransportKind::Tcp);
    assert!(matches!(packet.message, SipMessage::Request(_)));

    let mut pong = [0u8; 2];
    timeout(Duration::from_secs(2), client.read_exact(&mut pong))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&pong, b"\r\n");

    let writer = packet.stream.expect("stream writer");
    writer
        .send(bytes::Bytes::from_static(b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n"))
        .await
        .unwrap();
    let mut reply = vec![0u8; 37];
    timeout(Duration::from_secs(2), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.starts_with(b"SIP/2.0 200 OK"));
}

#[tokio::test]
async fn tcp_framing_error_closes_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, _rx) = mpsc::channel(8);
    tokio::spawn(serve_tcp(listener, tx));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"OPTIONS sip:a@b SIP/2.0\r\nCall-ID: x\r\n\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "server should close a desynchronised stream");
}

#[tokio::test]
async fn framing_error_tears_down_connection_with_live_writer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    tokio::spawn(serve_tcp(listener, tx));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(OPTIONS.as_bytes()).await.unwrap();
    // Held the way a live server transaction holds its context.
    let packet = next(&mut rx).await;
    let writer = packet.stream.clone().expect("stream writer");

    client
        .write_all(b"garbage without colon\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("connection closed in time")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let sent = timeout(
        Duration::from_secs(2),
        writer.send(bytes::Bytes::from_static(b"SIP/2.0 200 OK\r\n\r\n")),
    )
    .await
    .expect("send resolves");
    assert!(sent.is_err(), "stale writer must refuse sends");
}

#[tokio::test]
async fn peer_close_tears_down_connection_with_live_writer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    tokio::spawn(serve_tcp(listener, tx));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(OPTIONS.as_bytes()).await.unwrap();
    let packet = next(&mut rx).await;
    let writer = packet.stream.expect("stream writer");

    client.shutdown().await.unwrap();
    timeout(Duration::from_secs(2), writer.closed())
        .await
        .expect("writer closed after peer EOF");
    assert!(writer
        .send(bytes::Bytes::from_static(b"SIP/2.0 200 OK\r\n\r\n"))
        .await
        .is_err());
}
