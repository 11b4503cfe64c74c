// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Whole-connection proxy tests over in-memory client streams and real
//! loopback TCP destinations.

use npserv_socks::firewall::Firewall;
use npserv_socks::server::serve_client;
use std::io::Write;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn fake_peer() -> SocketAddr {
    "192.0.2.7:40000".parse().unwrap()
}

fn conf(lines: &str) -> (Firewall, tempfile::NamedTempFile) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(lines.as_bytes()).unwrap();
    file.flush().unwrap();
    (Firewall::new(file.path().to_path_buf()), file)
}

fn connect_request(ip: [u8; 4], port: u16) -> Vec<u8> {
    let mut req = vec![4, 1];
    req.extend_from_slice(&port.to_be_bytes());
    req.extend_from_slice(&ip);
    req.extend_from_slice(b"tester\0");
    req
}

/// One-shot echo destination; accepts a single connection and echoes until
/// EOF.
async fn echo_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn test_connect_accept_and_relay() {
    let (listener, port) = echo_listener().await;
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let (mut rd, mut wr) = sock.split();
        tokio::io::copy(&mut rd, &mut wr).await.unwrap();
    });

    let (fw, _guard) = conf("permit c 127.*.*.*\n");
    let (mut client, server_side) = tokio::io::duplex(4096);
    let task = tokio::spawn(async move {
        serve_client(server_side, fake_peer(), &fw).await;
    });

    client
        .write_all(&connect_request([127, 0, 0, 1], port))
        .await
        .unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0, 90, 0, 0, 0, 0, 0, 0]);

    client.write_all(b"roundtrip!").await.unwrap();
    let mut echoed = [0u8; 10];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"roundtrip!");

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_default_deny_rejects_connect() {
    let (fw, _guard) = conf("");
    let (mut client, server_side) = tokio::io::duplex(4096);
    let task = tokio::spawn(async move {
        serve_client(server_side, fake_peer(), &fw).await;
    });

    client
        .write_all(&connect_request([127, 0, 0, 1], 80))
        .await
        .unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 91);

    // Rejects close the connection: nothing follows the reply.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    task.await.unwrap();
}

#[tokio::test]
async fn test_bad_version_rejected() {
    let (fw, _guard) = conf("permit c *.*.*.*\n");
    let (mut client, server_side) = tokio::io::duplex(4096);
    let task = tokio::spawn(async move {
        serve_client(server_side, fake_peer(), &fw).await;
    });

    let mut req = connect_request([127, 0, 0, 1], 80);
    req[0] = 5;
    client.write_all(&req).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 91);
    task.await.unwrap();
}

#[tokio::test]
async fn test_unknown_command_rejected() {
    let (fw, _guard) = conf("permit c *.*.*.*\npermit b *.*.*.*\n");
    let (mut client, server_side) = tokio::io::duplex(4096);
    let task = tokio::spawn(async move {
        serve_client(server_side, fake_peer(), &fw).await;
    });

    let mut req = connect_request([127, 0, 0, 1], 80);
    req[1] = 3;
    client.write_all(&req).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 91);
    task.await.unwrap();
}

#[tokio::test]
async fn test_socks4a_resolves_localhost() {
    let (listener, port) = echo_listener().await;
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let (mut rd, mut wr) = sock.split();
        tokio::io::copy(&mut rd, &mut wr).await.unwrap();
    });

    let (fw, _guard) = conf("permit c 127.*.*.*\n");
    let (mut client, server_side) = tokio::io::duplex(4096);
    let task = tokio::spawn(async move {
        serve_client(server_side, fake_peer(), &fw).await;
    });

    let mut req = vec![4, 1];
    req.extend_from_slice(&port.to_be_bytes());
    req.extend_from_slice(&[0, 0, 0, 1]); // 4A marker
    req.extend_from_slice(b"tester\0localhost\0");
    client.write_all(&req).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 90);

    client.write_all(b"via-4a").await.unwrap();
    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"via-4a");

    client.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_socks4a_unresolvable_domain_rejected() {
    let (fw, _guard) = conf("permit c *.*.*.*\n");
    let (mut client, server_side) = tokio::io::duplex(4096);
    let task = tokio::spawn(async move {
        serve_client(server_side, fake_peer(), &fw).await;
    });

    let mut req = vec![4, 1, 0, 80, 0, 0, 0, 9];
    req.extend_from_slice(b"tester\0no-such-host.invalid\0");
    client.write_all(&req).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 91);
    task.await.unwrap();
}

#[tokio::test]
async fn test_bind_double_reply_then_relay() {
    let (fw, _guard) = conf("permit b *.*.*.*\n");
    let (mut client, server_side) = tokio::io::duplex(4096);
    let task = tokio::spawn(async move {
        serve_client(server_side, fake_peer(), &fw).await;
    });

    // BIND "towards" a nominal peer; the addresses only feed the firewall
    // and the log.
    let mut req = vec![4, 2, 0, 20, 127, 0, 0, 1];
    req.extend_from_slice(b"tester\0");
    client.write_all(&req).await.unwrap();

    let mut first = [0u8; 8];
    client.read_exact(&mut first).await.unwrap();
    assert_eq!(first[1], 90);
    let bound_port = u16::from_be_bytes([first[2], first[3]]);
    assert_ne!(bound_port, 0);

    // The peer dials the advertised port, triggering the second reply.
    let mut inbound = tokio::net::TcpStream::connect(("127.0.0.1", bound_port))
        .await
        .unwrap();

    let mut second = [0u8; 8];
    client.read_exact(&mut second).await.unwrap();
    assert_eq!(second[1], 90);
    assert_eq!(u16::from_be_bytes([second[2], second[3]]), bound_port);

    inbound.write_all(b"ftp-data").await.unwrap();
    let mut got = [0u8; 8];
    client.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"ftp-data");

    client.write_all(b"ack").await.unwrap();
    let mut back = [0u8; 3];
    inbound.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"ack");

    client.shutdown().await.unwrap();
    task.await.unwrap();
}
