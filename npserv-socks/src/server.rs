// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::firewall::{Firewall, Verb};
use crate::relay::relay;
use crate::request::{
    encode_reply, read_request, SocksRequest, CD_BIND, CD_CONNECT, REPLY_GRANTED, REPLY_REJECTED,
    SOCKS_VERSION,
};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

/// One log record per reply, on stdout, exactly in this shape.
fn log_record(peer: &SocketAddr, dest: &str, port: u16, command: &str, reply: &str) {
    print!(
        "<S_IP>: {}\n<S_PORT>: {}\n<D_IP>: {dest}\n<D_PORT>: {port}\n<Command>: {command}\n<Reply>: {reply}\n\n",
        peer.ip(),
        peer.port(),
    );
}

fn command_label(request: &SocksRequest) -> &'static str {
    if request.command == CD_CONNECT {
        "CONNECT"
    } else {
        "BIND"
    }
}

async fn reject<S>(stream: &mut S, peer: &SocketAddr, dest: &str, port: u16, command: &str)
where
    S: AsyncWrite + Unpin,
{
    let _ = stream.write_all(&encode_reply(REPLY_REJECTED, 0)).await;
    log_record(peer, dest, port, command, "Reject");
}

async fn resolve_ipv4(domain: &str, port: u16) -> Option<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((domain, port)).await.ok()?;
    addrs.into_iter().find_map(|addr| match addr {
        SocketAddr::V4(v4) => Some(*v4.ip()),
        SocketAddr::V6(_) => None,
    })
}

/// Serves one proxy connection: read the request, resolve the destination
/// (SOCKS4A), validate, consult the firewall, then run the requested mode.
/// Every reply is followed by its log record; reject closes the connection.
pub async fn serve_client<S>(mut stream: S, peer: SocketAddr, firewall: &Firewall)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(e) => {
            debug!("{peer}: bad request: {e}");
            return;
        }
    };
    let command = command_label(&request);
    let port = request.port;

    // SOCKS4A resolution comes first so the log can carry the resolved
    // address; until then the domain itself stands in for it.
    let dest_ip = match &request.domain {
        Some(domain) => match resolve_ipv4(domain, port).await {
            Some(ip) => ip,
            None => {
                debug!("{peer}: cannot resolve {domain}");
                reject(&mut stream, &peer, domain, port, command).await;
                return;
            }
        },
        None => request.ip,
    };
    let dest = dest_ip.to_string();

    if request.version != SOCKS_VERSION
        || (request.command != CD_CONNECT && request.command != CD_BIND)
    {
        debug!("{peer}: protocol violation (vn={}, cd={})", request.version, request.command);
        reject(&mut stream, &peer, &dest, port, command).await;
        return;
    }

    let verb = if request.command == CD_CONNECT {
        Verb::Connect
    } else {
        Verb::Bind
    };
    if !firewall.permits(verb, dest_ip) {
        info!("{peer}: firewall denied {command} to {dest}:{port}");
        reject(&mut stream, &peer, &dest, port, command).await;
        return;
    }

    match verb {
        Verb::Connect => do_connect(stream, peer, dest_ip, port).await,
        Verb::Bind => do_bind(stream, peer, dest_ip, port).await,
    }
}

async fn do_connect<S>(mut stream: S, peer: SocketAddr, dest_ip: Ipv4Addr, port: u16)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dest = dest_ip.to_string();
    let remote = match TcpStream::connect((dest_ip, port)).await {
        Ok(remote) => remote,
        Err(e) => {
            debug!("{peer}: connect to {dest}:{port} failed: {e}");
            reject(&mut stream, &peer, &dest, port, "CONNECT").await;
            return;
        }
    };

    if stream
        .write_all(&encode_reply(REPLY_GRANTED, 0))
        .await
        .is_err()
    {
        return;
    }
    log_record(&peer, &dest, port, "CONNECT", "Accept");
    relay(stream, remote).await;
}

/// BIND: listen on an ephemeral port, tell the client which one, accept
/// exactly one inbound connection, confirm with a second reply, then relay.
async fn do_bind<S>(mut stream: S, peer: SocketAddr, dest_ip: Ipv4Addr, port: u16)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dest = dest_ip.to_string();
    let acceptor = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(acceptor) => acceptor,
        Err(e) => {
            debug!("{peer}: bind failed: {e}");
            reject(&mut stream, &peer, &dest, port, "BIND").await;
            return;
        }
    };
    let bound_port = match acceptor.local_addr() {
        Ok(addr) => addr.port(),
        Err(_) => {
            reject(&mut stream, &peer, &dest, port, "BIND").await;
            return;
        }
    };

    if stream
        .write_all(&encode_reply(REPLY_GRANTED, bound_port))
        .await
        .is_err()
    {
        return;
    }
    log_record(&peer, &dest, port, "BIND", "Accept");

    let (inbound, inbound_peer) = match acceptor.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
            debug!("{peer}: inbound accept failed: {e}");
            return;
        }
    };
    drop(acceptor);
    debug!("{peer}: bind port {bound_port} accepted {inbound_peer}");

    if stream
        .write_all(&encode_reply(REPLY_GRANTED, bound_port))
        .await
        .is_err()
    {
        return;
    }
    log_record(&peer, &dest, port, "BIND", "Accept");
    relay(stream, inbound).await;
}

/// Accept loop: one spawned task per connection, until SIGTERM.
pub async fn run(listener: TcpListener, firewall: Firewall) -> anyhow::Result<()> {
    let mut termsig = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = termsig.recv() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("connection from {peer}");
                        let firewall = firewall.clone();
                        tokio::spawn(async move {
                            serve_client(stream, peer, &firewall).await;
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        }
    }
    info!("shutting down");
    Ok(())
}
