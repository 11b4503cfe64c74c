// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::sys::socket::{
    accept4, bind, getpeername, listen, setsockopt, socket, sockopt, AddressFamily, Backlog,
    SockFlag, SockType, SockaddrIn,
};
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const LISTEN_BACKLOG: i32 = 50;

/// Builds the classic passive TCP endpoint: `SO_REUSEADDR`, wildcard bind,
/// backlog 50. The descriptor is close-on-exec so shell children never
/// inherit the listener.
pub fn passive_tcp(port: u16) -> io::Result<OwnedFd> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    setsockopt(&sock, sockopt::ReuseAddr, &true)?;
    let addr = SockaddrIn::new(0, 0, 0, 0, port);
    bind(sock.as_raw_fd(), &addr)?;
    listen(&sock, Backlog::new(LISTEN_BACKLOG)?)?;
    Ok(sock)
}

/// Accepts one connection (close-on-exec) and reports the peer address.
pub fn accept_client(listener: RawFd) -> io::Result<(OwnedFd, Ipv4Addr, u16)> {
    let fd = accept4(listener, SockFlag::SOCK_CLOEXEC)?;
    // Safety: accept4 just handed us exclusive ownership of this fd.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };
    let peer: SockaddrIn = getpeername(fd)?;
    Ok((sock, peer.ip(), peer.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;

    #[test]
    fn test_passive_tcp_accepts_connections() {
        let listener = passive_tcp(0).unwrap();
        let local: SockaddrIn = nix::sys::socket::getsockname(listener.as_raw_fd()).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", local.port())).unwrap();
        let (sock, ip, _port) = accept_client(listener.as_raw_fd()).unwrap();
        assert_eq!(ip, Ipv4Addr::LOCALHOST);

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        let n = crate::unix_utils::read_some(sock.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
