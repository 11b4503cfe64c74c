// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const SOCKS_VERSION: u8 = 4;
pub const CD_CONNECT: u8 = 1;
pub const CD_BIND: u8 = 2;
pub const REPLY_GRANTED: u8 = 90;
pub const REPLY_REJECTED: u8 = 91;

/// NUL-terminated fields (USERID, DOMAIN) larger than this are a protocol
/// violation rather than something to buffer forever.
const MAX_FIELD: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("oversized request field")]
    FieldTooLong,
}

/// A parsed SOCKS4/4A request. Version and command are kept raw; the server
/// validates them after the whole request is consumed, the way the wire
/// protocol requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: u8,
    pub command: u8,
    pub port: u16,
    pub ip: Ipv4Addr,
    /// Present iff the client sent a SOCKS4A request.
    pub domain: Option<String>,
}

impl SocksRequest {
    pub fn is_socks4a(&self) -> bool {
        is_socks4a_marker(self.ip)
    }
}

/// SOCKS4A marks "resolve for me" with DSTIP `0.0.0.X`, X nonzero.
pub fn is_socks4a_marker(ip: Ipv4Addr) -> bool {
    matches!(ip.octets(), [0, 0, 0, x] if x != 0)
}

async fn read_cstring<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, RequestError> {
    let mut bytes = Vec::new();
    loop {
        let b = reader.read_u8().await?;
        if b == 0 {
            break;
        }
        bytes.push(b);
        if bytes.len() > MAX_FIELD {
            return Err(RequestError::FieldTooLong);
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads one request: the fixed 8-byte header, the NUL-terminated USERID
/// (discarded; there is no authentication), and for SOCKS4A the NUL-terminated
/// domain.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<SocksRequest, RequestError> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;
    let [version, command, port_hi, port_lo, a, b, c, d] = header;
    let ip = Ipv4Addr::new(a, b, c, d);

    let _userid = read_cstring(reader).await?;
    let domain = if is_socks4a_marker(ip) {
        Some(read_cstring(reader).await?)
    } else {
        None
    };

    Ok(SocksRequest {
        version,
        command,
        port: u16::from_be_bytes([port_hi, port_lo]),
        ip,
        domain,
    })
}

/// The 8-byte reply: VN=0, CD=code, then port and IP. Only BIND replies
/// carry a port; the IP field is always zero.
pub fn encode_reply(code: u8, port: u16) -> [u8; 8] {
    let port = port.to_be_bytes();
    [0, code, port[0], port[1], 0, 0, 0, 0]
}
