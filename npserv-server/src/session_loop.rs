// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use npserv_common::unix_utils::read_some;
use npserv_shell::world::World;
use npserv_shell::{run_line, LineResult, Session};
use std::io;
use tracing::debug;

const READ_CHUNK: usize = 4096;

/// Drives one session from a raw descriptor until EOF, `exit`, or a socket
/// error. Used by the fork-per-connection variants, whose stdin *is* the
/// client socket.
///
/// Input is split on newlines; a signal interrupting the read is retried,
/// and whatever error survives that is treated as a disconnect.
pub fn drive_fd(fd: i32, session: &mut Session, world: &mut dyn World) -> io::Result<()> {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = match read_some(fd, &mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => {
                debug!("session {}: read failed: {e}", session.id);
                return Ok(());
            }
        };
        pending.extend_from_slice(&chunk[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            debug!("session {}: {}", session.id, line.trim_end());
            match run_line(session, world, &line)? {
                LineResult::Continue => {}
                LineResult::Exit => return Ok(()),
            }
        }
    }
}

/// Extracts complete lines out of a per-client buffer; the selector server
/// feeds it whatever `read` returned.
pub fn split_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&raw).into_owned());
    }
    lines
}
