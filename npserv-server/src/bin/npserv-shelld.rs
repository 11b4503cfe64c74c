// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Plain remote shell, one forked session process per connection. The
//! child's stdio is the client socket, so commands talk to the client
//! without any further plumbing.

use npserv_common::config::{port_from_args, DEFAULT_PORT};
use npserv_common::net::{accept_client, passive_tcp};
use npserv_common::unix_utils::{ignore_sigchld, ignore_sigpipe, write_all};
use npserv_server::session_loop::drive_fd;
use npserv_shell::world::PlainWorld;
use npserv_shell::{Session, PROMPT};
use std::os::fd::AsRawFd;
use tracing::{debug, info, warn};

fn main() -> anyhow::Result<()> {
    npserv_common::log::enable_logging().ok();
    ignore_sigchld()?;
    ignore_sigpipe()?;

    let port = port_from_args(Some(DEFAULT_PORT))?;
    let listener = passive_tcp(port)?;
    info!("remote shell listening on port {port}");

    loop {
        let (sock, ip, peer_port) = match accept_client(listener.as_raw_fd()) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        info!("new connection from {ip}:{peer_port}");

        // Safety: the child immediately rebinds stdio and runs its own
        // session loop; the parent just forgets the socket.
        match unsafe { libc::fork() } {
            0 => {
                // Safety: dup2/close on fds this process owns.
                unsafe {
                    libc::close(listener.as_raw_fd());
                    libc::dup2(sock.as_raw_fd(), libc::STDIN_FILENO);
                    libc::dup2(sock.as_raw_fd(), libc::STDOUT_FILENO);
                    libc::dup2(sock.as_raw_fd(), libc::STDERR_FILENO);
                }
                drop(sock);

                let mut session = Session::new(0);
                let mut world = PlainWorld;
                let _ = write_all(libc::STDOUT_FILENO, PROMPT.as_bytes());
                // This process's stderr is the client socket now, so even a
                // fatal session error stays at debug.
                if let Err(e) = drive_fd(libc::STDIN_FILENO, &mut session, &mut world) {
                    debug!("session failed: {e}");
                }
                std::process::exit(0);
            }
            pid if pid > 0 => drop(sock),
            _ => {
                warn!("fork failed: {}", std::io::Error::last_os_error());
                drop(sock);
            }
        }
    }
}
