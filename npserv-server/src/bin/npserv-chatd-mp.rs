// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multi-process chat server: one forked session process per connection,
//! with the roster in SysV shared memory, message delivery over SIGUSR1
//! inboxes, and inter-session pipes as FIFOs handshaken by SIGUSR2. The
//! accept-loop parent owns the segment and purges everything on
//! INT/QUIT/TERM.

use npserv_common::config::{port_from_args, Config, DEFAULT_PORT};
use npserv_common::net::{accept_client, passive_tcp};
use npserv_common::unix_utils::{ignore_sigchld, ignore_sigpipe, write_all};
use npserv_ipc::signals::{install_cleanup_handlers, install_session_handlers};
use npserv_ipc::{ClientTable, UserPipeDir};
use npserv_server::mp_world::MpWorld;
use npserv_server::session_loop::drive_fd;
use npserv_server::{login_message, TOO_MANY_USERS, WELCOME};
use npserv_shell::world::{World, NO_NAME};
use npserv_shell::{Session, PROMPT};
use std::os::fd::AsRawFd;
use tracing::{debug, info, warn};

fn main() -> anyhow::Result<()> {
    npserv_common::log::enable_logging().ok();
    ignore_sigchld()?;
    ignore_sigpipe()?;

    let config = Config::get();
    let table = ClientTable::create(config.shm_key)?;
    let pipes = UserPipeDir::from_config();
    pipes.ensure()?;
    install_cleanup_handlers(&table, &pipes)?;

    let port = port_from_args(Some(DEFAULT_PORT))?;
    let listener = passive_tcp(port)?;
    info!("multi-process chat server listening on port {port}");

    loop {
        let (sock, ip, peer_port) = match accept_client(listener.as_raw_fd()) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        info!("new connection from {ip}:{peer_port}");

        // Safety: the child rebinds stdio and never returns to this loop.
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
                run_session(table.clone(), pipes.clone(), ip.to_string(), peer_port);
            }
            pid if pid > 0 => drop(sock),
            _ => {
                warn!("fork failed: {}", std::io::Error::last_os_error());
                drop(sock);
            }
        }
    }
}

fn run_session(table: ClientTable, pipes: UserPipeDir, ip: String, peer_port: u16) -> ! {
    let pid = std::process::id() as i32;
    let Some(id) = table.claim(NO_NAME, &ip, peer_port, pid) else {
        let _ = write_all(libc::STDOUT_FILENO, TOO_MANY_USERS.as_bytes());
        std::process::exit(1);
    };

    // From here on this process's stderr is the client socket, so session
    // diagnostics stay at debug.
    if let Err(e) = install_session_handlers(&table, &pipes, id) {
        debug!("session {id}: failed to install signal handlers: {e}");
        table.release(id);
        std::process::exit(1);
    }

    let _ = write_all(libc::STDOUT_FILENO, WELCOME.as_bytes());
    let mut world = MpWorld::new(table, pipes, id);
    world.broadcast(&login_message(NO_NAME, &ip, peer_port));
    let _ = write_all(libc::STDOUT_FILENO, PROMPT.as_bytes());

    let mut session = Session::new(id);
    if let Err(e) = drive_fd(libc::STDIN_FILENO, &mut session, &mut world) {
        debug!("session {id} failed: {e}");
    }
    world.remove(id);
    std::process::exit(0);
}
