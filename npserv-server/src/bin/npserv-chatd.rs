// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-process chat server: one selector over the listener and every
//! client socket. Each incoming line runs to completion on this thread;
//! stages still fork, but only foreground children are waited for.

use npserv_common::config::{port_from_args, DEFAULT_PORT};
use npserv_common::net::{accept_client, passive_tcp};
use npserv_common::unix_utils::{ignore_sigchld, ignore_sigpipe, read_some, write_all};
use npserv_server::session_loop::split_lines;
use npserv_server::{login_message, TOO_MANY_USERS, WELCOME};
use npserv_shell::session::IdAllocator;
use npserv_shell::world::{LocalChat, World};
use npserv_shell::{run_line, LineResult, Session, SessionId, PROMPT};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::BTreeMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use tracing::{info, warn};

struct Client {
    session: Session,
    sock: OwnedFd,
    pending: Vec<u8>,
}

fn main() -> anyhow::Result<()> {
    npserv_common::log::enable_logging().ok();
    ignore_sigchld()?;
    ignore_sigpipe()?;

    let port = port_from_args(Some(DEFAULT_PORT))?;
    let listener = passive_tcp(port)?;
    info!("chat server listening on port {port}");

    let mut chat = LocalChat::default();
    let mut ids = IdAllocator::default();
    let mut clients: BTreeMap<SessionId, Client> = BTreeMap::new();

    loop {
        let order: Vec<SessionId> = clients.keys().copied().collect();
        let mut fds = Vec::with_capacity(order.len() + 1);
        fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        for id in &order {
            if let Some(client) = clients.get(id) {
                // Safety: the fd lives in `clients`, untouched while polling.
                let borrowed = unsafe { BorrowedFd::borrow_raw(client.sock.as_raw_fd()) };
                fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
            }
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        let wanted = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let ready: Vec<bool> = fds
            .iter()
            .map(|fd| fd.revents().map(|r| r.intersects(wanted)).unwrap_or(false))
            .collect();
        drop(fds);

        if ready[0] {
            accept_one(&listener, &mut chat, &mut ids, &mut clients);
        }

        for (idx, id) in order.iter().enumerate() {
            if ready.get(idx + 1) == Some(&true) {
                pump_client(*id, &mut chat, &mut ids, &mut clients);
            }
        }
    }
}

fn accept_one(
    listener: &OwnedFd,
    chat: &mut LocalChat,
    ids: &mut IdAllocator,
    clients: &mut BTreeMap<SessionId, Client>,
) {
    let (sock, ip, peer_port) = match accept_client(listener.as_raw_fd()) {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("accept failed: {e}");
            return;
        }
    };
    info!("new connection from {ip}:{peer_port}");

    let Some(id) = ids.allocate() else {
        let _ = write_all(sock.as_raw_fd(), TOO_MANY_USERS.as_bytes());
        return;
    };

    let session = Session::with_client_fd(id, sock.as_raw_fd());
    chat.join(id, sock.as_raw_fd(), ip.to_string(), peer_port);

    let _ = write_all(sock.as_raw_fd(), WELCOME.as_bytes());
    let name = chat
        .peer(id)
        .map(|p| p.name)
        .unwrap_or_default();
    chat.broadcast(&login_message(&name, &ip.to_string(), peer_port));
    let _ = write_all(sock.as_raw_fd(), PROMPT.as_bytes());

    clients.insert(
        id,
        Client {
            session,
            sock,
            pending: Vec::new(),
        },
    );
}

fn pump_client(
    id: SessionId,
    chat: &mut LocalChat,
    ids: &mut IdAllocator,
    clients: &mut BTreeMap<SessionId, Client>,
) {
    let mut chunk = [0u8; 4096];
    let gone = {
        let Some(client) = clients.get_mut(&id) else {
            return;
        };
        match read_some(client.sock.as_raw_fd(), &mut chunk) {
            Ok(0) | Err(_) => true,
            Ok(n) => {
                client.pending.extend_from_slice(&chunk[..n]);
                false
            }
        }
    };
    if gone {
        teardown(id, chat, ids, clients);
        return;
    }

    let lines = {
        #[allow(clippy::unwrap_used)]
        let client = clients.get_mut(&id).unwrap();
        split_lines(&mut client.pending)
    };

    for line in lines {
        info!("session {id}: {}", line.trim_end());
        let outcome = {
            #[allow(clippy::unwrap_used)]
            let client = clients.get_mut(&id).unwrap();
            run_line(&mut client.session, chat, &line)
        };
        match outcome {
            Ok(LineResult::Continue) => {}
            Ok(LineResult::Exit) => {
                teardown(id, chat, ids, clients);
                return;
            }
            Err(e) => {
                warn!("session {id} failed: {e}");
                teardown(id, chat, ids, clients);
                return;
            }
        }
    }
}

fn teardown(
    id: SessionId,
    chat: &mut LocalChat,
    ids: &mut IdAllocator,
    clients: &mut BTreeMap<SessionId, Client>,
) {
    info!("session {id} disconnected");
    chat.remove(id);
    ids.release(id);
    clients.remove(&id);
}
