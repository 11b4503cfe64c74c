// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use npserv_common::unix_utils::write_all;
use npserv_ipc::signals::{claim_pending, drop_pending};
use npserv_ipc::{ClientTable, UserPipeDir};
use npserv_shell::world::{PeerInfo, UserPipeError, UserPipeTx, World};
use npserv_shell::SessionId;
use std::os::fd::OwnedFd;

/// World of one session process in the multi-process chat server.
///
/// The roster lives in the shared-memory table; text reaches peers by
/// appending to their inbox slot and signalling SIGUSR1. Inter-session
/// pipes are FIFOs: the sender creates one, nudges the receiver with
/// SIGUSR2 (so a non-blocking read end appears), then opens the write end
/// blocking.
pub struct MpWorld {
    table: ClientTable,
    pipes: UserPipeDir,
    my_id: SessionId,
}

impl MpWorld {
    pub fn new(table: ClientTable, pipes: UserPipeDir, my_id: SessionId) -> Self {
        MpWorld {
            table,
            pipes,
            my_id,
        }
    }

    fn name_of(&self, id: SessionId) -> String {
        self.table
            .info(id)
            .map(|i| i.name)
            .unwrap_or_default()
    }
}

impl World for MpWorld {
    fn deliver(&mut self, id: SessionId, msg: &str) {
        if id == self.my_id {
            // Our own stdout is the dup'ed client socket.
            let _ = write_all(libc::STDOUT_FILENO, msg.as_bytes());
        } else {
            self.table.send_to(id, msg);
        }
    }

    fn broadcast(&mut self, msg: &str) {
        self.table.broadcast(msg);
    }

    fn peer(&self, id: SessionId) -> Option<PeerInfo> {
        self.table.info(id).map(|i| PeerInfo {
            id: i.id,
            name: i.name,
            ip: i.ip,
            port: i.port,
        })
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.table
            .infos()
            .into_iter()
            .map(|i| PeerInfo {
                id: i.id,
                name: i.name,
                ip: i.ip,
                port: i.port,
            })
            .collect()
    }

    fn rename(&mut self, id: SessionId, new_name: &str) -> bool {
        if self.table.name_taken(new_name) {
            return false;
        }
        self.table.set_name(id, new_name);
        true
    }

    fn user_pipe_send(
        &mut self,
        src: SessionId,
        dst: SessionId,
        line: &str,
    ) -> Result<UserPipeTx, UserPipeError> {
        let Some(dst_info) = self.table.info(dst) else {
            return Err(UserPipeError::NoSuchUser(dst));
        };
        if self.pipes.exists(src, dst) {
            return Err(UserPipeError::AlreadyExists(src, dst));
        }
        self.pipes.create(src, dst)?;

        // Ask the receiver to open its read end non-blocking, then open the
        // write end blocking; its open is what unblocks ours.
        let _ = kill(Pid::from_raw(dst_info.pid), Signal::SIGUSR2);
        let tx = match self.pipes.open_write_blocking(src, dst) {
            Ok(fd) => fd,
            Err(_) => {
                self.pipes.unlink(src, dst);
                return Err(UserPipeError::OpenFailed(src, dst));
            }
        };

        let msg = format!(
            "*** {} (#{src}) just piped '{line}' to {} (#{dst}) ***\n",
            self.name_of(src),
            dst_info.name
        );
        self.broadcast(&msg);
        Ok(UserPipeTx::Owned(tx))
    }

    fn user_pipe_recv(
        &mut self,
        src: SessionId,
        dst: SessionId,
        line: &str,
    ) -> Result<OwnedFd, UserPipeError> {
        if !self.table.is_used(src) {
            drop_pending(src);
            return Err(UserPipeError::NoSuchUser(src));
        }
        if !self.pipes.exists(src, dst) {
            // The sender may have vanished after the SIGUSR2 nudge.
            drop_pending(src);
            return Err(UserPipeError::NotYet(src, dst));
        }

        let fd = match claim_pending(src) {
            Some(fd) => fd,
            None => self
                .pipes
                .open_read_blocking(src, dst)
                .map_err(|_| UserPipeError::NotYet(src, dst))?,
        };

        let msg = format!(
            "*** {} (#{dst}) just received from {} (#{src}) by '{line}' ***\n",
            self.name_of(dst),
            self.name_of(src)
        );
        self.broadcast(&msg);
        self.pipes.unlink(src, dst);
        Ok(fd)
    }

    fn remove(&mut self, id: SessionId) {
        let name = self.name_of(id);
        self.pipes.cleanup_session(id);
        self.table.release(id);
        self.broadcast(&format!("*** User '{name}' left. ***\n"));
    }
}
