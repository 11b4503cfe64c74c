// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::pipes::PipePair;
use crate::session::SessionId;
use npserv_common::unix_utils::write_all;
use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

pub const NO_NAME: &str = "(no name)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: SessionId,
    pub name: String,
    pub ip: String,
    pub port: u16,
}

/// User-pipe failures carry the exact text shown to the offending session.
#[derive(Debug, thiserror::Error)]
pub enum UserPipeError {
    #[error("*** Error: user #{0} does not exist yet. ***\n")]
    NoSuchUser(SessionId),
    #[error("*** Error: the pipe #{0}->#{1} already exists. ***\n")]
    AlreadyExists(SessionId, SessionId),
    #[error("*** Error: the pipe #{0}->#{1} does not exist yet. ***\n")]
    NotYet(SessionId, SessionId),
    #[error("*** Error: the pipe #{0}->#{1} cannot be opened for writing. ***\n")]
    OpenFailed(SessionId, SessionId),
    /// Pipe allocation failure is fatal to the session, not message-worthy.
    #[error("pipe error: {0}")]
    Io(#[from] std::io::Error),
}

/// The write end handed to a sending stage.
pub enum UserPipeTx {
    /// The registry keeps ownership (in-memory edge); the stage borrows.
    Shared(RawFd),
    /// The stage's parent owns it and closes it right after fork (FIFO).
    Owned(OwnedFd),
}

/// Everything outside one session: message delivery, the roster of peers,
/// and inter-session pipes. The engine is written against this trait; each
/// server variant supplies its own realization.
pub trait World {
    /// Chat builtins (`who`/`tell`/`yell`/`name`) dispatch only when true.
    fn has_peers(&self) -> bool {
        true
    }

    /// Sends raw bytes to one session (prompts, errors, direct messages).
    fn deliver(&mut self, id: SessionId, msg: &str);

    /// Sends raw bytes to every online session, the caller included.
    fn broadcast(&mut self, msg: &str);

    fn peer(&self, id: SessionId) -> Option<PeerInfo>;

    fn peers(&self) -> Vec<PeerInfo>;

    /// Renames a session; false means the name is already taken.
    fn rename(&mut self, id: SessionId, new_name: &str) -> bool;

    /// `>dst`: allocate the edge `src -> dst` and announce it.
    fn user_pipe_send(
        &mut self,
        src: SessionId,
        dst: SessionId,
        line: &str,
    ) -> Result<UserPipeTx, UserPipeError>;

    /// `<src`: consume the edge `src -> dst` and announce it.
    fn user_pipe_recv(
        &mut self,
        src: SessionId,
        dst: SessionId,
        line: &str,
    ) -> Result<OwnedFd, UserPipeError>;

    /// Releases everything tied to a departing session.
    fn remove(&mut self, id: SessionId);
}

/// World of the plain remote shell: stdio is already the client socket and
/// there are no peers, so chat verbs fall through to exec and user pipes
/// always report a missing peer.
#[derive(Debug, Default)]
pub struct PlainWorld;

impl World for PlainWorld {
    fn has_peers(&self) -> bool {
        false
    }

    fn deliver(&mut self, _id: SessionId, msg: &str) {
        let _ = write_all(libc::STDOUT_FILENO, msg.as_bytes());
    }

    fn broadcast(&mut self, msg: &str) {
        let _ = write_all(libc::STDOUT_FILENO, msg.as_bytes());
    }

    fn peer(&self, _id: SessionId) -> Option<PeerInfo> {
        None
    }

    fn peers(&self) -> Vec<PeerInfo> {
        Vec::new()
    }

    fn rename(&mut self, _id: SessionId, _new_name: &str) -> bool {
        false
    }

    fn user_pipe_send(
        &mut self,
        _src: SessionId,
        dst: SessionId,
        _line: &str,
    ) -> Result<UserPipeTx, UserPipeError> {
        Err(UserPipeError::NoSuchUser(dst))
    }

    fn user_pipe_recv(
        &mut self,
        src: SessionId,
        _dst: SessionId,
        _line: &str,
    ) -> Result<OwnedFd, UserPipeError> {
        Err(UserPipeError::NoSuchUser(src))
    }

    fn remove(&mut self, _id: SessionId) {}
}

#[derive(Debug)]
struct ChatPeer {
    sock: RawFd,
    name: String,
    ip: String,
    port: u16,
}

/// In-process chat world for the single-process server: the roster and the
/// user-pipe edges all live in the selector thread, and an edge is a plain
/// anonymous pipe pair held until its receiver claims it.
#[derive(Debug, Default)]
pub struct LocalChat {
    peers: BTreeMap<SessionId, ChatPeer>,
    edges: HashMap<(SessionId, SessionId), PipePair>,
}

impl LocalChat {
    pub fn join(&mut self, id: SessionId, sock: RawFd, ip: String, port: u16) {
        self.peers.insert(
            id,
            ChatPeer {
                sock,
                name: NO_NAME.to_string(),
                ip,
                port,
            },
        );
    }

    pub fn is_online(&self, id: SessionId) -> bool {
        self.peers.contains_key(&id)
    }
}

impl World for LocalChat {
    fn deliver(&mut self, id: SessionId, msg: &str) {
        if let Some(peer) = self.peers.get(&id) {
            // A client that vanished mid-write is torn down by the selector.
            let _ = write_all(peer.sock, msg.as_bytes());
        }
    }

    fn broadcast(&mut self, msg: &str) {
        for peer in self.peers.values() {
            let _ = write_all(peer.sock, msg.as_bytes());
        }
    }

    fn peer(&self, id: SessionId) -> Option<PeerInfo> {
        self.peers.get(&id).map(|p| PeerInfo {
            id,
            name: p.name.clone(),
            ip: p.ip.clone(),
            port: p.port,
        })
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(id, p)| PeerInfo {
                id: *id,
                name: p.name.clone(),
                ip: p.ip.clone(),
                port: p.port,
            })
            .collect()
    }

    fn rename(&mut self, id: SessionId, new_name: &str) -> bool {
        if self.peers.values().any(|p| p.name == new_name) {
            return false;
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.name = new_name.to_string();
            return true;
        }
        false
    }

    fn user_pipe_send(
        &mut self,
        src: SessionId,
        dst: SessionId,
        line: &str,
    ) -> Result<UserPipeTx, UserPipeError> {
        if !self.peers.contains_key(&dst) {
            return Err(UserPipeError::NoSuchUser(dst));
        }
        if self.edges.contains_key(&(src, dst)) {
            return Err(UserPipeError::AlreadyExists(src, dst));
        }
        let pair = PipePair::new()?;
        let tx = pair.write.as_raw_fd();
        self.edges.insert((src, dst), pair);

        let src_name = self.peer(src).map(|p| p.name).unwrap_or_default();
        let dst_name = self.peer(dst).map(|p| p.name).unwrap_or_default();
        self.broadcast(&format!(
            "*** {src_name} (#{src}) just piped '{line}' to {dst_name} (#{dst}) ***\n"
        ));
        Ok(UserPipeTx::Shared(tx))
    }

    fn user_pipe_recv(
        &mut self,
        src: SessionId,
        dst: SessionId,
        line: &str,
    ) -> Result<OwnedFd, UserPipeError> {
        if !self.peers.contains_key(&src) {
            return Err(UserPipeError::NoSuchUser(src));
        }
        let Some(pair) = self.edges.remove(&(src, dst)) else {
            return Err(UserPipeError::NotYet(src, dst));
        };

        let src_name = self.peer(src).map(|p| p.name).unwrap_or_default();
        let dst_name = self.peer(dst).map(|p| p.name).unwrap_or_default();
        self.broadcast(&format!(
            "*** {dst_name} (#{dst}) just received from {src_name} (#{src}) by '{line}' ***\n"
        ));

        // Dropping the registry's write end leaves the sender's child as the
        // only writer; EOF follows its exit.
        let PipePair { read, write } = pair;
        drop(write);
        Ok(read)
    }

    fn remove(&mut self, id: SessionId) {
        if let Some(peer) = self.peers.get(&id) {
            let name = peer.name.clone();
            self.broadcast(&format!("*** User '{name}' left. ***\n"));
        }
        self.edges.retain(|(src, dst), _| *src != id && *dst != id);
        self.peers.remove(&id);
    }
}
