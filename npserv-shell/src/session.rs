// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::pipes::PipeTable;
use npserv_common::config::MAX_CLIENTS;
use std::collections::HashMap;
use std::os::fd::RawFd;

pub type SessionId = i32;

pub const DEFAULT_PATH: &str = "bin:.";

/// Per-connection shell state: the environment exported to children and the
/// table of pending numbered pipes. Sessions never share pipe tables.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub env: HashMap<String, String>,
    pub pipes: PipeTable,
    /// In the single-process server the children's default stdio is the
    /// client socket; fork-per-connection variants already run with their
    /// stdio dup'ed onto the socket and leave this unset.
    pub client_fd: Option<RawFd>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Session {
            id,
            env: HashMap::from([("PATH".to_string(), DEFAULT_PATH.to_string())]),
            pipes: PipeTable::default(),
            client_fd: None,
        }
    }

    pub fn with_client_fd(id: SessionId, client_fd: RawFd) -> Self {
        Session {
            client_fd: Some(client_fd),
            ..Session::new(id)
        }
    }
}

/// Hands out session ids in `1..=MAX_CLIENTS`, always the smallest free one,
/// so departing users' ids are promptly reused.
#[derive(Debug, Default)]
pub struct IdAllocator {
    used: [bool; MAX_CLIENTS],
}

impl IdAllocator {
    pub fn allocate(&mut self) -> Option<SessionId> {
        for (idx, used) in self.used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Some(idx as SessionId + 1);
            }
        }
        None
    }

    pub fn release(&mut self, id: SessionId) {
        if (1..=MAX_CLIENTS as SessionId).contains(&id) {
            self.used[(id - 1) as usize] = false;
        }
    }
}
