// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Both ends of an anonymous pipe, owned together. Created close-on-exec so
/// forked children only keep the ends that were dup'ed onto their stdio.
#[derive(Debug)]
pub struct PipePair {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl PipePair {
    pub fn new() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(PipePair { read, write })
    }
}

/// Per-session table of pending pipes keyed by remaining line count.
///
/// Key 0 is "ready": it feeds the next stage that asks for input. An
/// ordinary pipe lives at key 0 for the duration of one line; a numbered
/// pipe `|N` enters at key N and decays one key per executed line until a
/// stage consumes it. At most one pipe exists per key.
#[derive(Debug, Default)]
pub struct PipeTable {
    slots: HashMap<u32, PipePair>,
}

impl PipeTable {
    /// Returns the write end for the given key, creating the pipe on first
    /// use. The table keeps ownership; callers only borrow the descriptor
    /// for the duration of one fork.
    pub fn ensure(&mut self, key: u32) -> io::Result<RawFd> {
        let pair = match self.slots.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => v.insert(PipePair::new()?),
        };
        Ok(pair.write.as_raw_fd())
    }

    /// Moves the ready (key 0) pipe out of the table, if any. The caller
    /// keeps the read end for the stage's stdin and drops the write end so
    /// EOF can reach the reader once all writers exit.
    pub fn take_ready(&mut self) -> Option<PipePair> {
        self.slots.remove(&0)
    }

    /// Advances the table by one executed line: every key decreases by one
    /// and a pipe that would fall below zero is closed and discarded.
    pub fn tick(&mut self) {
        self.slots = self
            .slots
            .drain()
            .filter_map(|(key, pair)| key.checked_sub(1).map(|k| (k, pair)))
            .collect();
    }

    pub fn contains(&self, key: u32) -> bool {
        self.slots.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_most_one_pipe_per_key() {
        let mut table = PipeTable::default();
        let first = table.ensure(3).unwrap();
        let second = table.ensure(3).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_tick_decays_and_expires() {
        let mut table = PipeTable::default();
        table.ensure(2).unwrap();
        table.tick();
        assert!(table.contains(1));
        table.tick();
        assert!(table.contains(0));
        table.tick();
        assert!(table.is_empty());
    }

    #[test]
    fn test_take_ready_removes_entry() {
        let mut table = PipeTable::default();
        table.ensure(0).unwrap();
        let pair = table.take_ready().unwrap();
        assert!(table.is_empty());
        assert!(table.take_ready().is_none());
        drop(pair);
    }

    #[test]
    fn test_data_survives_decay() {
        let mut table = PipeTable::default();
        let w = table.ensure(1).unwrap();
        npserv_common::unix_utils::write_all(w, b"later").unwrap();
        table.tick();

        let PipePair { read, write } = table.take_ready().unwrap();
        drop(write);
        let mut buf = [0u8; 8];
        let n = npserv_common::unix_utils::read_some(read.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"later");
    }
}
