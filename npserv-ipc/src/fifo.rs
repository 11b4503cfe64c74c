// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use npserv_common::config::{Config, MAX_CLIENTS};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// The on-disk side of inter-session pipes: one FIFO per live edge, named
/// `pipe_<src>_<dst>`, mode 0600, unlinked as soon as its receiver claims
/// it or either side departs.
#[derive(Debug, Clone)]
pub struct UserPipeDir {
    dir: PathBuf,
}

impl UserPipeDir {
    pub fn new(dir: PathBuf) -> Self {
        UserPipeDir { dir }
    }

    pub fn from_config() -> Self {
        Self::new(Config::get().user_pipe_dir.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, src: i32, dst: i32) -> PathBuf {
        self.dir.join(format!("pipe_{src}_{dst}"))
    }

    /// Creates the directory at server start.
    pub fn ensure(&self) -> io::Result<()> {
        match std::fs::create_dir(&self.dir) {
            Err(e) if e.kind() != io::ErrorKind::AlreadyExists => Err(e),
            _ => Ok(()),
        }
    }

    pub fn exists(&self, src: i32, dst: i32) -> bool {
        self.path(src, dst).exists()
    }

    pub fn create(&self, src: i32, dst: i32) -> io::Result<()> {
        mkfifo(&self.path(src, dst), Mode::S_IRUSR | Mode::S_IWUSR)?;
        Ok(())
    }

    /// Sender side. Blocks until the receiver has a read end open, which is
    /// what the SIGUSR2 nudge arranges.
    pub fn open_write_blocking(&self, src: i32, dst: i32) -> io::Result<OwnedFd> {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(self.path(src, dst))?;
        Ok(file.into())
    }

    /// Receiver-side fallback when the signal handler did not park an fd.
    pub fn open_read_blocking(&self, src: i32, dst: i32) -> io::Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(self.path(src, dst))?;
        Ok(file.into())
    }

    pub fn unlink(&self, src: i32, dst: i32) {
        let _ = std::fs::remove_file(self.path(src, dst));
    }

    /// Drops every edge touching a departing session, both directions.
    pub fn cleanup_session(&self, id: i32) {
        for peer in 1..=MAX_CLIENTS as i32 {
            self.unlink(id, peer);
            self.unlink(peer, id);
        }
    }

    /// Server teardown: all edges, then the directory itself.
    pub fn remove_all(&self) {
        for src in 1..=MAX_CLIENTS as i32 {
            self.cleanup_session(src);
        }
        let _ = std::fs::remove_dir(&self.dir);
    }
}
