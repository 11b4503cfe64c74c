// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::parser::{PipeOut, Stage};
use crate::session::Session;
use crate::world::{UserPipeError, UserPipeTx, World};
use nix::unistd::Pid;
use npserv_common::unix_utils::{
    open_devnull_read, open_devnull_write, reap_background, wait_for_any_child, wait_foreground,
    PreparedCommand,
};
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

const REDIRECT_ERR: &[u8] = b"cannot open output file\n";

/// Where a stage's stdout/stderr goes from the parent's point of view.
enum OutFd {
    /// No redirection; the child falls back to the client socket (or its
    /// inherited stdio).
    Inherit,
    /// Write end owned elsewhere (numbered-pipe table, user-pipe registry).
    Borrowed(RawFd),
    /// Write end owned by this stage's parent, closed right after fork.
    Owned(OwnedFd),
}

impl OutFd {
    fn raw(&self) -> Option<RawFd> {
        match self {
            OutFd::Inherit => None,
            OutFd::Borrowed(fd) => Some(*fd),
            OutFd::Owned(fd) => Some(fd.as_raw_fd()),
        }
    }
}

/// Raw material for the child, fully prepared before fork: between fork and
/// exec only async-signal-safe calls happen.
struct ChildSpec {
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    stderr: Option<RawFd>,
    client: Option<RawFd>,
    redirect: Option<CString>,
}

/// Runs every stage of one parsed line, left to right.
///
/// Pipe-table lookups, user-pipe registry calls and the per-stage wait
/// discipline follow one rule set: a stage that feeds nothing runs in the
/// foreground; a stage that feeds a pipe (ordinary, numbered, or user) is
/// left to the kernel's auto-reap.
pub fn run_stages(
    session: &mut Session,
    world: &mut dyn World,
    stages: &[Stage],
    line: &str,
) -> io::Result<()> {
    for stage in stages {
        // A ready pipe (key 0) feeds this stage. Dropping the write half
        // here leaves the writer children as the only writers.
        let mut stdin_fd: Option<OwnedFd> = session.pipes.take_ready().map(|pair| {
            drop(pair.write);
            pair.read
        });

        let mut stdout_fd = OutFd::Inherit;
        let mut stderr_fd = OutFd::Inherit;
        match stage.pipe_out {
            PipeOut::None => {}
            PipeOut::Ordinary | PipeOut::Numbered(_) => {
                let key = match stage.pipe_out {
                    PipeOut::Numbered(n) => n,
                    _ => 0,
                };
                let write_end = session.pipes.ensure(key)?;
                stdout_fd = OutFd::Borrowed(write_end);
                if stage.merge_stderr {
                    stderr_fd = OutFd::Borrowed(write_end);
                }
            }
        }

        if let Some(src) = stage.user_pipe_in {
            match world.user_pipe_recv(src, session.id, line) {
                Ok(fd) => stdin_fd = Some(fd),
                Err(UserPipeError::Io(e)) => return Err(e),
                Err(e) => {
                    world.deliver(session.id, &e.to_string());
                    stdin_fd = Some(open_devnull_read()?);
                }
            }
        }

        if let Some(dst) = stage.user_pipe_out {
            match world.user_pipe_send(session.id, dst, line) {
                Ok(UserPipeTx::Shared(fd)) => stdout_fd = OutFd::Borrowed(fd),
                Ok(UserPipeTx::Owned(fd)) => stdout_fd = OutFd::Owned(fd),
                Err(UserPipeError::Io(e)) => return Err(e),
                Err(e) => {
                    world.deliver(session.id, &e.to_string());
                    stdout_fd = OutFd::Owned(open_devnull_write()?);
                }
            }
        }

        let prepared = PreparedCommand::new(&stage.argv, &session.env)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let redirect = stage
            .file_redirect
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let spec = ChildSpec {
            stdin: stdin_fd.as_ref().map(|fd| fd.as_raw_fd()),
            stdout: stdout_fd.raw(),
            stderr: stderr_fd.raw(),
            client: session.client_fd,
            redirect,
        };

        let pid = spawn_until_success(&prepared, &spec);
        tracing::trace!(pid, argv = ?stage.argv, "stage spawned");

        // Parent: give up this stage's private descriptors; the child keeps
        // its dup'ed copies.
        drop(stdin_fd);
        if let OutFd::Owned(fd) = stdout_fd {
            drop(fd);
        }

        let foreground = stage.pipe_out == PipeOut::None && stage.user_pipe_out.is_none();
        if foreground {
            wait_foreground(Pid::from_raw(pid));
        } else {
            reap_background(Pid::from_raw(pid));
        }
    }
    Ok(())
}

/// Forks until it succeeds: process-table exhaustion is ridden out by
/// blocking on any child reap and trying again.
fn spawn_until_success(cmd: &PreparedCommand, spec: &ChildSpec) -> libc::pid_t {
    loop {
        // Safety: the child touches only pre-forked buffers and makes only
        // async-signal-safe calls before execve.
        match unsafe { libc::fork() } {
            0 => run_stage_child(cmd, spec),
            pid if pid > 0 => return pid,
            _ => wait_for_any_child(),
        }
    }
}

/// Child-side tail of a stage. Every descriptor we created is close-on-exec;
/// `dup2` clears the flag on the copies that become the child's stdio, so
/// nothing else survives the exec.
fn run_stage_child(cmd: &PreparedCommand, spec: &ChildSpec) -> ! {
    // Safety: only async-signal-safe libc calls on prepared buffers.
    unsafe {
        match (spec.stdin, spec.client) {
            (Some(fd), _) => {
                libc::dup2(fd, libc::STDIN_FILENO);
            }
            (None, Some(sock)) => {
                libc::dup2(sock, libc::STDIN_FILENO);
            }
            (None, None) => {}
        }
        match (spec.stdout, spec.client) {
            (Some(fd), _) => {
                libc::dup2(fd, libc::STDOUT_FILENO);
            }
            (None, Some(sock)) => {
                libc::dup2(sock, libc::STDOUT_FILENO);
            }
            (None, None) => {}
        }
        match (spec.stderr, spec.client) {
            (Some(fd), _) => {
                libc::dup2(fd, libc::STDERR_FILENO);
            }
            (None, Some(sock)) => {
                libc::dup2(sock, libc::STDERR_FILENO);
            }
            (None, None) => {}
        }

        // The redirect wins over whatever stdout was wired to.
        if let Some(path) = &spec.redirect {
            let fd = libc::open(
                path.as_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
                0o644 as libc::c_uint,
            );
            if fd < 0 {
                libc::write(
                    libc::STDERR_FILENO,
                    REDIRECT_ERR.as_ptr().cast(),
                    REDIRECT_ERR.len(),
                );
                libc::_exit(1);
            }
            libc::dup2(fd, libc::STDOUT_FILENO);
        }

        // The servers run with SIGCHLD and SIGPIPE ignored; programs we
        // exec expect the default dispositions.
        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
    cmd.exec_or_unknown()
}
