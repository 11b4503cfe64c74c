// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{OwnedFd, RawFd};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("interior NUL byte in command: {0}")]
    Nul(#[from] std::ffi::NulError),
}

/// A command fully flattened into C buffers ahead of `fork`, so the child
/// only performs async-signal-safe calls between `fork` and `execve`.
///
/// The search path is taken from the supplied environment's `PATH` (not the
/// process environment); an `argv[0]` containing `/` is exec'd verbatim.
// The *_cstrings fields are just storage backing the pointer arrays.
#[allow(dead_code)]
pub struct PreparedCommand {
    candidates: Vec<CString>,
    args_cstrings: Vec<CString>,
    args_ptrs: Vec<*const libc::c_char>,
    env_cstrings: Vec<CString>,
    env_ptrs: Vec<*const libc::c_char>,
    unknown_msg: Vec<u8>,
}

impl PreparedCommand {
    pub fn new(argv: &[String], env: &HashMap<String, String>) -> Result<Self, CommandError> {
        // An empty argv still execs (and fails), yielding `Unknown command: [].`
        let program = argv.first().map(String::as_str).unwrap_or("");

        let candidates: Vec<CString> = if program.contains('/') {
            vec![CString::new(program)?]
        } else {
            let path = env.get("PATH").map(String::as_str).unwrap_or("bin:.");
            path.split(':')
                .map(|dir| {
                    if dir.is_empty() {
                        CString::new(program)
                    } else {
                        CString::new(format!("{dir}/{program}"))
                    }
                })
                .collect::<Result<_, _>>()?
        };

        let args_cstrings: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<Result<_, _>>()?;
        let args_ptrs: Vec<*const libc::c_char> = args_cstrings
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let env_cstrings: Vec<CString> = env
            .iter()
            .map(|(key, value)| CString::new(format!("{key}={value}")))
            .collect::<Result<_, _>>()?;
        let env_ptrs: Vec<*const libc::c_char> = env_cstrings
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            candidates,
            args_cstrings,
            args_ptrs,
            env_cstrings,
            env_ptrs,
            unknown_msg: format!("Unknown command: [{program}].\n").into_bytes(),
        })
    }

    /// Tries `execve` on every search-path candidate in order. Only returns
    /// on failure, with the errno of the last attempt.
    pub fn exec(&self) -> Errno {
        let mut last = Errno::ENOENT;
        for candidate in &self.candidates {
            // Safety: all buffers are NUL-terminated and the pointer arrays
            // are null-terminated, by construction in `new`.
            unsafe {
                libc::execve(
                    candidate.as_ptr(),
                    self.args_ptrs.as_ptr(),
                    self.env_ptrs.as_ptr(),
                );
            }
            last = Errno::last();
        }
        last
    }

    /// Child-side tail: exec the program, or report the shell's
    /// unknown-command diagnostic on stderr and exit nonzero.
    pub fn exec_or_unknown(&self) -> ! {
        self.exec();
        // Safety: plain write(2) on an owned buffer; async-signal-safe.
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                self.unknown_msg.as_ptr().cast(),
                self.unknown_msg.len(),
            );
        }
        terminate();
    }
}

/// SIGCHLD is ignored in every server so the kernel auto-reaps children
/// nobody waits for; no zombies on any path.
pub fn ignore_sigchld() -> nix::Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // Safety: SigIgn carries no handler code.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }.map(|_| ())
}

/// A peer hanging up mid-write must surface as EPIPE, not kill the server.
pub fn ignore_sigpipe() -> nix::Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // Safety: SigIgn carries no handler code.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.map(|_| ())
}

/// Kills the process without raising an abort or running at_exit handlers.
pub fn terminate() -> ! {
    // Safety: no preconditions
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

/// Blocking wait for one specific child.
///
/// The servers ignore SIGCHLD so the kernel auto-reaps; `waitpid` then still
/// blocks until the child is gone but reports `ECHILD`, which counts as
/// completion here.
pub fn wait_foreground(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
}

/// One non-blocking reap attempt for a background child. Under an ignored
/// SIGCHLD this is a no-op safety net, never an obligation.
pub fn reap_background(pid: Pid) {
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
}

/// Blocks until any child changes state. Used to ride out process-table
/// exhaustion before retrying `fork`; an immediate `ECHILD` is fine, the
/// caller retries regardless.
pub fn wait_for_any_child() {
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
}

pub fn open_devnull_read() -> io::Result<OwnedFd> {
    Ok(File::open("/dev/null")?.into())
}

pub fn open_devnull_write() -> io::Result<OwnedFd> {
    Ok(OpenOptions::new().write(true).open("/dev/null")?.into())
}

/// `write(2)` the whole buffer, retrying on EINTR and partial writes.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // Safety: fd is live for the duration of the call, buf is owned.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// One `read(2)`, retrying on EINTR. Returns 0 on end of stream.
pub fn read_some(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // Safety: fd is live for the duration of the call, buf is owned.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(n as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env(path: &str) -> HashMap<String, String> {
        HashMap::from([("PATH".to_string(), path.to_string())])
    }

    #[test]
    fn test_candidates_follow_session_path() {
        let cmd = PreparedCommand::new(&["ls".to_string()], &env("bin:.")).unwrap();
        let paths: Vec<_> = cmd
            .candidates
            .iter()
            .map(|c| c.to_str().unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["bin/ls".to_string(), "./ls".to_string()]);
    }

    #[test]
    fn test_absolute_program_skips_search() {
        let cmd = PreparedCommand::new(&["/bin/ls".to_string()], &env("bin:.")).unwrap();
        assert_eq!(cmd.candidates.len(), 1);
        assert_eq!(cmd.candidates[0].to_str().unwrap(), "/bin/ls");
    }

    #[test]
    fn test_unknown_message_format() {
        let cmd = PreparedCommand::new(&["nosuch".to_string()], &env("bin:.")).unwrap();
        assert_eq!(cmd.unknown_msg, b"Unknown command: [nosuch].\n");
    }

    #[test]
    fn test_empty_argv_still_prepares() {
        let cmd = PreparedCommand::new(&[], &HashMap::new()).unwrap();
        assert_eq!(cmd.unknown_msg, b"Unknown command: [].\n");
        assert_eq!(cmd.args_ptrs.len(), 1);
        assert!(cmd.args_ptrs[0].is_null());
    }

    #[test]
    fn test_argv_and_env_are_null_terminated() {
        let mut e = env("/bin");
        e.insert("LANG".to_string(), "C".to_string());
        let cmd = PreparedCommand::new(&["ls".to_string(), "-l".to_string()], &e).unwrap();
        assert_eq!(cmd.args_ptrs.len(), 3);
        assert!(cmd.args_ptrs[2].is_null());
        assert_eq!(cmd.env_ptrs.len(), 3);
        assert!(cmd.env_ptrs[2].is_null());
    }

    #[test]
    fn test_write_read_roundtrip() {
        use std::os::fd::AsRawFd;
        let (r, w) = nix::unistd::pipe().unwrap();
        write_all(w.as_raw_fd(), b"hello").unwrap();
        drop(w);
        let mut buf = [0u8; 16];
        let n = read_some(r.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(read_some(r.as_raw_fd(), &mut buf).unwrap(), 0);
    }
}
