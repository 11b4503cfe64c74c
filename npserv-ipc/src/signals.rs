// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal-driven delivery between session processes.
//!
//! SIGUSR1 means "text is waiting in your shared-memory inbox": the handler
//! flushes the inbox to the session's stdout (the dup'ed client socket).
//! SIGUSR2 means "a peer is about to open a FIFO to you": the handler opens
//! the read end non-blocking and parks the descriptor so the sender's
//! blocking write-open can complete. Handlers reach their state through
//! atomics only and make nothing but async-signal-safe calls.

use crate::fifo::UserPipeDir;
use crate::shm::{ClientTable, Slot};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use npserv_common::config::MAX_CLIENTS;
use std::ffi::CString;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

const PATH_BUF: usize = 512;

static MY_SLOT: AtomicPtr<Slot> = AtomicPtr::new(std::ptr::null_mut());
static MY_ID: AtomicI32 = AtomicI32::new(0);
static FIFO_DIR: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

// Read ends opened by the SIGUSR2 handler, indexed by sender id; -1 = none.
static PENDING: [AtomicI32; MAX_CLIENTS + 1] = [const { AtomicI32::new(-1) }; MAX_CLIENTS + 1];

// Parent-side teardown state for INT/QUIT/TERM.
static CLEANUP_SHM: AtomicI32 = AtomicI32::new(-1);
static CLEANUP_BASE: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());
static CLEANUP_DIR: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

fn append(out: &mut [u8], pos: usize, bytes: &[u8]) -> Option<usize> {
    let end = pos.checked_add(bytes.len())?;
    if end >= out.len() {
        return None;
    }
    out[pos..end].copy_from_slice(bytes);
    Some(end)
}

fn append_i32(out: &mut [u8], pos: usize, n: i32) -> Option<usize> {
    let mut digits = [0u8; 10];
    let mut i = 0;
    let mut n = n.max(0);
    if n == 0 {
        digits[0] = b'0';
        i = 1;
    }
    while n > 0 {
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        i += 1;
    }
    digits[..i].reverse();
    append(out, pos, &digits[..i])
}

/// Formats `<dir>/pipe_<src>_<dst>` with a trailing NUL, allocation-free so
/// the handlers can use it.
pub(crate) fn fifo_path_bytes(dir: &[u8], src: i32, dst: i32, out: &mut [u8]) -> Option<usize> {
    let mut pos = append(out, 0, dir)?;
    pos = append(out, pos, b"/pipe_")?;
    pos = append_i32(out, pos, src)?;
    pos = append(out, pos, b"_")?;
    pos = append_i32(out, pos, dst)?;
    out[pos] = 0;
    Some(pos)
}

extern "C" fn on_sigusr1(_: libc::c_int) {
    let slot = MY_SLOT.load(Ordering::Acquire);
    if slot.is_null() {
        return;
    }
    // Safety: the slot pointer targets the attached shared segment; only
    // strlen/write/memset run here, all async-signal-safe.
    unsafe {
        let inbox = std::ptr::addr_of_mut!((*slot).inbox) as *mut libc::c_char;
        let len = libc::strlen(inbox);
        if len > 0 {
            libc::write(libc::STDOUT_FILENO, inbox.cast(), len);
            libc::memset(inbox.cast(), 0, len);
        }
    }
}

extern "C" fn on_sigusr2(_: libc::c_int) {
    let me = MY_ID.load(Ordering::Acquire);
    let dir = FIFO_DIR.load(Ordering::Acquire);
    if me <= 0 || dir.is_null() {
        return;
    }
    // Safety: dir is a leaked NUL-terminated string; open/access/close are
    // async-signal-safe.
    unsafe {
        let dir_bytes = std::slice::from_raw_parts(dir as *const u8, libc::strlen(dir));
        let mut path = [0u8; PATH_BUF];
        for src in 1..=MAX_CLIENTS as i32 {
            if fifo_path_bytes(dir_bytes, src, me, &mut path).is_none() {
                continue;
            }
            if libc::access(path.as_ptr().cast(), libc::F_OK) != 0 {
                continue;
            }
            if PENDING[src as usize].load(Ordering::Acquire) >= 0 {
                continue;
            }
            let fd = libc::open(
                path.as_ptr().cast(),
                libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            );
            if fd >= 0
                && PENDING[src as usize]
                    .compare_exchange(-1, fd, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                libc::close(fd);
            }
        }
    }
}

extern "C" fn on_terminate(_: libc::c_int) {
    let dir = CLEANUP_DIR.load(Ordering::Acquire);
    // Safety: teardown path; only unlink/rmdir/shmdt/shmctl/_exit, all
    // fine in a handler that never returns.
    unsafe {
        if !dir.is_null() {
            let dir_bytes = std::slice::from_raw_parts(dir as *const u8, libc::strlen(dir));
            let mut path = [0u8; PATH_BUF];
            for src in 1..=MAX_CLIENTS as i32 {
                for dst in 1..=MAX_CLIENTS as i32 {
                    if fifo_path_bytes(dir_bytes, src, dst, &mut path).is_some() {
                        libc::unlink(path.as_ptr().cast());
                    }
                }
            }
            libc::rmdir(dir);
        }
        let base = CLEANUP_BASE.load(Ordering::Acquire);
        if !base.is_null() {
            libc::shmdt(base);
        }
        let shm_id = CLEANUP_SHM.load(Ordering::Acquire);
        if shm_id >= 0 {
            libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut());
        }
        libc::_exit(0);
    }
}

fn install(sig: Signal, handler: extern "C" fn(libc::c_int)) -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // Safety: handlers above restrict themselves to async-signal-safe calls.
    unsafe { sigaction(sig, &action) }.map(|_| ())
}

fn leak_dir(pipes: &UserPipeDir) -> *mut libc::c_char {
    let bytes = pipes.dir().as_os_str().as_encoded_bytes().to_vec();
    match CString::new(bytes) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Child-side registration, run once right after the session process forks:
/// wires SIGUSR1 to this session's inbox and SIGUSR2 to its FIFO scan.
pub fn install_session_handlers(
    table: &ClientTable,
    pipes: &UserPipeDir,
    my_id: i32,
) -> nix::Result<()> {
    if let Some(slot) = table.slot_ptr(my_id) {
        MY_SLOT.store(slot, Ordering::Release);
    }
    MY_ID.store(my_id, Ordering::Release);
    FIFO_DIR.store(leak_dir(pipes), Ordering::Release);
    install(Signal::SIGUSR1, on_sigusr1)?;
    install(Signal::SIGUSR2, on_sigusr2)
}

/// Parent-side registration: INT/QUIT/TERM purge the FIFOs and remove the
/// shared segment before exiting.
pub fn install_cleanup_handlers(table: &ClientTable, pipes: &UserPipeDir) -> nix::Result<()> {
    CLEANUP_SHM.store(table.shm_id(), Ordering::Release);
    CLEANUP_BASE.store(
        table.slot_ptr(1).map(|p| p.cast()).unwrap_or(std::ptr::null_mut()),
        Ordering::Release,
    );
    CLEANUP_DIR.store(leak_dir(pipes), Ordering::Release);
    install(Signal::SIGINT, on_terminate)?;
    install(Signal::SIGQUIT, on_terminate)?;
    install(Signal::SIGTERM, on_terminate)
}

/// Takes the fd the SIGUSR2 handler parked for `src`, switching it back to
/// blocking mode for the stage that will read from it.
pub fn claim_pending(src: i32) -> Option<OwnedFd> {
    if !(1..=MAX_CLIENTS as i32).contains(&src) {
        return None;
    }
    let fd = PENDING[src as usize].swap(-1, Ordering::AcqRel);
    if fd < 0 {
        return None;
    }
    // Safety: the handler opened this fd and the swap transferred ownership.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
        }
        Some(OwnedFd::from_raw_fd(fd))
    }
}

/// Closes a parked fd whose FIFO went away (its sender left).
pub fn drop_pending(src: i32) {
    if let Some(fd) = claim_pending(src) {
        drop(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn path_string(dir: &str, src: i32, dst: i32) -> String {
        let mut buf = [0u8; PATH_BUF];
        let len = fifo_path_bytes(dir.as_bytes(), src, dst, &mut buf).unwrap();
        String::from_utf8_lossy(&buf[..len]).into_owned()
    }

    #[test]
    fn test_fifo_path_formatting() {
        assert_eq!(path_string("user_pipe", 1, 2), "user_pipe/pipe_1_2");
        assert_eq!(path_string("/tmp/up", 12, 30), "/tmp/up/pipe_12_30");
    }

    #[test]
    fn test_fifo_path_rejects_overflow() {
        let dir = "d".repeat(PATH_BUF);
        let mut buf = [0u8; PATH_BUF];
        assert!(fifo_path_bytes(dir.as_bytes(), 1, 2, &mut buf).is_none());
    }

    #[test]
    fn test_claim_pending_empty_and_out_of_range() {
        assert!(claim_pending(7).is_none());
        assert!(claim_pending(0).is_none());
        assert!(claim_pending(MAX_CLIENTS as i32 + 1).is_none());
    }

    #[test]
    fn test_claim_pending_returns_parked_fd_blocking() {
        use std::os::fd::IntoRawFd;
        let (read, write) = nix::unistd::pipe().unwrap();
        let raw = read.into_raw_fd();
        // Park it exactly the way the handler does.
        unsafe {
            let flags = libc::fcntl(raw, libc::F_GETFL);
            libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        PENDING[5].store(raw, Ordering::Release);

        let fd = claim_pending(5).unwrap();
        let flags = unsafe { libc::fcntl(std::os::fd::AsRawFd::as_raw_fd(&fd), libc::F_GETFL) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        assert!(claim_pending(5).is_none());
        drop(write);
    }
}
