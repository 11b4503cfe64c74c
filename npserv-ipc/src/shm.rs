// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use npserv_common::config::MAX_CLIENTS;
use std::io;

pub const NAME_LEN: usize = 21;
pub const IP_LEN: usize = 16;
pub const INBOX_LEN: usize = 1024;

/// One client's slot in the shared segment. Strings are NUL-padded C
/// strings so every process, parent and children alike, reads the same
/// bytes.
#[repr(C)]
pub struct Slot {
    pub(crate) used: i32,
    pub(crate) id: i32,
    pub(crate) port: i32,
    pub(crate) pid: i32,
    pub(crate) ip: [u8; IP_LEN],
    pub(crate) name: [u8; NAME_LEN],
    pub(crate) inbox: [u8; INBOX_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: i32,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub pid: i32,
}

/// The shared client roster: a SysV segment of `MAX_CLIENTS` fixed slots,
/// attached once by the accept loop and inherited across fork by every
/// session process.
///
/// Each session owns its slot; peers only append to inboxes and read the
/// rest. Delivery is append-then-SIGUSR1; the recipient's handler flushes
/// its inbox to its own stdout. Clones are views of the same attachment;
/// nothing detaches implicitly, only [`ClientTable::destroy`].
#[derive(Clone)]
pub struct ClientTable {
    base: *mut Slot,
    shm_id: libc::c_int,
}

// The raw pointer targets shared memory that outlives every holder.
unsafe impl Send for ClientTable {}
unsafe impl Sync for ClientTable {}

fn set_cstr(dst: &mut [u8], src: &str) {
    dst.fill(0);
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
}

fn get_cstr(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

impl ClientTable {
    /// Creates (or joins) the segment for `key` and zeroes every slot. Pass
    /// `libc::IPC_PRIVATE` for an anonymous segment, as the tests do.
    pub fn create(key: i32) -> io::Result<Self> {
        let size = MAX_CLIENTS * std::mem::size_of::<Slot>();
        // Safety: plain SysV calls; the segment is sized for MAX_CLIENTS
        // slots and zeroed before anyone else can see it.
        let (shm_id, base) = unsafe {
            let shm_id = libc::shmget(key as libc::key_t, size, libc::IPC_CREAT | 0o666);
            if shm_id < 0 {
                return Err(io::Error::last_os_error());
            }
            let base = libc::shmat(shm_id, std::ptr::null(), 0);
            if base as isize == -1 {
                return Err(io::Error::last_os_error());
            }
            libc::memset(base, 0, size);
            (shm_id, base as *mut Slot)
        };
        Ok(ClientTable { base, shm_id })
    }

    fn slot(&self, id: i32) -> Option<*mut Slot> {
        if (1..=MAX_CLIENTS as i32).contains(&id) {
            // Safety: id is within the segment.
            Some(unsafe { self.base.add((id - 1) as usize) })
        } else {
            None
        }
    }

    /// Raw slot pointer for the signal handlers. Valid as long as the
    /// segment stays attached, which is the life of the session process.
    pub fn slot_ptr(&self, id: i32) -> Option<*mut Slot> {
        self.slot(id)
    }

    /// Claims the smallest free slot, or None when all thirty are taken.
    pub fn claim(&self, name: &str, ip: &str, port: u16, pid: i32) -> Option<i32> {
        for id in 1..=MAX_CLIENTS as i32 {
            #[allow(clippy::unwrap_used)]
            let slot = self.slot(id).unwrap();
            // Safety: in-segment pointer; the accept loop claims slots one
            // connection at a time.
            unsafe {
                if (*slot).used == 0 {
                    (*slot).used = 1;
                    (*slot).id = id;
                    (*slot).port = port as i32;
                    (*slot).pid = pid;
                    set_cstr(&mut (*slot).ip, ip);
                    set_cstr(&mut (*slot).name, name);
                    (*slot).inbox.fill(0);
                    return Some(id);
                }
            }
        }
        None
    }

    pub fn release(&self, id: i32) {
        if let Some(slot) = self.slot(id) {
            // Safety: in-segment pointer.
            unsafe {
                (*slot).used = 0;
                (*slot).id = 0;
                (*slot).port = 0;
                (*slot).pid = 0;
                (*slot).ip.fill(0);
                (*slot).name.fill(0);
                (*slot).inbox.fill(0);
            }
        }
    }

    pub fn is_used(&self, id: i32) -> bool {
        self.slot(id)
            // Safety: in-segment pointer.
            .map(|slot| unsafe { (*slot).used != 0 })
            .unwrap_or(false)
    }

    pub fn info(&self, id: i32) -> Option<SlotInfo> {
        let slot = self.slot(id)?;
        // Safety: in-segment pointer.
        unsafe {
            if (*slot).used == 0 {
                return None;
            }
            Some(SlotInfo {
                id,
                name: get_cstr(&(*slot).name),
                ip: get_cstr(&(*slot).ip),
                port: (*slot).port as u16,
                pid: (*slot).pid,
            })
        }
    }

    pub fn infos(&self) -> Vec<SlotInfo> {
        (1..=MAX_CLIENTS as i32)
            .filter_map(|id| self.info(id))
            .collect()
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.infos().iter().any(|i| i.name == name)
    }

    pub fn set_name(&self, id: i32, name: &str) {
        if let Some(slot) = self.slot(id) {
            // Safety: in-segment pointer.
            unsafe { set_cstr(&mut (*slot).name, name) }
        }
    }

    /// Appends to the slot's inbox (truncating at capacity) and pokes the
    /// owner with SIGUSR1 so it flushes the inbox to its client.
    pub fn send_to(&self, id: i32, msg: &str) {
        let Some(slot) = self.slot(id) else { return };
        // Safety: in-segment pointer; bounded append.
        let pid = unsafe {
            if (*slot).used == 0 {
                return;
            }
            let inbox = &mut (*slot).inbox;
            let len = inbox.iter().position(|&b| b == 0).unwrap_or(INBOX_LEN);
            let room = INBOX_LEN - 1 - len;
            let n = msg.len().min(room);
            inbox[len..len + n].copy_from_slice(&msg.as_bytes()[..n]);
            (*slot).pid
        };
        if pid > 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGUSR1);
        }
    }

    pub fn broadcast(&self, msg: &str) {
        for id in 1..=MAX_CLIENTS as i32 {
            if self.is_used(id) {
                self.send_to(id, msg);
            }
        }
    }

    /// Reads and clears an inbox directly; the in-process fallback used by
    /// tests and by a session flushing its own slot.
    pub fn take_inbox(&self, id: i32) -> String {
        let Some(slot) = self.slot(id) else {
            return String::new();
        };
        // Safety: in-segment pointer.
        unsafe {
            let inbox = &mut (*slot).inbox;
            let len = inbox.iter().position(|&b| b == 0).unwrap_or(INBOX_LEN);
            let out = String::from_utf8_lossy(&inbox[..len]).into_owned();
            inbox.fill(0);
            out
        }
    }

    /// Detaches and marks the segment for removal. Parent-side teardown
    /// only; plain sessions just exit and let the mapping die with them.
    pub fn destroy(self) {
        // Safety: base came from shmat on shm_id.
        unsafe {
            libc::shmdt(self.base as *const libc::c_void);
            libc::shmctl(self.shm_id, libc::IPC_RMID, std::ptr::null_mut());
        }
    }

    pub fn shm_id(&self) -> libc::c_int {
        self.shm_id
    }
}
