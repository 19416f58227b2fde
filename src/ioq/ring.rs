/*!
Kernel submission-ring backend for the I/O queue.

Operations are staged as SQEs and flushed in batches: either when the
submission queue fills, or lazily when the consumer polls/waits and the
completion side is empty. Name strings and `statx` output buffers must stay
alive until the kernel reports back, so each in-flight operation parks its
resources in a slab keyed by `user_data`.
*/

use super::{Completion, Output, Request};
use crate::error::ConfigError;
use crate::fs::{FileDes, FileStat, OPEN_DIR_FLAGS};
use core::mem::MaybeUninit;
use io_uring::{IoUring, opcode, squeue, types};
use std::ffi::CString;
use tracing::{debug, warn};

struct Holder {
    seq: u64,
    token: u64,
    close: bool,
    /// Keeps the pathname alive for `OpenAt`/`Statx` until the CQE arrives.
    #[allow(dead_code)]
    name: Option<CString>,
    /// Output buffer for `Statx`; written by the kernel.
    statx: Option<Box<MaybeUninit<libc::statx>>>,
}

pub(super) struct Ring {
    ring: IoUring,
    slots: Vec<Option<Holder>>,
    free: Vec<usize>,
    staged: u32,
}

impl Ring {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        #[allow(clippy::cast_possible_truncation)] // capacities are small
        let entries = (capacity.next_power_of_two().max(8)) as u32;
        let ring = IoUring::new(entries).map_err(ConfigError::Queue)?;
        debug!(entries, "I/O ring started");
        Ok(Self {
            ring,
            slots: Vec::new(),
            free: Vec::new(),
            staged: 0,
        })
    }

    fn alloc_slot(&mut self, holder: Holder) -> usize {
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(holder);
            index
        } else {
            self.slots.push(Some(holder));
            self.slots.len() - 1
        }
    }

    pub fn push(&mut self, request: Request) {
        let Request { seq, token, op } = request;

        let (holder, sqe) = match op {
            super::Op::Open {
                parent,
                name,
                follow,
            } => {
                let mut flags = OPEN_DIR_FLAGS;
                if !follow {
                    flags |= libc::O_NOFOLLOW;
                }
                let dirfd = parent.unwrap_or(libc::AT_FDCWD);
                let ptr = name.as_ptr();
                let holder = Holder {
                    seq,
                    token,
                    close: false,
                    name: Some(name),
                    statx: None,
                };
                let sqe = opcode::OpenAt::new(types::Fd(dirfd), ptr).flags(flags).build();
                (holder, sqe)
            }
            super::Op::Stat {
                parent,
                name,
                follow,
            } => {
                let dirfd = parent.unwrap_or(libc::AT_FDCWD);
                let at_flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
                let mut buf: Box<MaybeUninit<libc::statx>> = Box::new(MaybeUninit::uninit());
                let buf_ptr = buf.as_mut_ptr();
                let ptr = name.as_ptr();
                let holder = Holder {
                    seq,
                    token,
                    close: false,
                    name: Some(name),
                    statx: Some(buf),
                };
                let sqe = opcode::Statx::new(types::Fd(dirfd), ptr, buf_ptr.cast())
                    .flags(at_flags)
                    .mask(libc::STATX_BASIC_STATS)
                    .build();
                (holder, sqe)
            }
            super::Op::Close { fd } => {
                let holder = Holder {
                    seq,
                    token,
                    close: true,
                    name: None,
                    statx: None,
                };
                (holder, opcode::Close::new(types::Fd(fd)).build())
            }
        };

        let index = self.alloc_slot(holder);
        #[allow(clippy::cast_possible_truncation)] // slab indices are small
        let sqe: squeue::Entry = sqe.user_data(index as u64);

        loop {
            // SAFETY: the name and statx buffers referenced by the SQE live in
            // the slab until the matching CQE is reaped
            match unsafe { self.ring.submission().push(&sqe) } {
                Ok(()) => {
                    self.staged += 1;
                    return;
                }
                // Submission queue full: that is the batch boundary.
                Err(_) => self.flush(),
            }
        }
    }

    fn flush(&mut self) {
        if self.staged == 0 {
            return;
        }
        loop {
            match self.ring.submit() {
                Ok(_) => break,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
                Err(err) => {
                    warn!("ring submission failed: {err}");
                    break;
                }
            }
        }
        self.staged = 0;
    }

    /// Translates one CQE. Close completions are swallowed (they have no
    /// consumer-visible result), everything else is handed back.
    fn reap_one(&mut self) -> Option<Option<Completion>> {
        let cqe = self.ring.completion().next()?;

        #[allow(clippy::cast_possible_truncation)] // user_data is a slab index we assigned
        let index = cqe.user_data() as usize;
        let Some(holder) = self.slots.get_mut(index).and_then(Option::take) else {
            debug_assert!(false, "completion for a vacant slot");
            return Some(None);
        };
        self.free.push(index);

        let res = cqe.result();
        if holder.close {
            return Some(None);
        }

        let result = if res < 0 {
            Err(-res)
        } else if let Some(buf) = holder.statx {
            // SAFETY: a non-negative statx result means the kernel filled the buffer
            let stx = unsafe { buf.assume_init() };
            Ok(Output::Stat(statx_to_stat(&stx)))
        } else {
            // SAFETY: the kernel handed us this descriptor
            Ok(Output::Fd(unsafe { FileDes::from_raw(res) }))
        };

        Some(Some(Completion {
            seq: holder.seq,
            token: holder.token,
            result,
        }))
    }

    pub fn poll(&mut self) -> Option<Completion> {
        loop {
            match self.reap_one() {
                Some(Some(completion)) => return Some(completion),
                Some(None) => {} // a close retired, keep reaping
                None => {
                    if self.staged == 0 {
                        return None;
                    }
                    // Completion side is empty: flush the staged batch and
                    // take whatever finished inline.
                    self.flush();
                    if self.ring.completion().is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    pub fn wait(&mut self) -> Option<Completion> {
        loop {
            if let Some(completion) = self.poll() {
                return Some(completion);
            }
            match self.ring.submit_and_wait(1) {
                Ok(_) => self.staged = 0,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
                Err(err) => {
                    warn!("ring wait failed: {err}");
                    return None;
                }
            }
        }
    }

    pub fn cancel(&mut self) {
        self.flush();
    }

    /// Waits out every in-flight operation so staged closes are guaranteed to
    /// have executed; dropped open results close their descriptors.
    fn drain_all(&mut self) {
        self.flush();
        while self.slots.iter().any(Option::is_some) {
            match self.reap_one() {
                Some(_) => {}
                None => match self.ring.submit_and_wait(1) {
                    Ok(_) => {}
                    Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
                    Err(err) => {
                        warn!("ring drain failed: {err}");
                        return;
                    }
                },
            }
        }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        self.drain_all();
    }
}

/// Maps a `statx` result onto the `stat` layout the rest of the crate uses.
fn statx_to_stat(stx: &libc::statx) -> FileStat {
    // SAFETY: all-zero is a valid stat value; fields are overwritten below
    let mut st: libc::stat = unsafe { core::mem::zeroed() };
    st.st_dev = libc::makedev(stx.stx_dev_major, stx.stx_dev_minor);
    st.st_ino = stx.stx_ino;
    st.st_mode = libc::mode_t::from(stx.stx_mode);
    st.st_nlink = stx.stx_nlink as _;
    st.st_uid = stx.stx_uid;
    st.st_gid = stx.stx_gid;
    st.st_size = stx.stx_size as _;
    st.st_blocks = stx.stx_blocks as _;
    st.st_blksize = stx.stx_blksize as _;
    st.st_atime = stx.stx_atime.tv_sec as _;
    st.st_atime_nsec = stx.stx_atime.tv_nsec as _;
    st.st_mtime = stx.stx_mtime.tv_sec as _;
    st.st_mtime_nsec = stx.stx_mtime.tv_nsec as _;
    st.st_ctime = stx.stx_ctime.tv_sec as _;
    st.st_ctime_nsec = stx.stx_ctime.tv_nsec as _;
    FileStat(st)
}
