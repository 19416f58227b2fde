use crate::fs::FileType;
use std::ffi::CString;

/// One name yielded by a directory stream, before any path assembly.
#[derive(Debug)]
pub(crate) struct Dirent {
    pub name: CString,
    #[allow(dead_code)] // populated on every platform, only read by tests today
    pub ino: u64,
    /// Type hint from `d_type`; `Unknown` forces a stat later.
    pub ftype: FileType,
}

/// Size of the kernel buffer handed to `getdents64`. Syscall tracing of
/// coreutils shows the same 32KiB figure, which one-shots most directories.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const DENTS_BUFFER_SIZE: usize = 8 * 4096;

/**
Streaming reader over an open directory descriptor.

On Linux and Android this drives the raw `getdents64` syscall over an
aligned buffer, batching many entries per syscall and skipping libc's
`DIR` machinery entirely. The descriptor is borrowed, not owned: its
lifecycle belongs to the descriptor cache, and the caller keeps the slot
pinned while a reader exists.

"." and ".." are filtered out here so the traversal never sees them.
*/
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) struct DirReader {
    fd: i32,
    buf: Box<crate::fs::AlignedBuffer<DENTS_BUFFER_SIZE>>,
    offset: usize,
    remaining: usize,
    end_of_stream: bool,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl DirReader {
    /// Wraps a freshly opened directory descriptor. The stream position must
    /// be at the start (descriptors handed back by the I/O queue always are).
    #[inline]
    pub fn new(fd: i32) -> Result<Self, i32> {
        Ok(Self {
            fd,
            buf: Box::new(crate::fs::AlignedBuffer::new()),
            offset: 0,
            remaining: 0,
            end_of_stream: false,
        })
    }

    /// Refills the buffer. Returns `Ok(true)` when new bytes are available,
    /// `Ok(false)` at end of stream, and the raw errno on failure.
    fn fill(&mut self) -> Result<bool, i32> {
        if self.end_of_stream {
            return Ok(false);
        }

        // SAFETY: the buffer is valid for writes of its full capacity and the
        // descriptor is kept open by the pinned cache slot
        let read = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                self.fd,
                self.buf.as_mut_ptr(),
                self.buf.capacity(),
            )
        };
        if read < 0 {
            return Err(crate::fs::errno());
        }

        #[allow(clippy::cast_sign_loss)] // read >= 0 checked above
        {
            self.remaining = read as usize;
        }
        self.offset = 0;

        // A longest-possible record is the fixed dirent header plus a
        // 1023-byte name and its NUL (ZFS; everything else caps at 255).
        // If the kernel left at least that much slack it had nothing more
        // to give, so the next call would return 0. Skipping it halves the
        // syscall count on small directories.
        const HEADER: usize = core::mem::offset_of!(libc::dirent64, d_name);
        const MAX_RECORD: usize = (HEADER + 1024).next_multiple_of(8);
        if read == 0 || self.buf.capacity() - self.remaining >= MAX_RECORD {
            self.end_of_stream = true;
        }

        Ok(read > 0)
    }

    /// Returns the next entry, `Ok(None)` at end of stream, or the errno of
    /// a failed `getdents64` call.
    pub fn next_entry(&mut self) -> Result<Option<Dirent>, i32> {
        loop {
            if self.offset < self.remaining {
                // SAFETY: offset is within the initialised prefix and the
                // kernel aligns every record start to 8 bytes
                let dirent = unsafe { self.buf.as_ptr().add(self.offset) }.cast::<libc::dirent64>();
                debug_assert!(dirent as usize % 8 == 0, "misaligned dirent record");

                // SAFETY: dirent points at a complete record written by the kernel
                let reclen = unsafe { (*dirent).d_reclen } as usize;
                debug_assert!(reclen > 0, "kernel produced a zero-length record");
                self.offset += reclen;

                // d_name may extend past the nominal struct size, so it must be
                // reached through a field projection rather than a reference.
                // SAFETY: the name is NUL-terminated within the record
                let name = unsafe {
                    core::ffi::CStr::from_ptr((&raw const (*dirent).d_name).cast::<libc::c_char>())
                };
                let bytes = name.to_bytes();
                if bytes == b"." || bytes == b".." {
                    continue;
                }

                // SAFETY: as above, dirent points at a complete record
                let (ino, d_type) = unsafe { ((*dirent).d_ino, (*dirent).d_type) };
                return Ok(Some(Dirent {
                    name: name.to_owned(),
                    ino,
                    ftype: FileType::from_dtype(d_type),
                }));
            }

            if !self.fill()? {
                return Ok(None);
            }
        }
    }
}

/**
Portable fallback over libc's `DIR` machinery.

The borrowed descriptor is duplicated before `fdopendir` so closing the
stream does not steal the cache's descriptor out from under it.
*/
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) struct DirReader {
    dir: core::ptr::NonNull<libc::DIR>,
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl DirReader {
    #[inline]
    pub fn new(fd: i32) -> Result<Self, i32> {
        // SAFETY: duplicating a live descriptor; F_DUPFD_CLOEXEC has no other effects
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(crate::fs::errno());
        }
        // SAFETY: dup is a live directory descriptor that fdopendir takes over
        let dir = unsafe { libc::fdopendir(dup) };
        core::ptr::NonNull::new(dir).ok_or_else(|| {
            let err = crate::fs::errno();
            // SAFETY: fdopendir failed, so the duplicate is still ours to close
            unsafe { libc::close(dup) };
            err
        })
    }

    pub fn next_entry(&mut self) -> Result<Option<Dirent>, i32> {
        loop {
            // readdir only signals errors through errno, so clear it first.
            clear_errno();
            // SAFETY: self.dir is a live DIR stream
            let entry = unsafe { libc::readdir(self.dir.as_ptr()) };
            if entry.is_null() {
                let err = crate::fs::errno();
                return if err == 0 { Ok(None) } else { Err(err) };
            }

            // SAFETY: readdir returned a valid entry pointer
            let name = unsafe {
                core::ffi::CStr::from_ptr((&raw const (*entry).d_name).cast::<libc::c_char>())
            };
            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }

            #[cfg(any(target_os = "solaris", target_os = "illumos"))]
            let ftype = FileType::Unknown; // no d_type in the SysV dirent
            #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
            // SAFETY: as above, entry is valid
            let ftype = FileType::from_dtype(unsafe { (*entry).d_type });

            #[cfg(any(
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd",
                target_os = "dragonfly"
            ))]
            // SAFETY: as above, entry is valid
            let ino = unsafe { (*entry).d_fileno } as u64;
            #[cfg(not(any(
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd",
                target_os = "dragonfly"
            )))]
            // SAFETY: as above, entry is valid
            let ino = unsafe { (*entry).d_ino } as u64;

            return Ok(Some(Dirent {
                name: name.to_owned(),
                ino,
                ftype,
            }));
        }
    }
}

/// Resets the thread-local errno; the location accessor is libc-specific.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[inline]
fn clear_errno() {
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    // SAFETY: writing the calling thread's errno slot
    unsafe {
        *libc::__error() = 0;
    }
    #[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
    // SAFETY: writing the calling thread's errno slot
    unsafe {
        *libc::__errno() = 0;
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Drop for DirReader {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: closes the duplicated descriptor along with the stream
        unsafe { libc::closedir(self.dir.as_ptr()) };
    }
}
