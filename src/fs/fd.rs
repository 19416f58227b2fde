use crate::fs::FileType;
use core::ffi::CStr;
use core::mem::MaybeUninit;

/// Flags used for every directory open issued by the traversal.
///
/// `O_DIRECTORY` turns races with file replacement into `ENOTDIR`, and
/// `O_NONBLOCK` stops opens of pipes and devices from hanging when a stale
/// type hint sneaks one past the directory checks.
pub(crate) const OPEN_DIR_FLAGS: i32 =
    libc::O_RDONLY | libc::O_CLOEXEC | libc::O_DIRECTORY | libc::O_NONBLOCK;

/**
An owned file descriptor.

Closes on drop, so any error path that drops a `FileDes` (a completion that
the consumer never collects, an evicted cache slot, a worker shutting down)
returns the descriptor to the kernel. Cheap to move across threads.
*/
#[derive(Debug)]
#[repr(transparent)]
pub struct FileDes(pub(crate) i32);

impl FileDes {
    /// Wraps a raw descriptor, taking ownership of it.
    ///
    /// # Safety
    /// `fd` must be open and not owned elsewhere.
    #[must_use]
    #[inline]
    pub(crate) const unsafe fn from_raw(fd: i32) -> Self {
        Self(fd)
    }

    /// Returns the raw descriptor without giving up ownership.
    #[must_use]
    #[inline]
    pub const fn raw(&self) -> i32 {
        self.0
    }

    /// Consumes `self` and returns the raw descriptor, which the caller now owns.
    #[must_use]
    #[inline]
    pub fn into_raw(self) -> i32 {
        let fd = self.0;
        core::mem::forget(self);
        fd
    }

    /// Checks whether the descriptor is still open.
    /// Useful in assertions; `F_GETFD` fails with `EBADF` on a closed descriptor.
    #[must_use]
    #[inline]
    pub fn is_open(&self) -> bool {
        // SAFETY: fcntl with F_GETFD only inspects the descriptor table
        unsafe { libc::fcntl(self.0, libc::F_GETFD) != -1 }
    }
}

impl Drop for FileDes {
    #[inline]
    fn drop(&mut self) {
        if self.0 >= 0 {
            // SAFETY: we own the descriptor and this is the only close site
            unsafe { libc::close(self.0) };
        }
    }
}

/**
A stat buffer with accessors for the fields the traversal cares about.

Wraps `libc::stat` so callers never spell out the per-platform field types
(`st_dev` alone differs across the BSDs, Linux and macOS).
*/
#[derive(Clone, Copy)]
pub struct FileStat(pub(crate) libc::stat);

#[allow(clippy::cast_sign_loss)] // dev_t/ino_t are signed on some platforms, identity matters, not sign
impl FileStat {
    /// Device number of the containing filesystem.
    #[must_use]
    #[inline]
    pub const fn dev(&self) -> u64 {
        self.0.st_dev as u64
    }

    /// Inode number.
    #[must_use]
    #[inline]
    pub const fn ino(&self) -> u64 {
        self.0.st_ino as u64
    }

    /// Raw mode bits.
    #[must_use]
    #[inline]
    pub const fn mode(&self) -> libc::mode_t {
        self.0.st_mode
    }

    /// Size in bytes.
    #[must_use]
    #[inline]
    pub const fn size(&self) -> i64 {
        self.0.st_size as i64
    }

    /// Number of hard links.
    #[must_use]
    #[inline]
    pub const fn nlink(&self) -> u64 {
        self.0.st_nlink as u64
    }

    /// File type decoded from the mode bits.
    #[must_use]
    #[inline]
    pub const fn file_type(&self) -> FileType {
        FileType::from_mode(self.0.st_mode)
    }

    /// Borrows the underlying `libc::stat` for fields not wrapped here.
    #[must_use]
    #[inline]
    pub const fn as_raw(&self) -> &libc::stat {
        &self.0
    }
}

impl core::fmt::Debug for FileStat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileStat")
            .field("dev", &self.dev())
            .field("ino", &self.ino())
            .field("mode", &self.mode())
            .field("size", &self.size())
            .finish()
    }
}

/// Fetches the calling thread's errno, defaulting to `EIO` if the OS
/// reports success after a failed call (it should not).
#[must_use]
#[inline]
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/**
Opens a directory relative to `parent` (or the working directory when
`parent` is `None`) and returns the owned descriptor or the raw errno.

`follow` controls whether a symlink in the final component is traversed;
`O_DIRECTORY` still guarantees the result is a directory either way.
*/
#[inline]
pub(crate) fn open_dir_at(parent: Option<i32>, name: &CStr, follow: bool) -> Result<FileDes, i32> {
    let dirfd = parent.unwrap_or(libc::AT_FDCWD);
    let mut flags = OPEN_DIR_FLAGS;
    if !follow {
        flags |= libc::O_NOFOLLOW;
    }
    // SAFETY: name is NUL-terminated and dirfd is either AT_FDCWD or a live descriptor
    let fd = unsafe { libc::openat(dirfd, name.as_ptr(), flags) };
    if fd < 0 {
        Err(errno())
    } else {
        // SAFETY: the kernel just handed us this descriptor
        Ok(unsafe { FileDes::from_raw(fd) })
    }
}

/// `fstatat` relative to `parent` (or the working directory). `follow`
/// selects whether a trailing symlink is resolved.
#[inline]
pub(crate) fn stat_at(parent: Option<i32>, name: &CStr, follow: bool) -> Result<FileStat, i32> {
    let dirfd = parent.unwrap_or(libc::AT_FDCWD);
    let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    let mut buf = MaybeUninit::<libc::stat>::uninit();
    // SAFETY: name is NUL-terminated and buf is a valid stat-sized output buffer
    let rc = unsafe { libc::fstatat(dirfd, name.as_ptr(), buf.as_mut_ptr(), flags) };
    if rc == 0 {
        // SAFETY: fstatat succeeded, so the buffer is fully initialised
        Ok(FileStat(unsafe { buf.assume_init() }))
    } else {
        Err(errno())
    }
}

/// `fstat` on an already-open descriptor.
#[inline]
pub(crate) fn stat_fd(fd: i32) -> Result<FileStat, i32> {
    let mut buf = MaybeUninit::<libc::stat>::uninit();
    // SAFETY: buf is a valid stat-sized output buffer
    let rc = unsafe { libc::fstat(fd, buf.as_mut_ptr()) };
    if rc == 0 {
        // SAFETY: fstat succeeded, so the buffer is fully initialised
        Ok(FileStat(unsafe { buf.assume_init() }))
    } else {
        Err(errno())
    }
}

#[cfg(test)]
mod tests {
    use super::{FileDes, open_dir_at, stat_at, stat_fd};
    use crate::fs::FileType;
    use std::ffi::CString;

    #[test]
    fn open_and_close_directory() {
        let name = CString::new(std::env::temp_dir().into_os_string().into_encoded_bytes())
            .expect("temp dir has no NUL");
        let fd = open_dir_at(None, &name, true).expect("temp dir opens");
        assert!(fd.is_open());
        let raw = fd.raw();
        drop(fd);
        // SAFETY: probing a closed descriptor with F_GETFD is harmless
        assert_eq!(unsafe { libc::fcntl(raw, libc::F_GETFD) }, -1);
    }

    #[test]
    fn stat_reports_directory() {
        let name = CString::new(std::env::temp_dir().into_os_string().into_encoded_bytes())
            .expect("temp dir has no NUL");
        let st = stat_at(None, &name, true).expect("temp dir stats");
        assert_eq!(st.file_type(), FileType::Directory);

        let fd = open_dir_at(None, &name, true).expect("temp dir opens");
        let st2 = stat_fd(fd.raw()).expect("fstat works");
        assert_eq!((st.dev(), st.ino()), (st2.dev(), st2.ino()));
    }

    #[test]
    fn missing_path_yields_enoent() {
        let name = CString::new("/definitely/not/a/real/path").unwrap();
        assert_eq!(open_dir_at(None, &name, true).unwrap_err(), libc::ENOENT);
        assert_eq!(stat_at(None, &name, false).unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn into_raw_releases_ownership() {
        let name = CString::new(std::env::temp_dir().into_os_string().into_encoded_bytes())
            .expect("temp dir has no NUL");
        let fd = open_dir_at(None, &name, true).expect("temp dir opens");
        let raw = fd.into_raw();
        // SAFETY: we own raw again after into_raw
        let reclaimed = unsafe { FileDes::from_raw(raw) };
        assert!(reclaimed.is_open());
    }
}
