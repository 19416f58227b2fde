use crate::fs::{FileStat, FileType, stat_at};
use core::cell::OnceCell;
use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;

/// Control code returned by the visit callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Keep walking.
    Continue,
    /// Skip this directory's children. Ignored for non-directories.
    Prune,
    /// Shut the traversal down: outstanding operations are drained, no
    /// further callbacks fire, and the walk returns promptly.
    Stop,
}

/// Which visit of an entry the callback is seeing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VisitKind {
    /// A directory, before any of its children.
    Pre,
    /// A non-directory. Fires exactly once.
    Leaf,
    /// A directory, after its entire subtree. Fires when post-order visits
    /// were requested, and also to deliver an error discovered after the
    /// pre-order visit (an unreadable stream, a symlink cycle).
    Post,
}

/**
One file as seen by the visit callback.

Borrowed: the path bytes live in the engine's per-directory buffer and are
only valid for the duration of the callback. The stat buffer is fetched
lazily on first request, relative to the parent descriptor when one is
still open so arbitrarily deep paths resolve without `PATH_MAX` trouble.
*/
pub struct Entry<'walk> {
    pub(crate) path: &'walk [u8],
    /// Length of the final component.
    pub(crate) name_len: usize,
    pub(crate) depth: u32,
    pub(crate) kind: VisitKind,
    pub(crate) ftype: FileType,
    pub(crate) errno: Option<i32>,
    /// Parent directory descriptor for relative stat calls, when cached.
    pub(crate) parent_fd: Option<i32>,
    pub(crate) name_c: Option<&'walk CStr>,
    /// Whether a stat of this entry should resolve a trailing symlink.
    pub(crate) follow: bool,
    pub(crate) stat: &'walk OnceCell<Result<FileStat, i32>>,
}

impl Entry<'_> {
    /// Full path of the entry.
    #[must_use]
    #[inline]
    pub fn path(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.path))
    }

    /// Full path as raw bytes, without the cost of any conversion.
    #[must_use]
    #[inline]
    pub const fn path_bytes(&self) -> &[u8] {
        self.path
    }

    /// Final path component.
    #[must_use]
    #[inline]
    pub fn file_name(&self) -> &OsStr {
        OsStr::from_bytes(&self.path[self.path.len() - self.name_len..])
    }

    /// Depth below the root. Roots themselves are depth 0.
    #[must_use]
    #[inline]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether this is a pre-order, leaf or post-order visit.
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> VisitKind {
        self.kind
    }

    /**
    File type as hinted by the directory stream.

    [`FileType::Unknown`] means the filesystem did not report one; call
    [`stat`](Self::stat) to resolve it. Directories selected for descent are
    always reported as [`FileType::Directory`], even when discovered through
    a followed symlink.
    */
    #[must_use]
    #[inline]
    pub const fn file_type(&self) -> FileType {
        self.ftype
    }

    /// The error that hit this entry, if any: an unreadable or vanished
    /// directory, descriptor exhaustion that survived the retry, a cycle.
    #[must_use]
    #[inline]
    pub fn error(&self) -> Option<std::io::Error> {
        self.errno.map(std::io::Error::from_raw_os_error)
    }

    /// Raw errno form of [`error`](Self::error).
    #[must_use]
    #[inline]
    pub const fn raw_error(&self) -> Option<i32> {
        self.errno
    }

    /**
    Stat buffer for this entry, fetched on first call and cached.

    Resolves relative to the parent directory's descriptor when it is still
    open, falling back to the full path otherwise. Symlink resolution follows
    the traversal's follow policy.

    # Errors
    The errno of the failed `fstatat`, as an `io::Error`.
    */
    pub fn stat(&self) -> Result<&FileStat, std::io::Error> {
        let result = self.stat.get_or_init(|| match (self.parent_fd, self.name_c) {
            (Some(fd), Some(name)) => stat_at(Some(fd), name, self.follow),
            _ => match CString::new(self.path) {
                Ok(full) => stat_at(None, &full, self.follow),
                Err(_) => Err(libc::EINVAL),
            },
        });
        match result {
            Ok(st) => Ok(st),
            Err(errno) => Err(std::io::Error::from_raw_os_error(*errno)),
        }
    }
}

impl core::fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Entry")
            .field("path", &self.path())
            .field("depth", &self.depth)
            .field("kind", &self.kind)
            .field("file_type", &self.ftype)
            .field("errno", &self.errno)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Entry, VisitKind};
    use crate::fs::FileType;
    use core::cell::OnceCell;

    #[test]
    fn accessors_slice_the_path() {
        let stat = OnceCell::new();
        let entry = Entry {
            path: b"/tmp/walk/file.txt",
            name_len: 8,
            depth: 2,
            kind: VisitKind::Leaf,
            ftype: FileType::RegularFile,
            errno: None,
            parent_fd: None,
            name_c: None,
            follow: false,
            stat: &stat,
        };
        assert_eq!(entry.file_name(), "file.txt");
        assert_eq!(entry.path().to_str(), Some("/tmp/walk/file.txt"));
        assert_eq!(entry.depth(), 2);
        assert!(entry.error().is_none());
    }

    #[test]
    fn lazy_stat_falls_back_to_the_full_path() {
        let tmp = std::env::temp_dir();
        let bytes = tmp.as_os_str().as_encoded_bytes();
        let stat = OnceCell::new();
        let entry = Entry {
            path: bytes,
            name_len: 1,
            depth: 0,
            kind: VisitKind::Pre,
            ftype: FileType::Directory,
            errno: None,
            parent_fd: None,
            name_c: None,
            follow: true,
            stat: &stat,
        };
        let st = entry.stat().expect("temp dir stats");
        assert!(st.file_type().is_dir());
        // Cached: a second call returns the same buffer.
        let again = entry.stat().expect("cached stat");
        assert_eq!(st.ino(), again.ino());
    }
}
