use libc::{
    DT_BLK, DT_CHR, DT_DIR, DT_FIFO, DT_LNK, DT_REG, DT_SOCK, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO,
    S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, mode_t,
};

/// The type of a file as reported by `d_type` or a `stat` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileType {
    BlockDevice,
    CharDevice,
    Directory,
    Fifo,
    Symlink,
    RegularFile,
    Socket,
    /// The filesystem did not report a type (`DT_UNKNOWN`); resolve with a stat call.
    Unknown,
}

impl FileType {
    /// Converts a `dirent` `d_type` value. `DT_UNKNOWN` (and anything the
    /// filesystem invents) maps to [`Unknown`](Self::Unknown), which callers
    /// resolve with a follow-up `fstatat`.
    #[must_use]
    #[inline]
    pub const fn from_dtype(d_type: u8) -> Self {
        match d_type {
            DT_DIR => Self::Directory,
            DT_REG => Self::RegularFile,
            DT_BLK => Self::BlockDevice,
            DT_CHR => Self::CharDevice,
            DT_FIFO => Self::Fifo,
            DT_LNK => Self::Symlink,
            DT_SOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }

    /// Converts the `st_mode` field of a stat buffer.
    #[must_use]
    #[inline]
    pub const fn from_mode(mode: mode_t) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegularFile,
            S_IFDIR => Self::Directory,
            S_IFBLK => Self::BlockDevice,
            S_IFCHR => Self::CharDevice,
            S_IFIFO => Self::Fifo,
            S_IFLNK => Self::Symlink,
            S_IFSOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }

    /// Returns `true` for [`Directory`](Self::Directory).
    #[must_use]
    #[inline]
    pub const fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }
}

impl core::fmt::Display for FileType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BlockDevice => write!(f, "block device"),
            Self::CharDevice => write!(f, "character device"),
            Self::Directory => write!(f, "directory"),
            Self::Fifo => write!(f, "fifo"),
            Self::Symlink => write!(f, "symlink"),
            Self::RegularFile => write!(f, "regular file"),
            Self::Socket => write!(f, "socket"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FileType;

    #[test]
    fn dtype_round_trip() {
        assert_eq!(FileType::from_dtype(libc::DT_DIR), FileType::Directory);
        assert_eq!(FileType::from_dtype(libc::DT_REG), FileType::RegularFile);
        assert_eq!(FileType::from_dtype(libc::DT_LNK), FileType::Symlink);
        assert_eq!(FileType::from_dtype(libc::DT_UNKNOWN), FileType::Unknown);
        assert_eq!(FileType::from_dtype(0xfe), FileType::Unknown);
    }

    #[test]
    fn mode_round_trip() {
        assert_eq!(FileType::from_mode(libc::S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(FileType::from_mode(libc::S_IFREG | 0o644), FileType::RegularFile);
        assert!(FileType::from_mode(libc::S_IFDIR).is_dir());
        assert!(!FileType::from_mode(libc::S_IFLNK).is_dir());
    }
}
