mod buffer;
mod fd;
mod file_type;
mod reader;

pub use buffer::AlignedBuffer;
pub use fd::{FileDes, FileStat};
pub use file_type::FileType;

pub(crate) use fd::{OPEN_DIR_FLAGS, errno, open_dir_at, stat_at, stat_fd};
pub(crate) use reader::{DirReader, Dirent};
