use core::fmt;

/**
Errors surfaced while validating a [`TraversalBuilder`](crate::TraversalBuilder)
or standing up the I/O queue.

These are the only fatal errors the crate produces: they are returned before
any visit callback has fired. Everything recoverable (unreadable directories,
vanished entries, descriptor exhaustion after the retry) is embedded in the
affected [`Entry`](crate::Entry) instead and the walk carries on.
*/
#[derive(Debug)]
pub enum ConfigError {
    /// No root paths were supplied to the builder.
    NoRoots,
    /// A root path contained an interior NUL byte and cannot be passed to the OS.
    NulRoot(std::ffi::NulError),
    /// `min_depth` was configured above `max_depth`.
    DepthRange { min: u32, max: u32 },
    /// The worker pool (or the kernel ring) could not be created.
    Queue(std::io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoots => write!(f, "no root paths were provided"),
            Self::NulRoot(err) => write!(f, "root path contains a NUL byte: {err}"),
            Self::DepthRange { min, max } => {
                write!(f, "minimum depth {min} exceeds maximum depth {max}")
            }
            Self::Queue(err) => write!(f, "failed to start the I/O queue: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NulRoot(err) => Some(err),
            Self::Queue(err) => Some(err),
            Self::NoRoots | Self::DepthRange { .. } => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        Self::Queue(err)
    }
}

impl From<std::ffi::NulError> for ConfigError {
    #[inline]
    fn from(err: std::ffi::NulError) -> Self {
        Self::NulRoot(err)
    }
}
