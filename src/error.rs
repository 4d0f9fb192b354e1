use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlockcowError>;

#[derive(Error, Debug)]
pub enum BlockcowError {
    /// Block geometry produced a span that is not a whole number of blocks.
    /// Unreachable for valid inputs.
    #[error("Alignment error: {0}")]
    Alignment(String),

    #[error("Backing store error for {path:?} at offset {offset}: {reason}")]
    BackingStore {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Range at offset {offset} of len {length} exceeds object size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    #[error("Object not provisioned: {0}")]
    NotProvisioned(PathBuf),

    #[error("Config error: {0}")]
    Config(String),

    #[error("FUSE error: {0}")]
    Fuse(String),
}

impl From<serde_json::Error> for BlockcowError {
    fn from(err: serde_json::Error) -> Self {
        BlockcowError::Config(err.to_string())
    }
}

impl BlockcowError {
    /// Positive errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            BlockcowError::Alignment(_) => libc::EINVAL,
            BlockcowError::BackingStore { .. } => libc::EIO,
            BlockcowError::Io(e) => io_error_to_libc(e),
            BlockcowError::Cancelled => libc::EINTR,
            BlockcowError::OutOfRange { .. } => libc::EFBIG,
            BlockcowError::NotProvisioned(_) => libc::ENOENT,
            BlockcowError::Config(_) | BlockcowError::Fuse(_) => libc::EIO,
        }
    }
}

/// Map std::io::Error to appropriate libc error code.
/// This provides more specific error codes than generic EIO for better debugging.
pub(crate) fn io_error_to_libc(e: &io::Error) -> i32 {
    // The raw OS error code is the most accurate when present
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::UnexpectedEof => libc::EIO,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}
