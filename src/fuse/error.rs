// Error taxonomy shared by the dispatcher and backends
//
// Every backend failure is relayed to the kernel as a single errno reply.
// Nothing in here is fatal to the session loop.

/// Result type for backend and dispatcher operations
pub type FsResult<T> = Result<T, FsError>;

/// Filesystem error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("No such file or directory")]
    NotFound,

    #[error("Not a directory")]
    NotDirectory,

    #[error("Is a directory")]
    IsDirectory,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Read-only filesystem")]
    ReadOnly,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("Operation not supported")]
    NotSupported,

    /// Allocation inside the adapter failed; the kernel may retry.
    #[error("Interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(String),

    /// Raw errno supplied by a backend that speaks the platform error space directly
    #[error("errno {0}")]
    Errno(i32),
}

impl FsError {
    /// Convert to POSIX errno
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::IsDirectory => libc::EISDIR,
            FsError::PermissionDenied => libc::EACCES,
            FsError::ReadOnly => libc::EROFS,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NameTooLong(_) => libc::ENAMETOOLONG,
            FsError::NotSupported => libc::ENOSYS,
            FsError::Interrupted => libc::EINTR,
            FsError::Io(_) => libc::EIO,
            // Zero or negative codes would read as success to the kernel.
            FsError::Errno(errno) if *errno > 0 => *errno,
            FsError::Errno(_) => libc::EIO,
        }
    }

    /// Build the closest variant for a raw errno
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => FsError::NotFound,
            libc::ENOTDIR => FsError::NotDirectory,
            libc::EISDIR => FsError::IsDirectory,
            libc::EACCES => FsError::PermissionDenied,
            libc::EROFS => FsError::ReadOnly,
            libc::ENOSYS => FsError::NotSupported,
            libc::EINTR => FsError::Interrupted,
            other => FsError::Errno(other),
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => FsError::from_errno(errno),
            None => FsError::Io(err.to_string()),
        }
    }
}
