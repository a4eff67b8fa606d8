// Backend capability interface
//
// Defines the contract a filesystem backend satisfies so the dispatcher can
// serve it to the kernel. Backends are addressed by inode number, not path.
// Every operation defaults to "not supported", so a backend only implements
// what it serves.

use super::error::{FsError, FsResult};
use chrono::{DateTime, Utc};
use std::ffi::{OsStr, OsString};
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;

/// Inode number of the filesystem root
pub const ROOT_INO: u64 = 1;

/// Stat-shaped attribute record
///
/// `mode` carries the file-type bits (`S_IFDIR`, `S_IFREG`, ...) as well as
/// the permission bits, the same as `st_mode`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl FileAttr {
    /// Zeroed record owned by the running process
    pub fn for_process() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        (self.mode & libc::S_IFMT as u32) == libc::S_IFDIR as u32
    }
}

/// Reply payload for a successful lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub ino: u64,
    pub generation: u64,
    pub attr: FileAttr,
    /// How long the kernel may cache both the name and the attributes
    pub ttl: Duration,
}

/// Attributes plus their cache validity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrOut {
    pub attr: FileAttr,
    pub ttl: Duration,
}

/// Per-open state shared between the kernel and the backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Open flags as passed to open(2)
    pub flags: i32,
    /// Backend-private handle, echoed back on read and readdir
    pub fh: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
    pub nonseekable: bool,
}

impl FileInfo {
    pub fn with_flags(flags: i32) -> Self {
        Self { flags, ..Default::default() }
    }

    pub fn with_fh(fh: u64) -> Self {
        Self { fh, ..Default::default() }
    }

    /// True when the open requests any kind of write access
    pub fn wants_write(&self) -> bool {
        let access = self.flags & libc::O_ACCMODE;
        access == libc::O_WRONLY || access == libc::O_RDWR || self.flags & libc::O_TRUNC != 0
    }
}

/// statvfs-shaped filesystem statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatVfs {
    pub bsize: u32,
    pub frsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub namemax: u32,
}

/// Connection parameters negotiated at init
///
/// The backend may lower or raise the limits; the transport binding forwards
/// any change to the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnInfo {
    pub max_readahead: Option<u32>,
    pub max_write: Option<u32>,
}

/// One directory entry as produced by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub mode: u32,
    /// Cursor the kernel sends back to resume after this entry
    pub offset: i64,
}

impl DirEntry {
    pub fn new(name: impl Into<OsString>, ino: u64, mode: u32, offset: i64) -> Self {
        Self { name: name.into(), ino, mode, offset }
    }
}

/// Lazy, finite stream of directory entries starting at the requested offset
pub type DirStream = Pin<Box<dyn Stream<Item = DirEntry> + Send>>;

/// Filesystem backend served by the dispatcher
///
/// Methods take `&self` because the dispatcher may call them from several
/// in-flight requests at once.
#[async_trait::async_trait]
pub trait RawFileSystem: Send + Sync {
    /// Called once when the kernel connection is established
    async fn init(&self, _conn: &mut ConnInfo) -> FsResult<()> {
        Ok(())
    }

    /// Called once at session teardown
    async fn destroy(&self) {}

    async fn lookup(&self, _parent: u64, _name: &OsStr) -> FsResult<Entry> {
        Err(FsError::NotSupported)
    }

    /// The kernel dropped `nlookup` references to `ino`
    async fn forget(&self, _ino: u64, _nlookup: u64) {}

    /// The adapter's reference count for `ino` reached zero; resources tied to
    /// it may be reclaimed.
    async fn released(&self, _ino: u64) {}

    /// Fill `out`, which arrives zeroed apart from `ino`, owner and default ttl
    async fn getattr(&self, _ino: u64, _fi: Option<&FileInfo>, _out: &mut AttrOut) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    async fn open(&self, _ino: u64, _fi: &mut FileInfo) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    /// The open reply never reached the kernel; any handle stored in `fi` is
    /// now orphaned.
    async fn open_aborted(&self, _ino: u64, _fi: &FileInfo) {}

    /// Fill `buf` with data starting at `offset` and return the number of
    /// bytes written. Fewer than `buf.len()` bytes signals end of data.
    async fn read(
        &self,
        _ino: u64,
        _offset: i64,
        _fi: &FileInfo,
        _buf: &mut [u8],
    ) -> FsResult<usize> {
        Err(FsError::NotSupported)
    }

    async fn read_dir(&self, _ino: u64, _offset: i64, _fi: &FileInfo) -> FsResult<DirStream> {
        Err(FsError::NotSupported)
    }

    /// Fill `stats`, which arrives zeroed
    async fn statfs(&self, _ino: u64, _stats: &mut StatVfs) -> FsResult<()> {
        Err(FsError::NotSupported)
    }
}
