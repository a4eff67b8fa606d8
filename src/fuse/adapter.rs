// FUSE adapter - binds the dispatcher to fuser's kernel transport
//
// This adapter implements the fuser::Filesystem trait and hands every
// supported request to the Dispatcher of the session attached to its channel.
// It handles:
// - Sync fuser callbacks to async dispatcher conversion on a tokio runtime
// - Conversion between adapter records and fuser reply types
// - Replaying packed directory buffers into fuser's directory reply
//
// Operations not overridden here fall through to fuser's defaults, which
// answer ENOSYS for everything this adapter does not serve.
//
// fuser logs reply write failures itself and does not report them back, so
// every reply sent through it counts as delivered.

use super::dirbuf::DirBuffer;
use super::interface::{AttrOut, ConnInfo, Entry, FileAttr, FileInfo, StatVfs};
use super::reply::{Delivery, Reply, ReplyNone, RequestContext};
use super::session::Session;
use fuser::{
    FileType as FuseFileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEntry, ReplyOpen, ReplyStatfs, Request,
};
use libc::c_int;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tokio::runtime::Runtime;

/// Slot connecting the kernel transport to the adapter session
///
/// Requests that arrive while nothing is attached are answered ENOTCONN.
#[derive(Clone, Default)]
pub struct Channel {
    slot: Arc<RwLock<Option<Arc<Session>>>>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `session`, returning `false` if another one is already attached
    pub fn attach(&self, session: Arc<Session>) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(session);
        true
    }

    pub fn detach(&self) -> Option<Arc<Session>> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_attached(&self) -> bool {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// fuser filesystem that forwards to the attached session
pub struct FuseAdapter {
    channel: Channel,

    /// Runtime driving the async dispatcher from fuser's blocking loop
    runtime: Arc<Runtime>,
}

impl FuseAdapter {
    pub fn new(channel: Channel, runtime: Arc<Runtime>) -> Self {
        Self { channel, runtime }
    }

    /// Convert our FileAttr to fuser FileAttr
    pub fn to_fuse_attr(attr: &FileAttr) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: SystemTime::from(attr.atime),
            mtime: SystemTime::from(attr.mtime),
            ctime: SystemTime::from(attr.ctime),
            crtime: SystemTime::UNIX_EPOCH,
            kind: file_type(attr.mode),
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
            flags: 0,
        }
    }
}

/// Map the file-type bits of a mode onto fuser's FileType
pub fn file_type(mode: u32) -> FuseFileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FuseFileType::Directory,
        m if m == libc::S_IFLNK as u32 => FuseFileType::Symlink,
        m if m == libc::S_IFCHR as u32 => FuseFileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FuseFileType::BlockDevice,
        m if m == libc::S_IFIFO as u32 => FuseFileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FuseFileType::Socket,
        _ => FuseFileType::RegularFile,
    }
}

/// FOPEN_* flags for an open reply
pub fn open_flags(fi: &FileInfo) -> u32 {
    let mut flags = 0;
    if fi.direct_io {
        flags |= fuser::consts::FOPEN_DIRECT_IO;
    }
    if fi.keep_cache {
        flags |= fuser::consts::FOPEN_KEEP_CACHE;
    }
    if fi.nonseekable {
        flags |= fuser::consts::FOPEN_NONSEEKABLE;
    }
    flags
}

// fuser swallows reply write errors, so an abandoned lookup or open is never
// seen as aborted here and no compensation runs through this binding.
impl Reply<Entry> for ReplyEntry {
    fn send(self, entry: Entry) -> Delivery {
        self.entry(&entry.ttl, &FuseAdapter::to_fuse_attr(&entry.attr), entry.generation);
        Delivery::Delivered
    }

    fn fail(self, errno: i32) -> Delivery {
        self.error(errno);
        Delivery::Delivered
    }
}

impl Reply<AttrOut> for ReplyAttr {
    fn send(self, out: AttrOut) -> Delivery {
        self.attr(&out.ttl, &FuseAdapter::to_fuse_attr(&out.attr));
        Delivery::Delivered
    }

    fn fail(self, errno: i32) -> Delivery {
        self.error(errno);
        Delivery::Delivered
    }
}

impl Reply<FileInfo> for ReplyOpen {
    fn send(self, fi: FileInfo) -> Delivery {
        self.opened(fi.fh, open_flags(&fi));
        Delivery::Delivered
    }

    fn fail(self, errno: i32) -> Delivery {
        self.error(errno);
        Delivery::Delivered
    }
}

impl Reply<Vec<u8>> for ReplyData {
    fn send(self, data: Vec<u8>) -> Delivery {
        self.data(&data);
        Delivery::Delivered
    }

    fn fail(self, errno: i32) -> Delivery {
        self.error(errno);
        Delivery::Delivered
    }
}

impl Reply<DirBuffer> for ReplyDirectory {
    fn send(mut self, buf: DirBuffer) -> Delivery {
        for dirent in buf.entries() {
            // fuser sizes its own buffer from the kernel request; stop where it does.
            let name = OsStr::from_bytes(dirent.name);
            if self.add(dirent.ino, dirent.offset, file_type(dirent.mode), name) {
                break;
            }
        }
        self.ok();
        Delivery::Delivered
    }

    fn fail(self, errno: i32) -> Delivery {
        self.error(errno);
        Delivery::Delivered
    }
}

impl Reply<StatVfs> for ReplyStatfs {
    fn send(self, s: StatVfs) -> Delivery {
        self.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namemax, s.frsize);
        Delivery::Delivered
    }

    fn fail(self, errno: i32) -> Delivery {
        self.error(errno);
        Delivery::Delivered
    }
}

/// Forget carries no reply on the fuser side
struct NoReply;

impl ReplyNone for NoReply {
    fn none(self) {}
}

impl Filesystem for FuseAdapter {
    fn init(&mut self, req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        let session = self.channel.session().ok_or(libc::ENOTCONN)?;
        let ctx = RequestContext::from(req);

        let mut conn = ConnInfo::default();
        self.runtime.block_on(session.dispatcher().init(&ctx, &mut conn)).map_err(|e| {
            tracing::error!("Backend init failed: {}", e);
            e.to_errno()
        })?;

        if let Some(value) = conn.max_readahead {
            if let Err(nearest) = config.set_max_readahead(value) {
                tracing::warn!("Kernel limited max_readahead to {} (requested {})", nearest, value);
                let _ = config.set_max_readahead(nearest);
            }
        }

        if let Some(value) = conn.max_write {
            if let Err(nearest) = config.set_max_write(value) {
                tracing::warn!("Kernel limited max_write to {} (requested {})", nearest, value);
                let _ = config.set_max_write(nearest);
            }
        }

        tracing::info!("FUSE session initialized at {}", session.mountpoint().display());
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(session) = self.channel.session() {
            self.runtime.block_on(session.destroy());
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(session) = self.channel.session() else {
            reply.error(libc::ENOTCONN);
            return;
        };
        let ctx = RequestContext::from(req);
        self.runtime.block_on(session.dispatcher().lookup(&ctx, parent, name, reply));
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        let Some(session) = self.channel.session() else {
            tracing::warn!(ino, nlookup, "forget with no session attached");
            return;
        };
        let ctx = RequestContext::from(req);
        self.runtime.block_on(session.dispatcher().forget(&ctx, ino, nlookup, NoReply));
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let Some(session) = self.channel.session() else {
            reply.error(libc::ENOTCONN);
            return;
        };
        let ctx = RequestContext::from(req);
        let fi = fh.map(FileInfo::with_fh);
        self.runtime.block_on(session.dispatcher().getattr(&ctx, ino, fi.as_ref(), reply));
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(session) = self.channel.session() else {
            reply.error(libc::ENOTCONN);
            return;
        };
        let ctx = RequestContext::from(req);
        self.runtime.block_on(session.dispatcher().open(&ctx, ino, flags, reply));
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(session) = self.channel.session() else {
            reply.error(libc::ENOTCONN);
            return;
        };
        let ctx = RequestContext::from(req);
        let fi = FileInfo { fh, flags, ..Default::default() };
        self.runtime.block_on(session.dispatcher().read(&ctx, ino, size, offset, &fi, reply));
    }

    /// fuser does not pass the kernel's buffer size through, so the packer
    /// works against the minimum directory buffer.
    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        let Some(session) = self.channel.session() else {
            reply.error(libc::ENOTCONN);
            return;
        };
        let ctx = RequestContext::from(req);
        let fi = FileInfo::with_fh(fh);
        self.runtime.block_on(session.dispatcher().readdir(&ctx, ino, 0, offset, &fi, reply));
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let Some(session) = self.channel.session() else {
            reply.error(libc::ENOTCONN);
            return;
        };
        let ctx = RequestContext::from(req);
        self.runtime.block_on(session.dispatcher().statfs(&ctx, ino, reply));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuse::dispatch::DispatchOptions;
    use crate::fuse::interface::RawFileSystem;
    use chrono::{TimeZone, Utc};
    use std::time::{Duration, UNIX_EPOCH};

    struct Empty;

    #[async_trait::async_trait]
    impl RawFileSystem for Empty {}

    fn session() -> Arc<Session> {
        Arc::new(Session::new("/mnt/test", Arc::new(Empty), DispatchOptions::default()))
    }

    #[test]
    fn test_channel_attach_and_detach() {
        let channel = Channel::new();
        assert!(!channel.is_attached());
        assert!(channel.session().is_none());

        assert!(channel.attach(session()));
        assert!(channel.is_attached());
        assert!(!channel.attach(session()));

        assert!(channel.detach().is_some());
        assert!(!channel.is_attached());
        assert!(channel.detach().is_none());
    }

    #[test]
    fn test_channel_clones_share_slot() {
        let channel = Channel::new();
        let other = channel.clone();
        channel.attach(session());
        assert!(other.is_attached());
    }

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(file_type(libc::S_IFDIR as u32 | 0o755), FuseFileType::Directory);
        assert_eq!(file_type(libc::S_IFREG as u32 | 0o644), FuseFileType::RegularFile);
        assert_eq!(file_type(libc::S_IFLNK as u32), FuseFileType::Symlink);
        assert_eq!(file_type(libc::S_IFIFO as u32), FuseFileType::NamedPipe);
        assert_eq!(file_type(libc::S_IFSOCK as u32), FuseFileType::Socket);
        assert_eq!(file_type(0), FuseFileType::RegularFile);
    }

    #[test]
    fn test_to_fuse_attr() {
        let mtime = Utc.timestamp_opt(1_700_000_000, 500).unwrap();
        let attr = FileAttr {
            ino: 42,
            size: 1024,
            blocks: 2,
            mtime,
            mode: libc::S_IFREG as u32 | 0o640,
            nlink: 1,
            uid: 1000,
            gid: 100,
            blksize: 4096,
            ..Default::default()
        };

        let fuse_attr = FuseAdapter::to_fuse_attr(&attr);
        assert_eq!(fuse_attr.ino, 42);
        assert_eq!(fuse_attr.size, 1024);
        assert_eq!(fuse_attr.kind, FuseFileType::RegularFile);
        assert_eq!(fuse_attr.perm, 0o640);
        assert_eq!(fuse_attr.uid, 1000);
        assert_eq!(fuse_attr.gid, 100);
        assert_eq!(fuse_attr.atime, UNIX_EPOCH);
        assert_eq!(fuse_attr.mtime, UNIX_EPOCH + Duration::new(1_700_000_000, 500));
    }

    #[test]
    fn test_open_flags() {
        assert_eq!(open_flags(&FileInfo::default()), 0);

        let fi = FileInfo { direct_io: true, keep_cache: true, ..Default::default() };
        assert_eq!(open_flags(&fi), fuser::consts::FOPEN_DIRECT_IO | fuser::consts::FOPEN_KEEP_CACHE);
    }
}
