// Request dispatcher
//
// Turns each kernel request into one backend call and exactly one reply.
// Handlers never return early without replying, and a reply object is
// consumed by the single send on each path.

use super::dirbuf::{DirBuffer, MIN_DIR_BUFFER};
use super::error::FsError;
use super::interface::{AttrOut, ConnInfo, Entry, FileAttr, FileInfo, RawFileSystem, StatVfs};
use super::refs::{InodeRefs, RefChange};
use super::reply::{Delivery, Reply, ReplyNone, RequestContext};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Default cache validity for attributes returned by getattr
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Tunables for request handling
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// TTL offered to the backend as the getattr default
    pub attr_ttl: Duration,
    /// Lower bound on the readdir buffer
    pub min_dir_buffer: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { attr_ttl: DEFAULT_ATTR_TTL, min_dir_buffer: MIN_DIR_BUFFER }
    }
}

/// Routes requests to a backend and emits the replies
pub struct Dispatcher {
    backend: Arc<dyn RawFileSystem>,
    refs: InodeRefs,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn RawFileSystem>, options: DispatchOptions) -> Self {
        Self { backend, refs: InodeRefs::new(), options }
    }

    pub fn refs(&self) -> &InodeRefs {
        &self.refs
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Relay a backend failure as an errno reply
    fn fail<T, R: Reply<T>>(ctx: &RequestContext, op: &str, reply: R, err: FsError) -> Delivery {
        let errno = err.to_errno();
        tracing::debug!(unique = ctx.unique, op, errno, error = %err, "request failed");
        reply.fail(errno)
    }

    /// Return references to the backend and report a release at zero
    async fn return_refs(&self, ino: u64, nlookup: u64, change: RefChange) {
        self.backend.forget(ino, nlookup).await;
        if change == RefChange::Released {
            tracing::debug!(ino, "inode released");
            self.backend.released(ino).await;
        }
    }

    pub async fn init(&self, ctx: &RequestContext, conn: &mut ConnInfo) -> Result<(), FsError> {
        tracing::debug!(unique = ctx.unique, "init");
        self.backend.init(conn).await
    }

    pub async fn destroy(&self) {
        let outstanding = self.refs.len();
        if outstanding > 0 {
            tracing::debug!(outstanding, "destroying with inodes still referenced by the kernel");
        }
        self.backend.destroy().await;
    }

    pub async fn lookup<R: Reply<Entry>>(
        &self,
        ctx: &RequestContext,
        parent: u64,
        name: &OsStr,
        reply: R,
    ) {
        tracing::debug!(unique = ctx.unique, parent, name = ?name, "lookup");

        let mut entry = match self.backend.lookup(parent, name).await {
            Ok(entry) => entry,
            Err(e) => {
                Self::fail(ctx, "lookup", reply, e);
                return;
            }
        };
        entry.attr.ino = entry.ino;

        let vended = self.refs.vend(entry.ino);
        match reply.send(entry) {
            Delivery::Delivered => {
                vended.confirm();
            }
            Delivery::Aborted => {
                let ino = vended.ino();
                tracing::warn!(unique = ctx.unique, ino, "lookup reply aborted, returning reference");
                let change = vended.compensate();
                self.return_refs(ino, 1, change).await;
            }
        }
    }

    pub async fn forget<R: ReplyNone>(
        &self,
        ctx: &RequestContext,
        ino: u64,
        nlookup: u64,
        reply: R,
    ) {
        tracing::debug!(unique = ctx.unique, ino, nlookup, "forget");
        let change = self.refs.decrement(ino, nlookup);
        self.return_refs(ino, nlookup, change).await;
        reply.none();
    }

    pub async fn getattr<R: Reply<AttrOut>>(
        &self,
        ctx: &RequestContext,
        ino: u64,
        fi: Option<&FileInfo>,
        reply: R,
    ) {
        tracing::debug!(unique = ctx.unique, ino, "getattr");

        let mut out =
            AttrOut { attr: FileAttr { ino, ..FileAttr::for_process() }, ttl: self.options.attr_ttl };
        match self.backend.getattr(ino, fi, &mut out).await {
            Ok(()) => {
                reply.send(out);
            }
            Err(e) => {
                Self::fail(ctx, "getattr", reply, e);
            }
        }
    }

    pub async fn open<R: Reply<FileInfo>>(
        &self,
        ctx: &RequestContext,
        ino: u64,
        flags: i32,
        reply: R,
    ) {
        tracing::debug!(unique = ctx.unique, ino, flags, "open");

        let mut fi = FileInfo::with_flags(flags);
        if let Err(e) = self.backend.open(ino, &mut fi).await {
            Self::fail(ctx, "open", reply, e);
            return;
        }

        if reply.send(fi.clone()).is_aborted() {
            tracing::warn!(unique = ctx.unique, ino, fh = fi.fh, "open reply aborted");
            self.backend.open_aborted(ino, &fi).await;
        }
    }

    pub async fn read<R: Reply<Vec<u8>>>(
        &self,
        ctx: &RequestContext,
        ino: u64,
        size: u32,
        offset: i64,
        fi: &FileInfo,
        reply: R,
    ) {
        tracing::debug!(unique = ctx.unique, ino, size, offset, "read");

        let size = size as usize;
        let mut buf = Vec::new();
        if let Err(e) = buf.try_reserve_exact(size) {
            tracing::warn!(unique = ctx.unique, size, error = %e, "read buffer allocation failed");
            Self::fail(ctx, "read", reply, FsError::Interrupted);
            return;
        }
        buf.resize(size, 0);

        match self.backend.read(ino, offset, fi, &mut buf).await {
            Ok(n) => {
                if n > size {
                    tracing::warn!(unique = ctx.unique, ino, n, size, "backend overstated read length");
                }
                buf.truncate(n.min(size));
                reply.send(buf);
            }
            Err(e) => {
                Self::fail(ctx, "read", reply, e);
            }
        }
    }

    pub async fn readdir<R: Reply<DirBuffer>>(
        &self,
        ctx: &RequestContext,
        ino: u64,
        size: u32,
        offset: i64,
        fi: &FileInfo,
        reply: R,
    ) {
        tracing::debug!(unique = ctx.unique, ino, size, offset, "readdir");

        let capacity = (size as usize).max(self.options.min_dir_buffer);
        let mut buf = match DirBuffer::try_with_capacity(capacity) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(unique = ctx.unique, capacity, error = %e, "readdir buffer allocation failed");
                Self::fail(ctx, "readdir", reply, FsError::Interrupted);
                return;
            }
        };

        let mut entries = match self.backend.read_dir(ino, offset, fi).await {
            Ok(entries) => entries,
            Err(e) => {
                Self::fail(ctx, "readdir", reply, e);
                return;
            }
        };

        let mut packed = 0usize;
        while let Some(entry) = entries.next().await {
            if !buf.pack(entry.name.as_bytes(), entry.ino, entry.mode, entry.offset) {
                break;
            }
            packed += 1;
        }
        drop(entries);

        tracing::debug!(unique = ctx.unique, ino, packed, bytes = buf.offset(), "readdir packed");
        reply.send(buf);
    }

    pub async fn statfs<R: Reply<StatVfs>>(&self, ctx: &RequestContext, ino: u64, reply: R) {
        tracing::debug!(unique = ctx.unique, ino, "statfs");

        let mut stats = StatVfs::default();
        match self.backend.statfs(ino, &mut stats).await {
            Ok(()) => {
                reply.send(stats);
            }
            Err(e) => {
                Self::fail(ctx, "statfs", reply, e);
            }
        }
    }
}
