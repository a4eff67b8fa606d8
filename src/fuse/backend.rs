// MemoryBackend - read-only in-memory tree served through the adapter

use super::error::{FsError, FsResult};
use super::interface::*;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

const BLOCK_SIZE: u32 = 4096;
const NAME_MAX: usize = 255;

enum NodeKind {
    Dir(BTreeMap<OsString, u64>),
    File(Vec<u8>),
}

struct Node {
    parent: u64,
    perm: u32,
    mtime: DateTime<Utc>,
    kind: NodeKind,
}

impl Node {
    fn mode(&self) -> u32 {
        let kind = match self.kind {
            NodeKind::Dir(_) => libc::S_IFDIR,
            NodeKind::File(_) => libc::S_IFREG,
        };
        kind as u32 | (self.perm & 0o7777)
    }

    fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::Dir(children) => children.len() as u64,
            NodeKind::File(data) => data.len() as u64,
        }
    }

    fn nlink(&self) -> u32 {
        match self.kind {
            NodeKind::Dir(_) => 2,
            NodeKind::File(_) => 1,
        }
    }

    /// Copy the backend-owned fields into `attr`
    fn fill(&self, attr: &mut FileAttr) {
        let size = self.size();
        attr.size = size;
        attr.blocks = size.div_ceil(512);
        attr.mode = self.mode();
        attr.nlink = self.nlink();
        attr.atime = self.mtime;
        attr.mtime = self.mtime;
        attr.ctime = self.mtime;
        attr.blksize = BLOCK_SIZE;
    }
}

struct Tree {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
}

impl Tree {
    fn new(root_perm: u32) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                parent: ROOT_INO,
                perm: root_perm,
                mtime: Utc::now(),
                kind: NodeKind::Dir(BTreeMap::new()),
            },
        );
        Self { nodes, next_ino: ROOT_INO + 1 }
    }

    fn get(&self, ino: u64) -> FsResult<&Node> {
        self.nodes.get(&ino).ok_or(FsError::NotFound)
    }

    fn children(&self, ino: u64) -> FsResult<&BTreeMap<OsString, u64>> {
        match &self.get(ino)?.kind {
            NodeKind::Dir(children) => Ok(children),
            NodeKind::File(_) => Err(FsError::NotDirectory),
        }
    }

    fn insert(&mut self, parent: u64, name: &OsStr, perm: u32, kind: NodeKind) -> FsResult<u64> {
        validate_name(name)?;

        let ino = self.next_ino;
        let children = match self.nodes.get_mut(&parent).map(|node| &mut node.kind) {
            Some(NodeKind::Dir(children)) => children,
            Some(NodeKind::File(_)) => return Err(FsError::NotDirectory),
            None => return Err(FsError::NotFound),
        };
        if children.contains_key(name) {
            return Err(FsError::Errno(libc::EEXIST));
        }
        children.insert(name.to_os_string(), ino);

        self.nodes.insert(ino, Node { parent, perm, mtime: Utc::now(), kind });
        self.next_ino += 1;
        Ok(ino)
    }
}

fn validate_name(name: &OsStr) -> FsResult<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes == b"." || bytes == b".." || bytes.contains(&b'/') {
        return Err(FsError::InvalidArgument(format!("invalid entry name {:?}", name)));
    }
    if bytes.len() > NAME_MAX {
        return Err(FsError::NameTooLong(bytes.len()));
    }
    Ok(())
}

/// Read-only filesystem held entirely in memory
pub struct MemoryBackend {
    tree: RwLock<Tree>,
    ttl: Duration,
    next_fh: AtomicU64,
    released: Mutex<Vec<u64>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Empty tree with only the root directory
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(Tree::new(0o755)),
            ttl: Duration::from_secs(1),
            next_fh: AtomicU64::new(1),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Set the entry TTL handed out on lookup
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Snapshot a host directory
    ///
    /// Directories and regular files are copied; symlinks and special files
    /// are skipped.
    pub fn from_dir(path: &Path) -> anyhow::Result<Self> {
        let backend = Self::new();
        let meta = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat source {}", path.display()))?;
        if !meta.is_dir() {
            anyhow::bail!("Source is not a directory: {}", path.display());
        }

        backend.copy_dir(ROOT_INO, path)?;
        tracing::info!("Loaded {} inodes from {}", backend.inode_count(), path.display());
        Ok(backend)
    }

    fn copy_dir(&self, parent: u64, dir: &Path) -> anyhow::Result<()> {
        let mut entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let meta = entry.metadata()?;
            let perm = meta.permissions().mode() & 0o7777;
            let name = entry.file_name();

            if meta.is_dir() {
                let ino = self.add_dir(parent, &name, perm)?;
                self.copy_dir(ino, &path)?;
            } else if meta.is_file() {
                let data = std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let ino = self.add_file(parent, &name, perm, data)?;
                if let Ok(modified) = meta.modified() {
                    self.set_mtime(ino, DateTime::<Utc>::from(modified));
                }
            } else {
                tracing::debug!("Skipping {}: not a regular file or directory", path.display());
            }
        }
        Ok(())
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_dir(&self, parent: u64, name: impl AsRef<OsStr>, perm: u32) -> FsResult<u64> {
        self.write_tree().insert(parent, name.as_ref(), perm, NodeKind::Dir(BTreeMap::new()))
    }

    pub fn add_file(
        &self,
        parent: u64,
        name: impl AsRef<OsStr>,
        perm: u32,
        data: impl Into<Vec<u8>>,
    ) -> FsResult<u64> {
        self.write_tree().insert(parent, name.as_ref(), perm, NodeKind::File(data.into()))
    }

    fn set_mtime(&self, ino: u64, mtime: DateTime<Utc>) {
        if let Some(node) = self.write_tree().nodes.get_mut(&ino) {
            node.mtime = mtime;
        }
    }

    pub fn inode_count(&self) -> usize {
        self.read_tree().nodes.len()
    }

    /// Inodes whose last kernel reference was returned, in order
    pub fn released_inodes(&self) -> Vec<u64> {
        self.released.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl RawFileSystem for MemoryBackend {
    async fn init(&self, _conn: &mut ConnInfo) -> FsResult<()> {
        tracing::info!("Memory backend serving {} inodes", self.inode_count());
        Ok(())
    }

    async fn destroy(&self) {
        tracing::info!("Memory backend destroyed");
    }

    async fn lookup(&self, parent: u64, name: &OsStr) -> FsResult<Entry> {
        let tree = self.read_tree();
        let children = tree.children(parent)?;

        let ino = match name.as_bytes() {
            b"." => parent,
            b".." => tree.get(parent)?.parent,
            _ => *children.get(name).ok_or(FsError::NotFound)?,
        };

        let mut attr = FileAttr { ino, ..FileAttr::for_process() };
        tree.get(ino)?.fill(&mut attr);
        Ok(Entry { ino, generation: 0, attr, ttl: self.ttl })
    }

    async fn forget(&self, ino: u64, nlookup: u64) {
        tracing::trace!(ino, nlookup, "forget");
    }

    async fn released(&self, ino: u64) {
        self.released.lock().unwrap_or_else(PoisonError::into_inner).push(ino);
    }

    async fn getattr(&self, ino: u64, _fi: Option<&FileInfo>, out: &mut AttrOut) -> FsResult<()> {
        self.read_tree().get(ino)?.fill(&mut out.attr);
        Ok(())
    }

    async fn open(&self, ino: u64, fi: &mut FileInfo) -> FsResult<()> {
        match self.read_tree().get(ino)?.kind {
            NodeKind::Dir(_) => return Err(FsError::IsDirectory),
            NodeKind::File(_) => {}
        }
        if fi.wants_write() {
            return Err(FsError::ReadOnly);
        }

        fi.fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        fi.keep_cache = true;
        Ok(())
    }

    async fn open_aborted(&self, ino: u64, fi: &FileInfo) {
        tracing::debug!(ino, fh = fi.fh, "dropping handle of aborted open");
    }

    async fn read(&self, ino: u64, offset: i64, _fi: &FileInfo, buf: &mut [u8]) -> FsResult<usize> {
        let offset = usize::try_from(offset)
            .map_err(|_| FsError::InvalidArgument(format!("negative offset {}", offset)))?;

        let tree = self.read_tree();
        let data = match &tree.get(ino)?.kind {
            NodeKind::File(data) => data,
            NodeKind::Dir(_) => return Err(FsError::IsDirectory),
        };

        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    async fn read_dir(&self, ino: u64, offset: i64, _fi: &FileInfo) -> FsResult<DirStream> {
        let skip = usize::try_from(offset)
            .map_err(|_| FsError::InvalidArgument(format!("negative offset {}", offset)))?;

        let tree = self.read_tree();
        let children = tree.children(ino)?;
        let dir_mode = libc::S_IFDIR as u32;

        let mut listing = vec![
            (OsString::from("."), ino, dir_mode),
            (OsString::from(".."), tree.get(ino)?.parent, dir_mode),
        ];
        for (name, child) in children {
            listing.push((name.clone(), *child, tree.get(*child)?.mode()));
        }

        let entries: Vec<DirEntry> = listing
            .into_iter()
            .enumerate()
            .skip(skip)
            .map(|(i, (name, ino, mode))| DirEntry::new(name, ino, mode, i as i64 + 1))
            .collect();

        Ok(Box::pin(tokio_stream::iter(entries)))
    }

    async fn statfs(&self, _ino: u64, stats: &mut StatVfs) -> FsResult<()> {
        let tree = self.read_tree();
        let bytes: u64 = tree
            .nodes
            .values()
            .map(|node| match &node.kind {
                NodeKind::File(data) => data.len() as u64,
                NodeKind::Dir(_) => 0,
            })
            .sum();

        stats.bsize = BLOCK_SIZE;
        stats.frsize = BLOCK_SIZE;
        stats.blocks = bytes.div_ceil(BLOCK_SIZE as u64);
        stats.files = tree.nodes.len() as u64;
        stats.namemax = NAME_MAX as u32;
        Ok(())
    }
}
