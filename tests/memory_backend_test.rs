// Dispatcher over a snapshot of a host directory
//
// Exercises the memory backend through the same request path the kernel
// uses, without mounting.

use fusebridge::fuse::{
    AttrOut, Delivery, DirBuffer, DispatchOptions, Dispatcher, Entry, FileInfo, MemoryBackend,
    ROOT_INO, Reply, RequestContext,
};
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Reply slot that keeps the payload or errno
struct Capture<T>(Arc<Mutex<Option<Result<T, i32>>>>);

impl<T> Reply<T> for Capture<T> {
    fn send(self, payload: T) -> Delivery {
        *self.0.lock().unwrap() = Some(Ok(payload));
        Delivery::Delivered
    }

    fn fail(self, errno: i32) -> Delivery {
        *self.0.lock().unwrap() = Some(Err(errno));
        Delivery::Delivered
    }
}

fn capture<T>() -> (Capture<T>, Arc<Mutex<Option<Result<T, i32>>>>) {
    let slot = Arc::new(Mutex::new(None));
    (Capture(Arc::clone(&slot)), slot)
}

fn result<T>(slot: Arc<Mutex<Option<Result<T, i32>>>>) -> Result<T, i32> {
    slot.lock().unwrap().take().expect("no reply sent")
}

fn ctx() -> RequestContext {
    RequestContext { unique: 1, ..Default::default() }
}

fn snapshot() -> (TempDir, Dispatcher, Arc<MemoryBackend>) {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("docs")).unwrap();
    std::fs::write(temp.path().join("docs/readme.md"), b"# fusebridge\n").unwrap();
    for i in 0..40 {
        std::fs::write(temp.path().join(format!("file_{:02}.txt", i)), format!("{}", i)).unwrap();
    }
    std::os::unix::fs::symlink("docs", temp.path().join("link")).unwrap();

    let backend = Arc::new(MemoryBackend::from_dir(temp.path()).unwrap());
    let dispatcher = Dispatcher::new(
        backend.clone(),
        DispatchOptions { min_dir_buffer: 0, ..Default::default() },
    );
    (temp, dispatcher, backend)
}

async fn lookup(dispatcher: &Dispatcher, parent: u64, name: &str) -> Result<Entry, i32> {
    let (reply, slot) = capture();
    dispatcher.lookup(&ctx(), parent, OsStr::new(name), reply).await;
    result(slot)
}

async fn list(dispatcher: &Dispatcher, ino: u64, size: u32) -> Vec<String> {
    let mut names = Vec::new();
    let mut offset = 0i64;
    loop {
        let (reply, slot) = capture::<DirBuffer>();
        dispatcher.readdir(&ctx(), ino, size, offset, &FileInfo::default(), reply).await;
        let buf = result(slot).unwrap();
        if buf.is_empty() {
            return names;
        }
        for dirent in buf.entries() {
            names.push(String::from_utf8_lossy(dirent.name).into_owned());
            offset = dirent.offset;
        }
    }
}

#[tokio::test]
async fn test_snapshot_skips_symlinks() {
    let (_temp, dispatcher, _) = snapshot();
    assert_eq!(lookup(&dispatcher, ROOT_INO, "link").await.unwrap_err(), libc::ENOENT);
}

#[tokio::test]
async fn test_paged_listing_returns_every_entry_once() {
    let (_temp, dispatcher, _) = snapshot();

    let names = list(&dispatcher, ROOT_INO, 128).await;

    assert_eq!(names.len(), 43);
    assert_eq!(&names[..3], &[".", "..", "docs"]);
    let mut sorted = names.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), names.len());

    assert_eq!(list(&dispatcher, ROOT_INO, 4096).await, names);
}

#[tokio::test]
async fn test_nested_lookup_and_read() {
    let (_temp, dispatcher, _) = snapshot();

    let docs = lookup(&dispatcher, ROOT_INO, "docs").await.unwrap();
    assert!(docs.attr.is_dir());
    let readme = lookup(&dispatcher, docs.ino, "readme.md").await.unwrap();
    assert_eq!(readme.attr.size, 13);

    let (reply, slot) = capture::<FileInfo>();
    dispatcher.open(&ctx(), readme.ino, libc::O_RDONLY, reply).await;
    let fi = result(slot).unwrap();

    let (reply, slot) = capture::<Vec<u8>>();
    dispatcher.read(&ctx(), readme.ino, 4096, 2, &fi, reply).await;
    assert_eq!(result(slot).unwrap(), b"fusebridge\n".to_vec());

    let (reply, slot) = capture::<FileInfo>();
    dispatcher.open(&ctx(), readme.ino, libc::O_RDWR, reply).await;
    assert_eq!(result(slot).unwrap_err(), libc::EROFS);

    assert_eq!(dispatcher.refs().count(docs.ino), 1);
    assert_eq!(dispatcher.refs().count(readme.ino), 1);
}

#[tokio::test]
async fn test_getattr_root() {
    let (_temp, dispatcher, _) = snapshot();

    let (reply, slot) = capture::<AttrOut>();
    dispatcher.getattr(&ctx(), ROOT_INO, None, reply).await;
    let out = result(slot).unwrap();

    assert!(out.attr.is_dir());
    assert_eq!(out.attr.ino, ROOT_INO);
    assert_eq!(out.attr.uid, nix::unistd::getuid().as_raw());
}

#[tokio::test]
async fn test_last_forget_releases_inode() {
    let (_temp, dispatcher, backend) = snapshot();

    let file = lookup(&dispatcher, ROOT_INO, "file_07.txt").await.unwrap();
    lookup(&dispatcher, ROOT_INO, "file_07.txt").await.unwrap();
    assert_eq!(dispatcher.refs().count(file.ino), 2);

    dispatcher.forget(&ctx(), file.ino, 1, NoReply).await;
    assert!(backend.released_inodes().is_empty());

    dispatcher.forget(&ctx(), file.ino, 1, NoReply).await;
    assert_eq!(backend.released_inodes(), vec![file.ino]);
}

struct NoReply;

impl fusebridge::fuse::ReplyNone for NoReply {
    fn none(self) {}
}
