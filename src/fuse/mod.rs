// FUSE request/reply adapter
//
// Sits between the kernel's FUSE channel and a RawFileSystem backend:
// decodes requests, calls the backend, packs replies and keeps the
// kernel's inode references balanced.

pub mod adapter;
pub mod backend;
pub mod dirbuf;
pub mod dispatch;
pub mod error;
pub mod interface;
pub mod mount;
pub mod refs;
pub mod reply;
pub mod session;

pub use adapter::{Channel, FuseAdapter};
pub use backend::MemoryBackend;
pub use dirbuf::DirBuffer;
pub use dispatch::{DispatchOptions, Dispatcher};
pub use error::{FsError, FsResult};
pub use interface::{
    AttrOut, ConnInfo, DirEntry, DirStream, Entry, FileAttr, FileInfo, ROOT_INO, RawFileSystem,
    StatVfs,
};
pub use mount::{FuseTransport, MountOptions, RunOutcome, TeardownStep, Transport};
pub use refs::InodeRefs;
pub use reply::{Delivery, Reply, ReplyNone, RequestContext};
pub use session::Session;
