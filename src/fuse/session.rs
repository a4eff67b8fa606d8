// Adapter session
//
// One per process: the mount point plus the dispatcher bound to it. The
// kernel's DESTROY and the lifecycle teardown can both ask for destruction,
// the backend sees it once.

use super::dispatch::{DispatchOptions, Dispatcher};
use super::interface::RawFileSystem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Session {
    mountpoint: PathBuf,
    dispatcher: Dispatcher,
    destroyed: AtomicBool,
}

impl Session {
    pub fn new(
        mountpoint: impl Into<PathBuf>,
        backend: Arc<dyn RawFileSystem>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            dispatcher: Dispatcher::new(backend, options),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Tear down the backend
    ///
    /// Returns `false` when the session had already been destroyed.
    pub async fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }

        tracing::info!("Destroying session for {}", self.mountpoint.display());
        self.dispatcher.destroy().await;
        true
    }
}
