// FUSE mount lifecycle
//
// mount -> attach session -> install signal handlers -> request loop, then
// a fixed teardown: remove signal handlers -> detach -> destroy session ->
// unmount. Teardown covers every stage that was reached and keeps going past
// failing steps.

use super::adapter::{Channel, FuseAdapter};
use super::dispatch::DispatchOptions;
use super::interface::RawFileSystem;
use super::session::Session;
use anyhow::{Context, Result};
use fuser::MountOption;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;

/// Mount options for FUSE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Allow other users to access the filesystem
    pub allow_other: bool,

    /// Allow root to access the filesystem
    pub allow_root: bool,

    /// Mount as read-only
    pub read_only: bool,

    /// Let the kernel enforce permission bits
    pub default_permissions: bool,

    /// Filesystem name shown in mount table
    pub fsname: Option<String>,

    pub subtype: Option<String>,

    /// Auto-unmount on process exit
    pub auto_unmount: bool,

    /// Options passed through to the kernel unchanged
    pub extra: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            allow_root: false,
            read_only: true,
            default_permissions: false,
            fsname: Some("fusebridge".to_string()),
            subtype: None,
            auto_unmount: false,
            extra: Vec::new(),
        }
    }
}

/// Mount option parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MountOptionError {
    #[error("Empty mount option")]
    Empty,

    #[error("Mount option '{0}' requires a value")]
    MissingValue(String),

    #[error("Mount options '{0}' and '{1}' are mutually exclusive")]
    Conflict(&'static str, &'static str),
}

impl MountOptions {
    /// Apply a comma separated `-o` list on top of the current options
    pub fn apply(&mut self, list: &str) -> Result<(), MountOptionError> {
        for option in list.split(',').map(str::trim) {
            match option.split_once('=') {
                Some(("fsname", value)) => self.fsname = Some(non_empty("fsname", value)?),
                Some(("subtype", value)) => self.subtype = Some(non_empty("subtype", value)?),
                Some(_) => self.extra.push(option.to_string()),
                None => match option {
                    "" => return Err(MountOptionError::Empty),
                    "ro" => self.read_only = true,
                    "rw" => self.read_only = false,
                    "allow_other" => self.allow_other = true,
                    "allow_root" => self.allow_root = true,
                    "auto_unmount" => self.auto_unmount = true,
                    "default_permissions" => self.default_permissions = true,
                    "fsname" | "subtype" => {
                        return Err(MountOptionError::MissingValue(option.to_string()));
                    }
                    other => self.extra.push(other.to_string()),
                },
            }
        }
        Ok(())
    }

    /// Parse a comma separated `-o` list over the defaults
    pub fn parse(list: &str) -> Result<Self, MountOptionError> {
        let mut options = Self::default();
        options.apply(list)?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), MountOptionError> {
        if self.allow_other && self.allow_root {
            return Err(MountOptionError::Conflict("allow_other", "allow_root"));
        }
        Ok(())
    }

    /// Convert to fuser mount options
    pub fn to_fuser_options(&self) -> Vec<MountOption> {
        let mut options = Vec::new();

        if self.allow_other {
            options.push(MountOption::AllowOther);
        }

        if self.allow_root {
            options.push(MountOption::AllowRoot);
        }

        if self.read_only {
            options.push(MountOption::RO);
        } else {
            options.push(MountOption::RW);
        }

        if self.default_permissions {
            options.push(MountOption::DefaultPermissions);
        }

        if let Some(ref fsname) = self.fsname {
            options.push(MountOption::FSName(fsname.clone()));
        }

        if let Some(ref subtype) = self.subtype {
            options.push(MountOption::Subtype(subtype.clone()));
        }

        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }

        options.extend(self.extra.iter().cloned().map(MountOption::CUSTOM));
        options
    }
}

fn non_empty(key: &str, value: &str) -> Result<String, MountOptionError> {
    if value.is_empty() {
        return Err(MountOptionError::MissingValue(key.to_string()));
    }
    Ok(value.to_string())
}

/// Kernel-side operations the lifecycle drives, in the order it drives them
pub trait Transport {
    fn mount(&mut self, mountpoint: &Path, options: &[MountOption]) -> Result<()>;

    /// Bind the session so incoming requests reach its dispatcher
    fn attach(&mut self, session: Arc<Session>) -> Result<()>;

    fn install_signal_handlers(&mut self) -> Result<()>;

    /// Serve requests until the filesystem is unmounted
    fn run(&mut self) -> Result<()>;

    fn remove_signal_handlers(&mut self) -> Result<()>;

    fn detach(&mut self) -> Result<()>;

    fn destroy_session(&mut self, session: &Session) -> Result<()>;

    fn unmount(&mut self) -> Result<()>;
}

/// Teardown steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    RemoveSignalHandlers,
    Detach,
    DestroySession,
    Unmount,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownStep::RemoveSignalHandlers => write!(f, "remove signal handlers"),
            TeardownStep::Detach => write!(f, "detach session"),
            TeardownStep::DestroySession => write!(f, "destroy session"),
            TeardownStep::Unmount => write!(f, "unmount"),
        }
    }
}

/// A teardown step that failed; later steps still ran
#[derive(Debug, thiserror::Error)]
#[error("{step} failed: {cause:#}")]
pub struct TeardownError {
    pub step: TeardownStep,
    pub cause: anyhow::Error,
}

/// How a mounted run ended
#[derive(Debug)]
pub struct RunOutcome {
    /// Setup or request loop result
    pub served: Result<()>,
    pub teardown: Vec<TeardownError>,
}

impl RunOutcome {
    pub fn is_clean(&self) -> bool {
        self.served.is_ok() && self.teardown.is_empty()
    }

    /// Process exit code: 0 for a clean shutdown, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() { 0 } else { 1 }
    }
}

#[derive(Debug, Default)]
struct Stages {
    attached: bool,
    signals: bool,
}

/// Mount `backend` at `mountpoint` and serve it until unmounted
pub fn run<T: Transport>(
    transport: &mut T,
    backend: Arc<dyn RawFileSystem>,
    mountpoint: &Path,
    options: &MountOptions,
    dispatch: DispatchOptions,
) -> RunOutcome {
    if let Err(e) = options.validate() {
        tracing::error!("Invalid mount options: {}", e);
        return RunOutcome { served: Err(e.into()), teardown: Vec::new() };
    }

    let fuse_options = options.to_fuser_options();
    tracing::info!("Mounting filesystem at {}", mountpoint.display());
    if let Err(e) = transport.mount(mountpoint, &fuse_options) {
        tracing::error!("Mount failed: {:#}", e);
        return RunOutcome { served: Err(e), teardown: Vec::new() };
    }

    let session = Arc::new(Session::new(mountpoint, backend, dispatch));
    let mut stages = Stages::default();

    let served = serve(transport, &session, &mut stages);
    match &served {
        Ok(()) => tracing::info!("Session loop finished"),
        Err(e) => tracing::error!("Session loop failed: {:#}", e),
    }

    let teardown = teardown(transport, &session, &stages);
    RunOutcome { served, teardown }
}

fn serve<T: Transport>(transport: &mut T, session: &Arc<Session>, stages: &mut Stages) -> Result<()> {
    transport.attach(Arc::clone(session)).context("Failed to attach session")?;
    stages.attached = true;

    transport.install_signal_handlers().context("Failed to install signal handlers")?;
    stages.signals = true;

    tracing::info!("Serving requests for {}", session.mountpoint().display());
    transport.run()
}

fn teardown<T: Transport>(transport: &mut T, session: &Session, stages: &Stages) -> Vec<TeardownError> {
    let mut errors = Vec::new();
    let mut record = |step: TeardownStep, result: Result<()>| {
        if let Err(cause) = result {
            tracing::error!("Teardown step '{}' failed: {:#}", step, cause);
            errors.push(TeardownError { step, cause });
        }
    };

    if stages.signals {
        record(TeardownStep::RemoveSignalHandlers, transport.remove_signal_handlers());
    }
    if stages.attached {
        record(TeardownStep::Detach, transport.detach());
    }
    record(TeardownStep::DestroySession, transport.destroy_session(session));
    record(TeardownStep::Unmount, transport.unmount());

    errors
}

/// Signals that unmount the filesystem while it is served
const HANDLED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Put `signals` back to their default disposition
///
/// tokio leaves its process-level handlers installed after the streams are
/// dropped, so they have to be reset explicitly. Every signal is attempted;
/// the last failure is returned.
fn restore_default_dispositions(signals: &[Signal]) -> nix::Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let mut result = Ok(());
    for &sig in signals {
        // SAFETY: SIG_DFL installs no handler code.
        if let Err(e) = unsafe { sigaction(sig, &default) } {
            tracing::error!("Failed to restore default handler for {}: {}", sig, e);
            result = Err(e);
        }
    }
    result
}

/// Transport backed by fuser and the kernel's /dev/fuse
pub struct FuseTransport {
    runtime: Arc<Runtime>,
    channel: Channel,
    session: Option<fuser::Session<FuseAdapter>>,
    signals: Option<JoinHandle<()>>,
}

impl FuseTransport {
    /// Create a transport with a dedicated runtime for the dispatcher
    pub fn new(worker_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("fusebridge")
            .enable_all()
            .build()
            .context("Failed to create FUSE runtime")?;

        Ok(Self { runtime: Arc::new(runtime), channel: Channel::new(), session: None, signals: None })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn fuse_session(&mut self) -> Result<&mut fuser::Session<FuseAdapter>> {
        self.session.as_mut().context("Filesystem is not mounted")
    }
}

impl Transport for FuseTransport {
    fn mount(&mut self, mountpoint: &Path, options: &[MountOption]) -> Result<()> {
        // Validate mountpoint exists and is a directory
        if !mountpoint.exists() {
            anyhow::bail!("Mount point does not exist: {}", mountpoint.display());
        }

        if !mountpoint.is_dir() {
            anyhow::bail!("Mount point is not a directory: {}", mountpoint.display());
        }

        if self.session.is_some() {
            anyhow::bail!("Transport is already mounted");
        }

        let adapter = FuseAdapter::new(self.channel.clone(), Arc::clone(&self.runtime));
        let session = fuser::Session::new(adapter, mountpoint, options)
            .with_context(|| format!("Failed to mount filesystem at {}", mountpoint.display()))?;
        self.session = Some(session);

        tracing::info!("Filesystem mounted at {}", mountpoint.display());
        Ok(())
    }

    fn attach(&mut self, session: Arc<Session>) -> Result<()> {
        if !self.channel.attach(session) {
            anyhow::bail!("A session is already attached");
        }
        Ok(())
    }

    fn install_signal_handlers(&mut self) -> Result<()> {
        let mut unmounter = self.fuse_session()?.unmount_callable();

        let task = {
            let _guard = self.runtime.enter();
            let mut interrupt =
                signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
            let mut terminate =
                signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
            let mut hangup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

            self.runtime.spawn(async move {
                let name = tokio::select! {
                    _ = interrupt.recv() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                    _ = hangup.recv() => "SIGHUP",
                };
                tracing::info!(signal = name, "Received signal, unmounting");
                if let Err(e) = unmounter.unmount() {
                    tracing::error!("Failed to unmount after {}: {}", name, e);
                }
            })
        };

        self.signals = Some(task);
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        self.fuse_session()?.run().context("FUSE session loop failed")
    }

    fn remove_signal_handlers(&mut self) -> Result<()> {
        let Some(task) = self.signals.take() else {
            return Ok(());
        };
        task.abort();
        restore_default_dispositions(&HANDLED_SIGNALS)
            .context("Failed to restore default signal handlers")
    }

    fn detach(&mut self) -> Result<()> {
        match self.channel.detach() {
            Some(_) => Ok(()),
            None => anyhow::bail!("No session attached"),
        }
    }

    fn destroy_session(&mut self, session: &Session) -> Result<()> {
        if !self.runtime.block_on(session.destroy()) {
            tracing::debug!("Session was already destroyed by the kernel");
        }
        Ok(())
    }

    fn unmount(&mut self) -> Result<()> {
        let mut session = self.session.take().context("Filesystem is not mounted")?;
        session.unmount();
        drop(session);

        tracing::info!("Filesystem unmounted");
        Ok(())
    }
}
