use anyhow::Context;
use clap::Parser;
use fusebridge::config::Config;
use fusebridge::fuse::backend::MemoryBackend;
use fusebridge::fuse::interface::{ROOT_INO, RawFileSystem};
use fusebridge::fuse::mount::{self, FuseTransport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Serve a read-only in-memory filesystem over FUSE
#[derive(Debug, Parser)]
#[command(name = "fusebridge", version, about)]
struct Args {
    /// Directory to mount on
    mountpoint: PathBuf,

    /// Comma separated mount options (ro, rw, allow_other, fsname=NAME, ...)
    #[arg(short = 'o', value_name = "OPTIONS")]
    options: Vec<String>,

    /// Host directory to snapshot and serve
    #[arg(long, value_name = "DIR", env = "FUSEBRIDGE_SOURCE")]
    source: Option<PathBuf>,

    /// Configuration file (defaults to ./fusebridge.toml when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    config.fuse.options.extend(args.options.iter().cloned());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fusebridge");

    let mount_options = config.fuse.mount_options().context("Invalid mount options")?;
    let backend: Arc<dyn RawFileSystem> = Arc::new(build_backend(&args, &config)?);

    let mut transport = FuseTransport::new(config.runtime.worker_threads)?;
    let outcome = mount::run(
        &mut transport,
        backend,
        &args.mountpoint,
        &mount_options,
        config.dispatch_options(),
    );

    for failure in &outcome.teardown {
        tracing::warn!("{}", failure);
    }
    if let Err(e) = &outcome.served {
        tracing::error!("fusebridge exited with error: {:#}", e);
    }

    Ok(ExitCode::from(outcome.exit_code() as u8))
}

fn build_backend(args: &Args, config: &Config) -> anyhow::Result<MemoryBackend> {
    let backend = match &args.source {
        Some(source) => MemoryBackend::from_dir(source)?,
        None => {
            let backend = MemoryBackend::new();
            backend
                .add_file(ROOT_INO, "README", 0o444, "Served by fusebridge.\n")
                .context("Failed to seed default tree")?;
            backend
        }
    };
    Ok(backend.with_ttl(config.cache.entry_ttl()))
}
