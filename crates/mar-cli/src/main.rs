//! # marmounter
//!
//! Mounts MAR (and ZIP) archives as a unified, case-insensitive filesystem,
//! optionally overlaid with a writable directory.
//!
//! ```text
//! marmounter overlaydir=overlay mountpoint=/mnt/game base.mar addprefix=/mods:patch.mar -- -o allow_other
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

mod commands;
#[cfg(feature = "fuse")]
mod fuse;

use commands::{Flow, MountSetup};
use mar_fs::{spawn_preload, MayakashiFs, Overlay};
use mar_store::ChunkStore;

/// Mount MAR/ZIP archives as a unified virtual filesystem.
#[derive(Parser)]
#[command(name = "marmounter")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Archive paths and option commands (see `commandsfile=` for the file
    /// form); processed in order.
    #[arg(value_name = "COMMAND")]
    commands: Vec<String>,

    /// Everything after `--` is passed through to the FUSE mount.
    #[arg(last = true, value_name = "MOUNT_OPTION")]
    mount_options: Vec<String>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MAYAKASHI_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// A panic inside a filesystem callback leaves the bridge with a
/// half-handled request; log the backtrace so the mount's death is
/// diagnosable, then abort.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!(%panic_info, "panic in filesystem callback\n{backtrace}");
        default_hook(panic_info);
        std::process::abort();
    }));
}

fn main() -> Result<()> {
    // the bridge writes progress to stderr; dying on a closed pipe is fine
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    init_logging();

    let cli = Cli::parse();

    let mut setup = MountSetup::new();
    for command in &cli.commands {
        if setup
            .parse_command(command)
            .with_context(|| format!("while processing argument {command:?}"))?
            == Flow::ShowHashes
        {
            return Ok(());
        }
    }

    info!(files = setup.tree.file_count(), "archive index loaded");

    let overlay = setup.overlay_dir.map(|root| {
        let mut overlay = Overlay::new(root);
        for prefix in &setup.ro_prefixes {
            overlay.add_readonly_prefix(prefix);
        }
        overlay
    });
    if overlay.is_none() && !setup.ro_prefixes.is_empty() {
        warn!("roprefix configured without overlaydir; everything is read-only anyway");
    }
    if let Some(addr) = &setup.pprof_addr {
        warn!(addr = addr.as_str(), "pprof endpoint requested but not built in, ignoring");
    }

    let fs = Arc::new(MayakashiFs::new(
        setup.tree,
        ChunkStore::new(),
        overlay,
        setup.preload_globs,
    ));

    install_panic_hook();
    let preload_workers = spawn_preload(&fs);
    if !preload_workers.is_empty() {
        info!(workers = preload_workers.len(), "preload started");
    }

    let mountpoint = setup
        .mountpoint
        .context("no mountpoint configured (mountpoint=<path>)")?;

    #[cfg(feature = "fuse")]
    {
        fuse::mount(fs, &mountpoint, &cli.mount_options)?;
    }

    #[cfg(not(feature = "fuse"))]
    {
        let _ = &cli.mount_options;
        warn!(
            mountpoint = %mountpoint.display(),
            "FUSE support disabled; recompile with --features fuse to mount"
        );
    }

    Ok(())
}
