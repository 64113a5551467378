//! binfmt-misc-fs CLI
//!
//! Mounts the binfmt_misc emulator and serves it until unmounted or signaled.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use log::{debug, info, LevelFilter};

use binfmt_misc_fs::signal::{install_signal_handlers, ShutdownSignal};
use binfmt_misc_fs::{spawn_mount, BinfmtMisc, MountOptions};

#[derive(Parser)]
#[command(name = "binfmt-misc-fs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incomplete binfmt_misc emulator")]
#[command(long_about = "binfmt-misc-fs - binfmt_misc filesystem emulator\n\n\
    Serves status, register and one file per registered binary format from\n\
    memory, so binfmt registration tools can be tested without root.\n\n\
    Examples:\n\
      binfmt-misc-fs -s /tmp/binfmt_misc\n\
      binfmt-misc-fs -s -o fsname=binfmt_test,allow_root /tmp/binfmt_misc")]
pub struct Cli {
    /// Directory to mount the emulator on
    #[arg(value_name = "MOUNTPOINT")]
    pub mountpoint: PathBuf,

    /// Mount options (comma separated, may be repeated)
    #[arg(short = 'o', value_name = "OPT[,OPT...]", action = clap::ArgAction::Append)]
    pub options: Vec<String>,

    /// Single-threaded request handling (always in effect)
    #[arg(short = 's', long = "single")]
    pub single: bool,

    /// Stay in the foreground (always in effect)
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if !cli.mountpoint.is_dir() {
        bail!("mount point {} is not a directory", cli.mountpoint.display());
    }

    let mut options = MountOptions::default();
    for opts in &cli.options {
        options.apply(opts);
    }
    debug!(
        "options {:?} (single={}, foreground={})",
        options, cli.single, cli.foreground
    );

    let shutdown = Arc::new(ShutdownSignal::new());
    install_signal_handlers(shutdown.clone()).context("installing signal handlers")?;

    let session = spawn_mount(BinfmtMisc::new(), &cli.mountpoint, &options)
        .with_context(|| format!("mounting on {}", cli.mountpoint.display()))?;

    while !shutdown.is_signaled() {
        if session.guard.is_finished() {
            info!("unmounted externally");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }

    info!("{} received, unmounting", shutdown.signal_name());
    drop(session);
    Ok(())
}
