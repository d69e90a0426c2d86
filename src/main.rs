//! mpremote-bridge: exposes a child REPL's PTY as RFC 2217 and raw TCP
//! serial-port endpoints.
//!
//! Usage:
//!   mpremote-bridge [-p PORT] [-s PORT] -- /path/to/repl [args...]

mod config;
mod error;
mod listener;
mod pty;
mod redirector;
mod rfc2217;
mod supervisor;
mod virtual_serial;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Args, Config};
use listener::Dispatcher;
use pty::PtyProcess;
use supervisor::ProcessSupervisor;
use virtual_serial::VirtualSerial;

fn main() -> Result<()> {
    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("mpremote-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("command: {:?}", config.command);
    if let Some(ref cwd) = config.cwd {
        info!("working directory: {}", cwd.display());
    }

    match run(config) {
        Ok(()) => {
            info!("goodbye");
            Ok(())
        }
        Err(e) => {
            eprintln!("fatal error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(config: Config) -> Result<()> {
    let supervisor = ProcessSupervisor::new(config.command.clone(), config.cwd.clone());
    let initial_pty: PtyProcess = supervisor.create().context("failed to spawn child process")?;

    if let (Some(rows), Some(cols)) = (config.rows, config.cols) {
        if let Err(e) = initial_pty.resize(rows, cols) {
            warn!("failed to size pty to {}x{}: {}", rows, cols, e);
        }
    }

    let virtual_serial = VirtualSerial::new(initial_pty, Duration::from_millis(10));

    let dispatcher = Dispatcher::bind(&config, supervisor, virtual_serial)
        .context("failed to bind listeners")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handler(Arc::clone(&shutdown))?;

    dispatcher.run(&shutdown);
    Ok(())
}

/// Flip `shutdown` on SIGINT/SIGTERM so the accept loop exits cleanly and
/// the current child is closed instead of left behind as an orphan.
#[cfg(unix)]
fn install_signal_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, shutdown)?;
    Ok(())
}

#[cfg(windows)]
fn install_signal_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc_windows::register(move || {
        shutdown.store(true, Ordering::SeqCst);
    });
    Ok(())
}

#[cfg(windows)]
mod ctrlc_windows {
    //! Ctrl-C handler for the Windows build is not implemented: registering
    //! `SetConsoleCtrlHandler` needs a process-wide callback slot this crate
    //! has no other static state for, and the POSIX build is what gets
    //! exercised day to day. Left as a deliberate no-op rather than a
    //! half-finished handler that looks wired up but never fires.
    pub fn register<F: Fn() + Send + 'static>(_handler: F) {}
}
