//! Gateway daemon entry point: CLI parsing, configuration loading, logging,
//! daemonization, and wiring the cycle engine to the Modbus server.

mod signals;
mod state_export;

use anyhow::{Context, Result};
use clap::Parser;
use gw_common::config::{GatewayConfig, DEFAULT_CONFIG_PATH};
use gw_fieldbus::SimulatedKbusDriver;
use gw_modbus::{Dispatcher, GatewayBanks, ModbusServer, WatchdogBank};
use gw_runtime::{BankSync, CycleControl, CycleEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::signals::SignalHandler;

/// `kbus-modbus-gatewayd` command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "kbus-modbus-gatewayd",
    about = "KBUS-to-Modbus TCP/UDP gateway daemon",
    version,
    long_about = None
)]
struct Args {
    /// Do not daemonize; stay attached to the controlling terminal.
    #[arg(short = 'd', long = "nodaemon")]
    nodaemon: bool,

    /// Verbosity level, 0 (silent) through 7 (trace).
    #[arg(short = 'v', long = "verbosity", default_value_t = 0)]
    verbosity: u8,

    /// Configuration file path, overriding the compiled-in default.
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbosity);

    info!(version = env!("CARGO_PKG_VERSION"), "starting gateway daemon");

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = GatewayConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path:?}"))?;
    info!(?config, "configuration loaded");

    if !args.nodaemon {
        daemonize().context("failed to daemonize")?;
    }

    let signals = SignalHandler::install().context("failed to install signal handlers")?;
    if !args.nodaemon {
        SignalHandler::ignore_sighup().context("failed to ignore SIGHUP")?;
    }

    run(&config, &signals)
}

/// Map `-v` to a `tracing` filter. `-v 0` (the original's default, "no
/// `-v`") disables output entirely; `RUST_LOG` always wins if set, matching
/// the reference daemon's `init_logging`.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => None,
        1 => Some("error"),
        2 => Some("warn"),
        3 => Some("info"),
        4 => Some("debug"),
        _ => Some("trace"),
    };

    let default_filter = match level {
        Some(level) => format!(
            "gw_daemon={level},gw_runtime={level},gw_modbus={level},gw_fieldbus={level},gw_common={level}"
        ),
        None => "off".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&default_filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Detach from the controlling terminal: fork, start a new session, `chdir
/// /`, clear the umask, and close the standard file descriptors. Mirrors
/// `main.c`'s `start_daemon` using `nix`'s safe wrappers where one exists.
fn daemonize() -> Result<()> {
    use nix::sys::stat::{umask, Mode};
    use nix::unistd::{chdir, close, fork, setsid, ForkResult};

    // SAFETY: called once at startup before any additional threads have
    // been spawned (the cycle engine, watchdog, and server threads all
    // start after this call returns in the child).
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;
    chdir("/").context("chdir(/) failed")?;
    umask(Mode::empty());

    for fd in [0, 1, 2] {
        // Closing an already-open standard fd; ENOENT/EBADF here would mean
        // the process was started with closed standard streams, which is
        // harmless to ignore.
        // SAFETY: fd is one of the three standard descriptors, always valid
        // at this point in a freshly forked child.
        let _ = unsafe { close(fd) };
    }

    Ok(())
}

fn run(config: &GatewayConfig, signals: &SignalHandler) -> Result<()> {
    let banks = Arc::new(GatewayBanks::new(env!("CARGO_PKG_VERSION")));
    let watchdog = Arc::new(WatchdogBank::new({
        let banks = Arc::clone(&banks);
        move || banks.zero_outputs()
    }));

    let driver = SimulatedKbusDriver::new();
    let engine = CycleEngine::new(driver, Arc::clone(&banks) as Arc<dyn BankSync>, config.clone());
    engine.start().context("failed to start KBUS cycle engine")?;
    info!("KBUS cycle engine started");

    state_export::publish(&engine.terminals());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&banks),
        Arc::clone(&watchdog),
        Arc::clone(&engine) as Arc<dyn CycleControl>,
    ));
    let server = ModbusServer::new(
        dispatcher,
        config.modbus_port,
        config.max_tcp_connections,
        Duration::from_millis(config.modbus_delay_ms),
    );
    let server_handle = server.start().context("failed to start Modbus server")?;
    info!(port = config.modbus_port, "Modbus TCP/UDP server started");

    let mut ticks: u64 = 0;
    while !signals.shutdown_requested() {
        std::thread::sleep(Duration::from_millis(1000));
        ticks += 1;
        if ticks % 30 == 0 {
            let m = engine.metrics_snapshot();
            debug!(
                min_us = ?m.min_ns.map(|ns| ns / 1000),
                max_us = ?m.max_ns.map(|ns| ns / 1000),
                mean_us = ?m.mean_ns.map(|ns| ns / 1000),
                overruns = m.overrun_count,
                "cycle timing"
            );
        }
    }

    info!("shutdown signal received, stopping");
    server_handle.shutdown();
    engine.stop();
    warn!("gateway daemon stopped");
    Ok(())
}
