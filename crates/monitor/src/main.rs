//! odrive-monitor
//!
//! Headless front end for the ODrive USB backend. Keeps the device registry
//! scanning in the background, reports connection changes and periodically
//! prints the watched endpoint values.

mod config;
mod display;

use anyhow::{Context, Result};
use backend::{BackendConfig, DeviceRegistry, Session, UsbHost, spawn_scan_worker};
use clap::Parser;
use common::{UsbBackend, create_event_channel, setup_logging};
use config::{MonitorConfig, expand_path};
use std::sync::Arc;
use tokio::signal;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "odrive-monitor")]
#[command(author, version, about = "ODrive USB monitor - watch endpoint values of attached boards")]
#[command(long_about = "
Talks to ODrive motor controllers over USB, discovers their endpoint schema
and prints the values of the watched endpoints at a fixed interval.

EXAMPLES:
    # Run with default config
    odrive-monitor

    # Run with custom config
    odrive-monitor --config ~/odrive/monitor.toml

    # List attached boards and exit
    odrive-monitor --list-devices

    # Watch extra endpoints for this run
    odrive-monitor --watch odrv0.axis0.current_state --watch odrv0.axis0.error

CONFIGURATION:
    The monitor looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/odrive-monitor/monitor.toml
    3. /etc/odrive-monitor/monitor.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration (to --config or the default location) and exit
    #[arg(long)]
    save_config: bool,

    /// List ODrive boards and exit
    #[arg(long)]
    list_devices: bool,

    /// Additional endpoint path to watch (repeatable)
    #[arg(short, long, value_name = "PATH")]
    watch: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = MonitorConfig::default();
        let path = args
            .config
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(MonitorConfig::default_path);
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        MonitorConfig::load_or_default()
    };
    config.monitor.watch.extend(args.watch.iter().cloned());

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.monitor.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("odrive-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let backend_config = config.backend();
    backend_config
        .validate()
        .context("Invalid backend configuration")?;
    let host = UsbHost::new(backend_config.usb.clone()).context("Failed to initialize USB")?;

    if args.list_devices {
        return tokio::task::spawn_blocking(move || list_devices_mode(host, &backend_config))
            .await
            .context("Device listing task failed")?;
    }

    run_monitor(config, backend_config, host).await
}

/// List matching boards with their serial numbers and exit
fn list_devices_mode(mut host: UsbHost, config: &BackendConfig) -> Result<()> {
    info!("Listing ODrive boards...");

    let candidates = host
        .enumerate(config.usb.vendor_id, config.usb.product_id)
        .context("Failed to enumerate USB devices")?;

    if candidates.is_empty() {
        println!("No ODrive boards found.");
        return Ok(());
    }

    println!("Found {} ODrive board(s):\n", candidates.len());
    for candidate in candidates {
        println!(
            "  {:04x}:{:04x} - {}",
            candidate.vendor_id, candidate.product_id, candidate.description
        );
        println!("      Bus {:03} Device {:03}", candidate.key.bus, candidate.key.address);

        match Session::connect(&mut host, candidate, config.protocol.clone()) {
            Ok(session) => {
                if let Some(identity) = session.identity() {
                    println!("      Serial: {}", identity.serial_hex());
                }
                if let Some(schema) = session.schema() {
                    println!("      Endpoints: {}", schema.len());
                }
                session.disconnect();
            }
            Err(e) => println!("      Not readable: {}", e),
        }
        println!();
    }

    Ok(())
}

async fn run_monitor(config: MonitorConfig, backend_config: BackendConfig, host: UsbHost) -> Result<()> {
    let (sink, events) = create_event_channel();
    let registry = Arc::new(DeviceRegistry::new(host, backend_config).with_events(sink));
    let worker = spawn_scan_worker(registry.clone()).context("Failed to start scan worker")?;

    let mut ticker = time::interval(config.monitor.refresh_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let watch = Arc::new(config.monitor.watch);

    info!(
        "Watching {} endpoint(s), press Ctrl+C to shutdown",
        watch.len()
    );

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", display::format_event(&event)),
                Err(e) => {
                    warn!("Event channel closed: {}", e);
                    break;
                }
            },
            _ = ticker.tick() => {
                let registry = registry.clone();
                let watch = watch.clone();
                let lines = tokio::task::spawn_blocking(move || poll(&*registry, watch.as_slice()))
                    .await
                    .context("Refresh task failed")?;
                for line in lines {
                    println!("{}", line);
                }
            }
        }
    }

    info!("Stopping scan worker...");
    tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("Failed to stop scan worker")?;

    info!("Monitor shutdown complete");
    Ok(())
}

/// Read every watched path and the status of every ready board
fn poll<B: UsbBackend>(registry: &DeviceRegistry<B>, watch: &[String]) -> Vec<String> {
    let occupied: Vec<usize> = registry.sessions().into_iter().map(|(slot, _)| slot).collect();

    let mut lines: Vec<String> = watch
        .iter()
        .filter(|path| {
            backend::parse_path(path)
                .map(|(slot, _)| occupied.contains(&slot))
                .unwrap_or(true)
        })
        .map(|path| display::format_reading(path, &registry.read_value(path)))
        .collect();

    lines.extend(
        registry
            .refresh_statuses()
            .iter()
            .map(|(slot, status)| display::format_status(*slot, status)),
    );
    lines
}
