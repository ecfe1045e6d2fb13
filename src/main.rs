//! RBN VFD CLI - Rotate Reverse Beacon Network spots across a serial VFD.

use anyhow::{Context, Result};
use clap::Parser;
use rbn_vfd::{
    config::Config,
    display::{LineLayout, VfdDisplay},
    event::{Direction, Event, OutputStatus},
    metrics::{MetricsState, start_metrics_server},
    service::{Command, Controller},
};
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// RBN VFD - Aggregate RBN spots and show them on a two-line VFD
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Callsign to use for RBN login
    #[arg(short, long, env = "RBN_CALLSIGN")]
    callsign: Option<String>,

    /// RBN server hostname
    #[arg(long, env = "RBN_HOST")]
    host: Option<String>,

    /// RBN server port
    #[arg(long, env = "RBN_PORT")]
    port: Option<u16>,

    /// Serial port of the VFD (e.g. /dev/ttyUSB0)
    #[arg(short = 'p', long, env = "RBN_VFD_PORT")]
    serial_port: Option<String>,

    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Minimum SNR (dB) for a spot to be shown
    #[arg(long, allow_negative_numbers = true)]
    min_snr: Option<i32>,

    /// Oldest spot to show, in minutes
    #[arg(long)]
    max_age: Option<u64>,

    /// Rotation interval in milliseconds
    #[arg(long)]
    scroll_interval: Option<u64>,

    /// Field order on each display line
    #[arg(long, value_enum)]
    layout: Option<LayoutArg>,

    /// Print every spot and raw feed line (verbose)
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics: Option<u16>,

    /// Maximum runtime in seconds (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_runtime: u64,

    /// Do not write settings back to the config file on exit
    #[arg(long)]
    no_save: bool,

    /// Write the effective settings, including command-line overrides,
    /// back to the config file on exit
    #[arg(long, conflicts_with = "no_save")]
    save: bool,

    /// Print the final statistics as JSON
    #[arg(long)]
    json: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LayoutArg {
    FreqCallSpeed,
    FreqSpeedCall,
}

impl From<LayoutArg> for LineLayout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::FreqCallSpeed => LineLayout::FreqCallSpeed,
            LayoutArg::FreqSpeedCall => LineLayout::FreqSpeedCall,
        }
    }
}

/// Layer command-line flags over the file configuration.
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(ref callsign) = args.callsign {
        config.callsign = callsign.trim().to_uppercase();
    }
    if let Some(ref host) = args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ref serial_port) = args.serial_port {
        config.display.serial_port = Some(serial_port.clone());
    }
    if let Some(min_snr) = args.min_snr {
        config.display.min_snr = min_snr;
    }
    if let Some(max_age) = args.max_age {
        config.display.max_age_minutes = max_age;
    }
    if let Some(interval) = args.scroll_interval {
        config.display.scroll_interval_ms = interval;
    }
    if let Some(layout) = args.layout {
        config.display.layout = layout.into();
    }
    if let Some(port) = args.metrics {
        config.metrics_enabled = true;
        config.metrics_port = port;
    }
}

/// The configuration to write back on exit, if any.
///
/// Overrides from the command line are one-off unless `--save` is given,
/// so by default the file's own settings are written back.
fn config_to_save<'a>(
    loaded: &'a Config,
    effective: &'a Config,
    args: &Args,
) -> Option<&'a Config> {
    if args.no_save {
        None
    } else if args.save {
        Some(effective)
    } else {
        Some(loaded)
    }
}

/// Text to print for an event, if any.
fn describe_event(event: &Event, verbose: bool) -> Option<String> {
    match event {
        Event::FeedStatus(status) => Some(format!("Feed: {}", status)),
        Event::FeedError(e) => Some(format!("Feed error: {}", e)),
        Event::OutputStatus(OutputStatus::Open(port)) => Some(format!("VFD open on {}", port)),
        Event::OutputStatus(OutputStatus::Closed) => Some("VFD closed".to_string()),
        Event::OutputError(e) => Some(format!("VFD error: {}", e)),
        Event::SpotAdded {
            key,
            spot_count,
            records,
        } if verbose => Some(format!("{} x{} ({} tracked)", key, spot_count, records)),
        Event::RawData { text, direction } if verbose => {
            let arrow = match direction {
                Direction::Received => "<",
                Direction::Sent => ">",
            };
            Some(format!("{} {}", arrow, text.trim_end()))
        }
        Event::DisplayUpdated(frame) if verbose => Some(frame.to_string()),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if args.list_ports {
        let ports = VfdDisplay::available_ports();
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        return Ok(());
    }

    let loaded = Config::load()?;
    let mut config = loaded.clone();
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    info!("RBN VFD starting...");
    info!("Server: {}:{}", config.host, config.port);

    let (controller, mut events) = Controller::start(&config);

    if config.metrics_enabled {
        let state = MetricsState {
            stats: controller.stats().clone(),
            store: controller.store().clone(),
        };
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, state).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    if let Some(ref port) = config.display.serial_port {
        controller.send(Command::OpenOutput(port.clone()));
    } else {
        info!("No VFD port configured; showing preview only");
    }

    if config.callsign.is_empty() {
        warn!("No callsign configured; set one with --callsign or in the config file");
    } else {
        info!("Callsign: {}", config.callsign);
        controller.send(Command::Connect(config.callsign.clone()));
    }

    // Create shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Handle Ctrl+C
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx_clone.send(true);
    });

    // Optional max runtime
    if args.max_runtime > 0 {
        let shutdown_tx_clone = shutdown_tx.clone();
        let max_runtime = args.max_runtime;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(max_runtime)).await;
            info!("Max runtime reached");
            let _ = shutdown_tx_clone.send(true);
        });
    }

    // Main event loop
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            event = events.recv() => {
                match event {
                    Some(event) => {
                        if let Some(text) = describe_event(&event, args.verbose) {
                            println!("{}", text);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Nobody reads events past this point
    drop(events);
    let stats = controller.stats().clone();
    controller.shutdown().await;

    if let Some(to_save) = config_to_save(&loaded, &config, &args) {
        match to_save.save() {
            Ok(path) => info!("Settings saved to {}", path.display()),
            Err(e) => warn!("Failed to save settings: {:#}", e),
        }
    }

    // Print final statistics
    let summary = stats.summary();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("\n\nFINAL STATISTICS");
        println!("{}", summary);
    }

    Ok(())
}
