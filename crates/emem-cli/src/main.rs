//! `emem` entry point.
//!
//! Opens an EtherCAT link to a chain of transducer boards (or the simulated
//! chain), streams frames until the cycle limit or a signal, then prints
//! the cycle statistics as JSON.

mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use emem_common::config::LinkConfig;
use emem_link::{EmemLink, EmemLinkBuilder, Topology};
use emem_master::{list_adapters, SimulatedChain};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::signals::SignalHandler;

/// Interval between progress lines.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// EmemLink command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "emem",
    about = "EtherCAT master for ultrasound transducer chains",
    version,
    long_about = None
)]
struct Args {
    /// Path to a link configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Network adapter (overrides config; empty auto-detects).
    #[arg(long, short = 'i', value_name = "NAME")]
    interface: Option<String>,

    /// Number of devices expected on the chain.
    #[arg(long, short = 'd', default_value = "1")]
    devices: usize,

    /// Frames to send before closing (0 = until interrupted).
    #[arg(long, default_value = "0")]
    cycles: u64,

    /// Run against the simulated chain instead of a network adapter.
    #[arg(long, short = 's')]
    simulated: bool,

    /// List network adapters and exit.
    #[arg(long)]
    list_adapters: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    if args.list_adapters {
        return print_adapters();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting emem");
    let mut config = load_config(&args)?;
    if let Some(interface) = &args.interface {
        config.interface.clone_from(interface);
    }

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;
    run(config, &args, signal_handler)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("emem={level},emem_link={level},emem_master={level},emem_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration: `--config`, then `EMEM_CONFIG_PATH`, then defaults.
fn load_config(args: &Args) -> Result<LinkConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return LinkConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var("EMEM_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from EMEM_CONFIG_PATH");
            return LinkConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from EMEM_CONFIG_PATH={env_path}"));
        }
        warn!(path = %env_path, "EMEM_CONFIG_PATH set but file does not exist, using defaults");
    }

    info!("No config file given, using built-in defaults");
    Ok(LinkConfig::default())
}

fn print_adapters() -> Result<()> {
    let adapters = list_adapters().context("Failed to enumerate adapters")?;
    if adapters.is_empty() {
        println!("no adapters found");
    }
    for adapter in adapters {
        println!("{:<16} {}", adapter.name, adapter.description);
    }
    Ok(())
}

fn run(config: LinkConfig, args: &Args, signal_handler: SignalHandler) -> Result<()> {
    let send_cycle = config.send_cycle;
    let mut builder = EmemLinkBuilder::new(config).on_lost(|msg| error!("{msg}"));
    if args.simulated {
        info!(devices = args.devices, "Using the simulated chain");
        builder = builder.with_transport(Box::new(SimulatedChain::new(args.devices)));
    }
    let mut link: EmemLink = builder.build().context("Invalid link configuration")?;

    let topology = Topology::new(args.devices);
    let found = link.open(&topology).context("Failed to open the EtherCAT link")?;
    info!(slave_count = found, "Link up");

    let mut tx = link.tx_datagram();
    let mut rx = link.rx_datagram();
    let mut sent = 0u64;
    let mut last_report = Instant::now();

    while !signal_handler.shutdown_requested() {
        // Tag each frame so the acknowledgement byte shows it was applied.
        let tag = u8::try_from(sent % 255).unwrap_or(0) + 1;
        for i in 0..topology.device_count() {
            if let Some(first) = tx.device_mut(i).and_then(|d| d.first_mut()) {
                *first = tag;
            }
        }
        if let Err(e) = link.send(&tx) {
            error!(error = %e, "Send failed");
            signal_handler.request_shutdown();
            continue;
        }
        sent += 1;

        thread::sleep(send_cycle);
        link.receive(&mut rx).context("Receive failed")?;

        if last_report.elapsed() >= REPORT_INTERVAL {
            let stats = link.stats();
            info!(
                sent,
                wkc = link.wkc(),
                expected_wkc = link.expected_wkc(),
                ack0 = rx.ack(0),
                mean_us = stats.mean_ns.map_or(0, |ns| ns / 1000),
                wkc_errors = stats.wkc_error_count,
                "Link status"
            );
            last_report = Instant::now();
        }

        if args.cycles > 0 && sent >= args.cycles {
            info!(cycles = sent, "Cycle limit reached");
            break;
        }
    }

    if let Some(signal) = signal_handler.last_signal() {
        info!(%signal, "Stopping on signal");
    }
    link.close().context("Failed to close the link")?;

    let stats = link.stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("Failed to serialize statistics")?
    );
    Ok(())
}
