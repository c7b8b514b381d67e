//! Thermowire Daemon - Main entry point
//!
//! Runs the sensor engine and serves its state over HTTP and WebSocket.

mod api;
mod config;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "thermowire")]
#[command(about = "1-Wire temperature sensor monitoring daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "thermowire.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single scan, print the devices and exit
    #[arg(long)]
    scan_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Thermowire v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;

    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        driver = ?config.daemon.driver,
        buses = config.buses.len(),
        poll_interval_ms = config.daemon.poll_interval_ms,
        "Configuration loaded"
    );

    let state = state::AppState::new(config.clone()).await?;

    if args.scan_once {
        info!("Running single scan");
        state.start().await?;
        let devices = state.manager.list_devices().await?;
        println!("Found {} devices:", devices.len());
        for device in devices {
            let bus = device
                .bus
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  - {} ({}) on bus {} [{}]",
                device.name,
                device.address,
                bus,
                if device.live { "live" } else { "absent" }
            );
            println!(
                "    Resolution: {} bits, parasite power: {}",
                device.resolution, device.parasite_powered
            );
        }
        state.stop().await?;
    } else {
        server::run(state, &config.daemon.bind).await?;
    }

    Ok(())
}
