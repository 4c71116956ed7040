//! CLI for the IoT edge server
//!
//! Administrative client and device simulators:
//! - conf-device: change a device's sampling interval and buffer size
//! - conf-sensor: set a sensor's calibration offset
//! - simulate: dummy HTTP device posting random batches
//! - mqtt-sim: publish numeric samples to the broker

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod output;
mod retry;

#[derive(Parser)]
#[command(name = "iotedge")]
#[command(about = "iotedge - client and simulators for the IoT edge server", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure a device's sampling interval and buffer size
    ConfDevice(commands::conf_device::ConfDeviceArgs),

    /// Configure a sensor's calibration offset
    ConfSensor(commands::conf_sensor::ConfSensorArgs),

    /// Run a dummy device that posts random batches over HTTP
    Simulate(commands::simulate::SimulateArgs),

    /// Publish numeric samples to the MQTT broker
    MqttSim(commands::mqtt_sim::MqttSimArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::ConfDevice(args) => commands::conf_device::run(args).await,
        Commands::ConfSensor(args) => commands::conf_sensor::run(args).await,
        Commands::Simulate(args) => commands::simulate::run(args).await,
        Commands::MqttSim(args) => commands::mqtt_sim::run(args).await,
    };

    if let Err(e) = &result {
        output::error(&format!("{:#}", e));
    }
    result
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
