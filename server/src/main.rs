//! Edge server binary
//!
//! Runs the ingestion API, the admin server, the MQTT broker gateway and the
//! flush scheduler until Ctrl-C, then flushes once more and exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iotedge_server::{
    broker::BrokerGateway,
    buffer::AggregationBuffer,
    config::EdgeConfig,
    flush::{FlushScheduler, Persistence},
    forward::RedirectClient,
    gate::AdmissionGate,
    registry::DeviceRegistry,
    router::TopicRouter,
    server::{
        api::{self, ApiState},
        http::{self, AdminState},
    },
    storage::{self, with_timeout},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SINK_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "iotedge-server")]
#[command(about = "IoT edge telemetry server (HTTP + MQTT ingestion)", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (defaults to ~/.iotserver/iot.* or ./iot.*)
    #[arg(short, long, env = "IOTEDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error (RUST_LOG takes precedence)
    #[arg(short, long, default_value = "info")]
    verbose: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default configuration as TOML and exit
    WriteDefaultConfig {
        #[arg(default_value = "iot.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.verbose, args.json);

    if let Some(Command::WriteDefaultConfig { path }) = &args.command {
        EdgeConfig::write_default(path)?;
        info!("wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = EdgeConfig::load(args.config.as_deref()).context("Unreadable configuration")?;
    run(config).await
}

async fn run(config: EdgeConfig) -> Result<()> {
    let http_addr: SocketAddr = config.http_addr.parse().context("Invalid http_addr")?;
    let admin_addr: SocketAddr = config.admin_addr.parse().context("Invalid admin_addr")?;

    let storage = storage::open(&config.storage)
        .await
        .context("Failed to open storage")?;
    with_timeout(SINK_CHECK_TIMEOUT, storage.sink.check())
        .await
        .context("Timeseries sink is not reachable")?;

    let buffer = Arc::new(AggregationBuffer::new());
    let cancel = CancellationToken::new();

    let persistence = match config.redirect_target() {
        Some(target) => {
            info!("redirecting flushed batches to {}", target);
            Persistence::Redirect(RedirectClient::new(target).context("Failed to build redirect client")?)
        }
        None => Persistence::Sink(storage.sink.clone()),
    };
    let scheduler = FlushScheduler::new(buffer.clone(), persistence, config.flush.clone());
    let flush_task = tokio::spawn(scheduler.run(cancel.clone()));

    let state = Arc::new(ApiState {
        gate: AdmissionGate::new(),
        registry: DeviceRegistry::new(storage.devices.clone()),
        sink: storage.sink.clone(),
    });
    let (_, api_server) =
        api::bind_api(http_addr, state, cancel.clone()).context("Failed to bind ingestion API")?;
    let mut api_task = tokio::spawn(api_server);

    let admin_state = AdminState {
        buffer: buffer.clone(),
        sink: storage.sink.clone(),
    };
    let admin_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = http::serve_admin(admin_addr, admin_state, admin_cancel).await {
            error!("Admin HTTP server error: {}", e);
        }
    });

    let gateway = BrokerGateway::new(
        config.mqtt_port,
        config.broker.clone(),
        TopicRouter::new(buffer.clone()),
    );
    let mut gateway_task = tokio::spawn(gateway.run(cancel.clone()));

    let outcome: Result<()> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
        res = &mut gateway_task => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e).context("MQTT broker gateway failed"),
            Err(e) => Err(e).context("MQTT broker gateway panicked"),
        },
        res = &mut api_task => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e).context("Ingestion API failed"),
            Err(e) => Err(e).context("Ingestion API panicked"),
        },
    };

    cancel.cancel();
    if let Err(e) = flush_task.await {
        error!("flush scheduler panicked: {}", e);
    }
    if let Err(e) = storage.sink.shutdown().await {
        error!("sink shutdown failed: {}", e);
    }
    info!("stopped");
    outcome
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
