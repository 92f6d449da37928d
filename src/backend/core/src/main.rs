//! Fleetlog Server - Main entry point
//!
//! Reads newline-delimited JSON reports and task commands on stdin, applies
//! them to the engine and writes one JSON outcome per line to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tokio_util::sync::CancellationToken;

use fleetlog_core::{
    config::{Config, StorageBackend},
    engine::FleetEngine,
    ingest::Inbound,
    telemetry::{self, LogFormat},
};

#[derive(Debug, Parser)]
#[command(name = "fleetlog-server", version, about = "Fleet state aggregation and task audit log")]
struct Args {
    /// Configuration file (toml, yaml or json); FLEETLOG__* variables override it
    #[arg(short, long, env = "FLEETLOG_CONFIG")]
    config: Option<String>,

    /// Store data in a sled database at this path
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log format: json, pretty or compact
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };
    if let Some(path) = args.data_dir {
        config.storage.backend = StorageBackend::Sled;
        config.storage.path = path;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    telemetry::init_logging(&config.logging)?;
    telemetry::describe_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.storage.backend,
        "Starting Fleetlog Server"
    );

    let engine = Arc::new(FleetEngine::open(&config)?);

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let sweep = engine.spawn_health_sweep(cancel_token.clone());

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            _ = cancel_token.cancelled() => break,
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to read input");
                break;
            }
            None => {
                tracing::info!("Input closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Inbound>(&line) {
            Ok(inbound) => match engine.submit_inbound(inbound) {
                Ok(outcome) => serde_json::to_value(&outcome)?,
                Err(e) => {
                    e.log();
                    serde_json::json!({
                        "error": {
                            "code": e.code(),
                            "message": e.message(),
                            "details": e.details(),
                        }
                    })
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unparseable input line");
                serde_json::json!({ "error": { "message": e.to_string() } })
            }
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    cancel_token.cancel();
    sweep.await?;
    engine.shutdown()?;
    tracing::info!("Server shutdown complete");

    Ok(())
}
