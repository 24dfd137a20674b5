//! SensorLink Uploader
//!
//! Reads measurements from stdin, caches them on disk and uploads them in
//! the background.
//!
//! ## Input
//!
//! One JSON object per line:
//!
//! ```text
//! {"topic": "android_phone_acceleration", "key": {...}, "value": {...}}
//! ```
//!
//! Malformed lines and unknown topics are logged and skipped.
//!
//! ## Example
//!
//! ```bash
//! export SENSORLINK_REST_URL=http://localhost:8082
//! export SENSORLINK_SCHEMA_REGISTRY_URL=http://localhost:8081
//! sensorlink-uploader --config sensorlink.toml < measurements.ndjson
//! ```
//!
//! Stops on end of input or Ctrl-C, giving the submitter its configured join
//! timeout to deliver what it can.

use anyhow::{Context, Result};
use clap::Parser;
use sensorlink_client::{DataHandler, SensorLinkConfig};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "sensorlink-uploader", version, about = "Cache and upload sensor measurements")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SENSORLINK_CONFIG", default_value = "sensorlink.toml")]
    config: PathBuf,
}

#[derive(Debug, Deserialize)]
struct InputLine {
    topic: String,
    key: Value,
    value: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = SensorLinkConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    let mut handler = DataHandler::open(config)
        .await
        .context("Failed to open caches")?;
    if handler.status() == sensorlink_client::ServerStatus::Disabled {
        warn!("No sender configured; measurements are cached but not uploaded");
    } else {
        handler.start().context("Failed to start uploading")?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accepted: u64 = 0;
    let mut skipped: u64 = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("End of input");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InputLine>(&line) {
                    Ok(input) => match handler.add_measurement(&input.topic, input.key, input.value) {
                        Ok(()) => accepted += 1,
                        Err(e) => {
                            skipped += 1;
                            warn!(topic = %input.topic, error = %e, "Measurement rejected");
                        }
                    },
                    Err(e) => {
                        skipped += 1;
                        warn!(error = %e, "Skipping malformed input line");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    info!(accepted, skipped, status = %handler.status(), "Shutting down");
    handler.close().await.context("Failed to close caches")?;
    Ok(())
}
