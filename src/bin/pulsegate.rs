//! Replay recorded bus messages through the normalization pipeline.
//!
//! ```text
//! pulsegate <config.yaml> --push-message <file> [--display-only] [--archive-dir <dir>]
//! ```
//!
//! The message family is inferred from the payload, the file is run
//! through the matching dispatcher, and every canonical request comes
//! out as one JSON line on stdout (or only in the log with
//! `--display-only`). With `--archive-dir` the raw payload behind each
//! request is additionally written under that folder, one file per
//! request. Live consumption is not wired here; embed the library
//! behind a `DeliverySource` for that.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;

use pulsegate::{
    JsonFileArchive, LoggingSink, PulsegateConfig, RequestSink, SinkError, TestRequest,
    assemble_with_http, replay_file,
};

struct Args {
    config: PathBuf,
    message: PathBuf,
    display_only: bool,
    archive_dir: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config = None;
    let mut message = None;
    let mut display_only = false;
    let mut archive_dir = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--push-message" => {
                let value = args
                    .next()
                    .context("--push-message needs a message file argument")?;
                message = Some(PathBuf::from(value));
            }
            "--archive-dir" => {
                let value = args
                    .next()
                    .context("--archive-dir needs a folder argument")?;
                archive_dir = Some(PathBuf::from(value));
            }
            "--display-only" => display_only = true,
            other if other.starts_with("--") => bail!("unknown flag: {other}"),
            other => {
                if config.is_some() {
                    bail!("unexpected extra argument: {other}");
                }
                config = Some(PathBuf::from(other));
            }
        }
    }

    Ok(Args {
        config: config.context("a configuration file has to be passed as first argument")?,
        message: message.context("--push-message <file> is required")?,
        display_only,
        archive_dir,
    })
}

/// Prints each canonical request as one JSON line.
struct StdoutSink;

#[async_trait]
impl RequestSink for StdoutSink {
    async fn submit(&self, request: TestRequest) -> Result<(), SinkError> {
        let line = serde_json::to_string(&request).map_err(|err| SinkError(err.to_string()))?;
        println!("{line}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .json()
        .init();

    let config = PulsegateConfig::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    let sink: Arc<dyn RequestSink> = if args.display_only {
        Arc::new(LoggingSink)
    } else {
        Arc::new(StdoutSink)
    };

    let mut dispatchers = assemble_with_http(&config, sink);
    if let Some(dir) = args.archive_dir {
        dispatchers = dispatchers.with_archive(Arc::new(JsonFileArchive::new(dir)));
    }
    let disposition = replay_file(&dispatchers, &args.message)
        .await
        .with_context(|| format!("failed to replay {}", args.message.display()))?;

    tracing::info!("Replay finished with disposition {:?}", disposition);
    Ok(())
}
