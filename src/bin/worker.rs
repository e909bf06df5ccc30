//! Conveyor worker shell.
//!
//! Wires the ambient configuration, a shared store connection, and one
//! consumer with a logging handler, then runs until SIGINT/SIGTERM. On
//! shutdown the consumer is drained before the store is disconnected.
//!
//! Environment:
//! - `CONVEYOR_ENV`: selects `.env.production` or `.env.development`
//! - `STORE_*`: backing store connection (see `conveyor::config`)
//! - `WORK_STREAM`: stream to consume (default: "jobs")
//! - `LOG_*`: logging sinks and levels

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use conveyor::config::{self, LogConfig, Profile};
use conveyor::{Consumer, ConsumerOptions, LogHandler, SharedStore, ShutdownSignal};

const DEFAULT_STREAM: &str = "jobs";

#[tokio::main]
async fn main() -> ExitCode {
    let profile = Profile::from_env();
    config::load_env(profile);

    let _telemetry = conveyor::telemetry::init(&LogConfig::from_env());

    match run().await {
        Ok(()) => {
            info!("Worker shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Worker setup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let stream = env::var("WORK_STREAM").unwrap_or_else(|_| DEFAULT_STREAM.to_string());

    let shared = SharedStore::new();
    shared.connect(None).await?;

    let store = shared
        .store()
        .await
        .expect("store client exists after connect");

    let consumer = Consumer::new(
        store,
        &stream,
        Arc::new(LogHandler::new()),
        ConsumerOptions::default(),
    )?;
    consumer.start().await?;

    info!(
        stream = %consumer.stream(),
        group = %consumer.group_name(),
        consumer = %consumer.consumer_name(),
        "Worker listening for jobs"
    );

    let shutdown = ShutdownSignal::new();
    shutdown.wait().await;

    consumer.stop().await;
    shared.disconnect().await;
    Ok(())
}
