//! Logging initialization for conveyor processes.
//!
//! Builds a tracing registry with two sinks: a console layer and a
//! non-blocking file layer, each filtered at its own level from
//! [`LogConfig`]. A `RUST_LOG` directive, when set, overrides the console
//! filter.
//!
//! The returned [`TelemetryGuard`] must be held for the lifetime of the
//! process; dropping it flushes and detaches the file writer.

use std::fs::OpenOptions;

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LogConfig;

/// Keeps the non-blocking log writers alive.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize global logging from the given configuration.
///
/// Safe to call more than once; subsequent calls leave the existing
/// subscriber in place.
pub fn init(config: &LogConfig) -> TelemetryGuard {
    let console_level = effective(config.level, config.console_level);
    let file_level = effective(config.level, config.file_level);

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(Box::new(
        tracing_subscriber::fmt::layer().with_filter(console_filter),
    ));

    let mut file_setup_error = None;
    match OpenOptions::new().create(true).append(true).open(&config.file) {
        Ok(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            guards.push(guard);
            layers.push(Box::new(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(LevelFilter::from_level(file_level)),
            ));
        }
        Err(err) => {
            file_setup_error = Some(format!("log file init failed for {}: {err}", config.file));
        }
    }

    let _ = Registry::default().with(layers).try_init();

    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

/// The more restrictive of the overall floor and a sink's own level.
fn effective(floor: Level, sink: Level) -> Level {
    floor.min(sink)
}
