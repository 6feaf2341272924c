//! Tracing subscriber setup

use crate::config::LogConfig;
use crate::error::{CliError, CliResult};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Filter for a directive, falling back to `info` when it does not parse
#[must_use]
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn output_layer(config: &LogConfig) -> CliResult<BoxedLayer> {
    let layer: BoxedLayer = match (&config.diag, config.json) {
        (Some(path), json) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let writer = Mutex::new(file);
            if json {
                Box::new(fmt::layer().json().with_writer(writer).with_ansi(false))
            } else {
                Box::new(fmt::layer().with_writer(writer).with_ansi(false))
            }
        }
        (None, true) => Box::new(fmt::layer().json().with_writer(std::io::stderr)),
        (None, false) => Box::new(fmt::layer().with_writer(std::io::stderr).with_target(false)),
    };
    Ok(layer)
}

/// Install the global subscriber
pub fn init_logging(config: &LogConfig) -> CliResult<()> {
    tracing_subscriber::registry()
        .with(output_layer(config)?)
        .with(env_filter(&config.level))
        .try_init()
        .map_err(|e| CliError::logging(e.to_string()))
}
