//! Global tracing subscriber installation.
//!
//! Events are written to stderr so stdout stays reserved for command output.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
    #[error("invalid log filter '{filter}': {error}")]
    Filter { filter: String, error: String },
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Builds the filter from `RUST_LOG`, falling back to the configured level.
pub fn build_filter(config: &AppConfig) -> Result<EnvFilter, TelemetryInitError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.log_level).map_err(|e| TelemetryInitError::Filter {
        filter: config.log_level.clone(),
        error: e.to_string(),
    })
}

/// Initialize global tracing exactly once, wiring `log::` macros into the tracing pipeline.
///
/// Returns `Ok(false)` when telemetry was already installed.
pub fn init_tracing(config: &AppConfig) -> Result<bool, TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(false);
    }

    let env_filter = match build_filter(config) {
        Ok(filter) => filter,
        Err(err) => {
            TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(err);
        }
    };

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        // Another LogTracer (tests, embedding host) is fine.
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: Failed to install log tracer bridge: {}. legacy `log::` macros will not emit structured tracing events.",
                err
            );
        }
    }

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().with_writer(std::io::stderr).boxed(),
        _ => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(err.into());
    }

    Ok(true)
}
