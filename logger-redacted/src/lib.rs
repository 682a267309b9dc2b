//! Logging with automatic PII/PHI redaction
//!
//! Sets up the `tracing` subscriber used by rxsync binaries and provides the
//! redactor that scrubs e-mail addresses, phone numbers, SSNs, card numbers,
//! IP addresses and medical record numbers from messages before they are
//! written. Redacted values can be replaced by short hashes so that log lines
//! about the same value still correlate.
//!
//! # Example
//!
//! ```no_run
//! use logger_redacted::{init, redacted_info, LoggerConfig};
//!
//! init(&LoggerConfig::default()).unwrap();
//! redacted_info!("Prescription sent to jane.roe@example.com", record = "rx-1");
//! ```

pub mod config;
pub mod macros;
pub mod redactor;

pub use config::*;
pub use redactor::*;

#[doc(hidden)]
pub use tracing as __tracing;

use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

lazy_static! {
    static ref GLOBAL_REDACTOR: PiiRedactor = PiiRedactor::default();
}

static REDACTION_ENABLED: AtomicBool = AtomicBool::new(true);

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Invalid log filter '{filter}': {message}")]
    Filter { filter: String, message: String },

    #[error("Logger initialization failed: {0}")]
    Init(String),
}

/// Redact `text` with the default rules, unless redaction was disabled at init
pub fn redact(text: &str) -> String {
    if REDACTION_ENABLED.load(Ordering::Relaxed) {
        GLOBAL_REDACTOR.redact(text)
    } else {
        text.to_string()
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `config.log_level`.
pub fn init(config: &LoggerConfig) -> Result<(), LoggerError> {
    REDACTION_ENABLED.store(config.redaction_enabled, Ordering::Relaxed);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| LoggerError::Filter {
            filter: config.log_level.clone(),
            message: e.to_string(),
        })?,
    };

    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init(),
    };

    result.map_err(|e| LoggerError::Init(e.to_string()))
}
