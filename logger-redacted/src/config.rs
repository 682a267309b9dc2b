// Logger configuration
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, for terminals
    Pretty,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub redaction_enabled: bool,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_level: String,
    pub format: LogFormat,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            redaction_enabled: true,
            log_level: "info,sqlx=warn,reqwest=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LoggerConfig {
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.log_level = "debug,sqlx=warn".to_string();
        }
        self
    }
}
