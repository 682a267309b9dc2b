//! Error reporting
//!
//! Sync failures are handed to an [`ErrorReporter`] so a crash-reporting
//! backend can be plugged in. Reporting must never affect sync itself, so
//! reporter failures are logged and dropped.

use crate::error::{SyncError, SyncResult};
use logger_redacted::{PiiRedactor, RedactionConfig};
use std::collections::BTreeMap;

/// Where an error happened
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub operation: String,
    pub attributes: BTreeMap<String, String>,
}

impl ReportContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(key.into(), value.to_string());
        self
    }
}

pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &SyncError, context: &ReportContext) -> SyncResult<()>;
}

/// Report `error`, swallowing any failure of the reporter itself
pub fn report_error(reporter: &dyn ErrorReporter, error: &SyncError, context: &ReportContext) {
    if let Err(e) = reporter.report(error, context) {
        tracing::warn!(
            operation = %context.operation,
            error = %e,
            "Error reporter failed"
        );
    }
}

/// Logs errors through `tracing` after PII redaction
pub struct TracingReporter {
    redactor: PiiRedactor,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self {
            redactor: PiiRedactor::new(RedactionConfig::default()),
        }
    }

    pub fn redact(&self, text: &str) -> String {
        self.redactor.redact(text)
    }
}

impl Default for TracingReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &SyncError, context: &ReportContext) -> SyncResult<()> {
        let attributes = context
            .attributes
            .iter()
            .map(|(k, v)| format!("{}={}", k, self.redactor.redact(v)))
            .collect::<Vec<_>>()
            .join(" ");

        tracing::error!(
            operation = %context.operation,
            transient = error.is_transient(),
            attributes = %attributes,
            error = %self.redactor.redact(&error.to_string()),
            "Sync error reported"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FailingReporter {
        calls: Mutex<u32>,
    }

    impl ErrorReporter for FailingReporter {
        fn report(&self, _error: &SyncError, _context: &ReportContext) -> SyncResult<()> {
            *self.calls.lock() += 1;
            Err(SyncError::Internal("backend down".to_string()))
        }
    }

    #[test]
    fn test_reporter_failure_is_swallowed() {
        let reporter = FailingReporter { calls: Mutex::new(0) };
        report_error(
            &reporter,
            &SyncError::Offline,
            &ReportContext::new("sync").with("attempt", 1),
        );
        assert_eq!(*reporter.calls.lock(), 1);
    }

    #[test]
    fn test_tracing_reporter_redacts() {
        let reporter = TracingReporter::new();
        let redacted = reporter.redact("patient contact jane.roe@example.com");
        assert!(!redacted.contains("jane.roe@example.com"));

        let error = SyncError::Network("timeout".to_string());
        reporter.report(&error, &ReportContext::new("replay")).unwrap();
    }
}
