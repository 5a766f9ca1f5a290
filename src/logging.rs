//! # Structured Logging Module
//!
//! Environment-aware structured logging for the poller process, plus helpers that emit
//! the cycle and session lifecycle events in a consistent shape.

use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{ConfigManager, LogFormat, LoggingConfig};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let default_level = config
            .level
            .clone()
            .unwrap_or_else(|| get_log_level(&environment));
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        let result = match config.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_current_span(true)
                        .with_filter(filter),
                )
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .with_ansi(true)
                        .with_filter(filter),
                )
                .try_init(),
        };

        // An embedding process may already own the global subscriber
        if result.is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            format = ?config.format,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log a poll cycle lifecycle event
pub fn log_cycle_operation(operation: &str, cycle_id: &str, status: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        cycle_id = %cycle_id,
        status = %status,
        details = details,
        "🔄 CYCLE_OPERATION"
    );
}

/// Log a consumer session lifecycle event
pub fn log_session_operation(
    operation: &str,
    session: &str,
    status: &str,
    processed: Option<u64>,
    failed: Option<u64>,
) {
    tracing::info!(
        operation = %operation,
        session = %session,
        status = %status,
        processed = processed,
        failed = failed,
        "📬 SESSION_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_logs_at_info() {
        assert_eq!(get_log_level("production"), "info");
    }

    #[test]
    fn other_environments_log_at_debug() {
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig::default();
        init_structured_logging(&config);
        init_structured_logging(&config);
        assert!(LOGGER_INITIALIZED.get().is_some());
    }
}
