//! Process-wide `tracing` subscriber setup.
//!
//! The gateway itself only emits `tracing` events; installing a subscriber is
//! left to the embedding application, which can call [`init_logging`] once at
//! startup. The filter honours `RUST_LOG` and falls back to `info`.

use crate::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber.
///
/// Fails with [`GatewayError::Config`] if a global subscriber is already set,
/// so tests and embedding applications can call it without panicking.
pub fn init_logging(format: LogFormat) -> GatewayResult<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(default_filter());
    let result = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| GatewayError::Config(format!("failed to install log subscriber: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_error() {
        // The first call installs the subscriber unless something already did.
        let _ = init_logging(LogFormat::Json);
        let second = init_logging(LogFormat::Pretty);
        assert!(matches!(second, Err(GatewayError::Config(_))));
    }

    #[test]
    fn format_deserializes_lowercase() {
        let fmt: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(fmt, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}
