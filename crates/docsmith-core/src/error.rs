use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A convenience `Result` alias using [`GatewayError`].
pub type GatewayResult<T> = Result<T, GatewayError>;

/// A failure reported by a single provider attempt.
///
/// Backends classify every failure into one of two buckets. The invocation
/// engine only ever looks at the bucket, never at provider-specific details.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeout, rate limit, or transient server/network failure.
    #[error("retryable provider error: {0}")]
    Retryable(String),

    /// Invalid credential or a request the provider will never accept.
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Creates a retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// A per-attempt timeout.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Retryable(format!("attempt timed out after {timeout_ms}ms"))
    }

    /// Classifies a non-success HTTP status returned by a provider.
    ///
    /// 408, 429 and every 5xx are retryable; everything else (bad request,
    /// bad credential, unknown model) is fatal.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}: {}", truncate(body, 512));
        match status {
            408 | 429 | 500..=599 => Self::Retryable(message),
            _ => Self::Fatal(message),
        }
    }

    /// Whether the failure is worth another attempt on the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// The human-readable failure reason without the classification prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::Retryable(m) | Self::Fatal(m) => m,
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Why one provider in a fallback chain did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    /// Provider id as configured.
    pub provider: String,
    /// Number of invocation attempts made (0 when the provider was skipped).
    pub attempts: u32,
    /// The last failure reason observed for this provider.
    pub reason: String,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} attempt(s)): {}",
            self.provider, self.attempts, self.reason
        )
    }
}

fn summarize(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no providers in chain".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that cross the gateway boundary.
///
/// Provider-level failures are classified and absorbed internally; callers see
/// exhaustion, configuration problems, cancellation, and conversation errors.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration references a provider id with no matching entry.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Every provider in the fallback chain failed.
    #[error("All providers exhausted: {}", summarize(.failures))]
    AllProvidersExhausted {
        /// One entry per provider in chain order.
        failures: Vec<ProviderFailure>,
    },

    /// A stream failed after it had started delivering output.
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// No provider in the chain has a configured credential.
    #[error("No provider available")]
    NoProviderAvailable,

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid gateway or provider configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Conversation history could not be imported or forked.
    #[error("Session error: {0}")]
    Session(String),

    /// The response cache backend failed.
    #[error("Cache error: {0}")]
    Cache(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether the calling layer should continue with un-enhanced content.
    ///
    /// Every error surfaced by a call or stream means the same thing to the
    /// document generator: enhancement is unavailable for this request.
    /// Configuration and conversation errors are programming or deployment
    /// mistakes and are reported as such.
    pub fn is_enhancement_unavailable(&self) -> bool {
        matches!(
            self,
            Self::AllProvidersExhausted { .. }
                | Self::StreamInterrupted(_)
                | Self::NoProviderAvailable
                | Self::Cancelled
        )
    }
}
