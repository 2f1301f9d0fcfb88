//! Structured diagnostics emitted by the gateway.
//!
//! Sinks are fire-and-forget: recording an event never fails and never
//! changes what the engine does next.

use docsmith_core::TokenUsage;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Something worth recording happened during a call or stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A cached response was served.
    CacheHit {
        key: String,
    },
    /// No cached response existed for the key.
    CacheMiss {
        key: String,
    },
    /// The cache backend failed; the call continues as a miss.
    CacheError {
        key: String,
        error: String,
    },
    /// A provider in the chain was not tried.
    ProviderSkipped {
        provider: String,
        reason: String,
    },
    /// One attempt against a provider failed.
    AttemptFailed {
        provider: String,
        attempt: u32,
        retryable: bool,
        error: String,
    },
    /// The chain moved on from one provider to the next.
    ProviderSwitched {
        from: String,
        to: String,
    },
    /// A request/response call produced content.
    CallSucceeded {
        provider: String,
        attempts: u32,
        usage: TokenUsage,
    },
    /// A provider accepted a streaming request.
    StreamStarted {
        provider: String,
    },
    /// A stream ran to its end-of-stream marker.
    StreamCompleted {
        provider: String,
        usage: TokenUsage,
    },
    /// A stream failed to open or broke part-way.
    StreamInterrupted {
        provider: String,
        error: String,
    },
    /// The caller cancelled a stream.
    StreamCancelled {
        provider: String,
    },
}

/// Receives gateway events.
pub trait EventSink: Send + Sync {
    /// Records one event. Must not block for long.
    fn record(&self, event: &GatewayEvent);
}

/// Default sink: one structured `tracing` event per gateway event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::CacheHit { key } => debug!(key = %key, "Cache hit"),
            GatewayEvent::CacheMiss { key } => debug!(key = %key, "Cache miss"),
            GatewayEvent::CacheError { key, error } => {
                warn!(key = %key, error = %error, "Cache error, treating as miss");
            }
            GatewayEvent::ProviderSkipped { provider, reason } => {
                info!(provider = %provider, reason = %reason, "Provider skipped");
            }
            GatewayEvent::AttemptFailed {
                provider,
                attempt,
                retryable,
                error,
            } => warn!(
                provider = %provider,
                attempt,
                retryable,
                error = %error,
                "Provider attempt failed"
            ),
            GatewayEvent::ProviderSwitched { from, to } => {
                warn!(from = %from, to = %to, "Falling back to next provider");
            }
            GatewayEvent::CallSucceeded {
                provider,
                attempts,
                usage,
            } => info!(
                provider = %provider,
                attempts,
                total_tokens = usage.total_tokens,
                "Call succeeded"
            ),
            GatewayEvent::StreamStarted { provider } => {
                info!(provider = %provider, "Stream started");
            }
            GatewayEvent::StreamCompleted { provider, usage } => info!(
                provider = %provider,
                total_tokens = usage.total_tokens,
                "Stream completed"
            ),
            GatewayEvent::StreamInterrupted { provider, error } => {
                warn!(provider = %provider, error = %error, "Stream interrupted");
            }
            GatewayEvent::StreamCancelled { provider } => {
                info!(provider = %provider, "Stream cancelled");
            }
        }
    }
}

/// Keeps every event in memory, for diagnostics pages and tests.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<GatewayEvent>>,
}

impl RecordingEventSink {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far, oldest first.
    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, event: &GatewayEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
