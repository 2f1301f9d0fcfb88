/// Anthropic Messages API.
pub mod anthropic;
/// OpenAI-compatible chat completions (OpenAI, OpenRouter, Groq).
pub mod openai;

use crate::config::{ProviderConfig, ProviderKind};
use async_trait::async_trait;
use docsmith_core::{ConversationMessage, ProviderError, TokenUsage};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Channel capacity between a streaming backend task and its consumer.
pub const STREAM_CHANNEL_CAPACITY: usize = 256;

/// A provider-neutral request: one call's worth of messages and limits.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    /// Provider-specific model identifier.
    pub model: String,
    /// Full history, oldest first. System messages are passed through; each
    /// backend maps them onto its own wire format.
    pub messages: Vec<ConversationMessage>,
    /// Output budget, already clamped to the provider's context window.
    pub max_tokens: usize,
    /// Sampling temperature after per-call and per-provider overrides.
    pub temperature: f32,
}

impl ProviderRequest {
    /// Concatenated message text, used for input-size estimates.
    pub fn input_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A complete, non-streamed response.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    /// Generated text.
    pub content: String,
    /// `None` when the provider did not report usage.
    pub usage: Option<TokenUsage>,
}

/// One item delivered by a streaming backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// An increment of generated text.
    Text(String),
    /// Usage reported by the provider, usually at the end of the stream.
    Usage(TokenUsage),
}

/// Receiving end of a provider stream.
///
/// The stream is complete when the channel closes. An `Err` item means the
/// stream broke and no further items will follow; HTTP backends send one when
/// the connection ends before the provider's end-of-stream marker.
pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, ProviderError>>;

/// Uniform capability implemented once per provider variant.
///
/// Backends classify every failure as [`ProviderError::Retryable`] or
/// [`ProviderError::Fatal`]; retry, fallback and timeouts are handled by the
/// caller, so implementations make exactly one attempt per call.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Non-streaming completion.
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Streaming completion. Returns once the provider has accepted the
    /// request; increments then arrive on the receiver.
    async fn stream_invoke(&self, request: &ProviderRequest)
        -> Result<ChunkReceiver, ProviderError>;

    /// Whether the backend can currently be used at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// Builds the HTTP backend matching `config.kind`.
pub fn build_backend(config: &ProviderConfig) -> Arc<dyn ProviderBackend> {
    match config.kind {
        ProviderKind::Anthropic => Arc::new(anthropic::AnthropicBackend::new(config.clone())),
        ProviderKind::OpenAi | ProviderKind::OpenRouter | ProviderKind::Groq => {
            Arc::new(openai::OpenAiBackend::new(config.clone()))
        }
    }
}

/// Maps a transport-level `reqwest` failure onto the retry taxonomy.
pub(crate) fn classify_reqwest_error(err: &reqwest::Error) -> ProviderError {
    if let Some(status) = err.status() {
        return ProviderError::from_status(status.as_u16(), &err.to_string());
    }
    if err.is_builder() {
        return ProviderError::fatal(format!("invalid request: {err}"));
    }
    // Timeouts, connection failures and truncated bodies are all transient.
    ProviderError::retryable(err.to_string())
}

/// Splits buffered server-sent-event bytes into complete `data:` payloads.
///
/// Only `\n`-terminated lines are decoded, so a multi-byte character split
/// across two network reads stays intact. Consumed lines are removed from
/// `buffer`; a trailing partial line stays for the next read.
pub(crate) fn drain_sse_data(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(line_end) = buffer.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=line_end).collect();
        let decoded = String::from_utf8_lossy(&raw);
        let line = decoded.trim();

        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            payloads.push(data.trim_start().to_string());
        }
    }
    payloads
}

/// Error sent when a provider stream closes without its end-of-stream marker.
pub(crate) fn truncated_stream_error() -> ProviderError {
    ProviderError::retryable("stream ended before completion marker")
}
