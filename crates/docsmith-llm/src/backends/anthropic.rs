use super::{
    classify_reqwest_error, drain_sse_data, truncated_stream_error, ChunkReceiver,
    ProviderBackend, ProviderRequest, ProviderResponse, StreamChunk, STREAM_CHANNEL_CAPACITY,
};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use docsmith_core::{ProviderError, Role, TokenUsage};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic messages API backend.
pub struct AnthropicBackend {
    config: ProviderConfig,
    http: reqwest::Client,
}

// -- Anthropic wire types --

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl AnthropicBackend {
    /// Creates a backend for the Messages API described by `config`.
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn build_body(&self, request: &ProviderRequest, stream: bool) -> serde_json::Value {
        // System text travels in its own field, not in the message list.
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let messages: Vec<AnthropicMessage<'_>> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| AnthropicMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });

        if !system.is_empty() {
            body["system"] = serde_json::json!(system.join("\n\n"));
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    async fn send(
        &self,
        request: &ProviderRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.config.base_url());
        let resp = self
            .http
            .post(&url)
            .header("x-api-key", self.config.credential.as_deref().unwrap_or_default())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&self.build_body(request, stream))
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let error_body = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::from_status(status.as_u16(), &error_body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ProviderBackend for AnthropicBackend {
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let resp = self.send(request, false).await?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::retryable(format!("undecodable response: {e}")))?;
        parse_anthropic_response(&body)
    }

    async fn stream_invoke(
        &self,
        request: &ProviderRequest,
    ) -> Result<ChunkReceiver, ProviderError> {
        let resp = self.send(request, true).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let provider = self.config.id.clone();

        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut input_tokens: Option<u32> = None;
            let mut output_tokens: Option<u32> = None;

            while let Some(chunk_result) = stream.next().await {
                let bytes = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::retryable(format!(
                                "stream read error: {e}"
                            ))))
                            .await;
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);

                for data in drain_sse_data(&mut buffer) {
                    let Ok(event) = serde_json::from_str::<serde_json::Value>(&data) else {
                        debug!(provider = %provider, "Skipping malformed stream event");
                        continue;
                    };

                    match event["type"].as_str().unwrap_or("") {
                        "message_start" => {
                            input_tokens = as_u32(&event["message"]["usage"]["input_tokens"]);
                        }
                        "content_block_delta" => {
                            let delta = &event["delta"];
                            if delta["type"].as_str() == Some("text_delta") {
                                if let Some(text) = delta["text"].as_str() {
                                    if !text.is_empty()
                                        && tx.send(Ok(StreamChunk::Text(text.to_string()))).await.is_err()
                                    {
                                        return;
                                    }
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(n) = as_u32(&event["usage"]["output_tokens"]) {
                                output_tokens = Some(n);
                            }
                        }
                        "error" => {
                            let message = event["error"]["message"]
                                .as_str()
                                .unwrap_or("unknown stream error")
                                .to_string();
                            let _ = tx.send(Err(ProviderError::retryable(message))).await;
                            return;
                        }
                        "message_stop" => {
                            if let (Some(input), Some(output)) = (input_tokens, output_tokens) {
                                let _ = tx
                                    .send(Ok(StreamChunk::Usage(TokenUsage::new(input, output))))
                                    .await;
                            }
                            return;
                        }
                        _ => {}
                    }
                }
            }
            let _ = tx.send(Err(truncated_stream_error())).await;
        });

        Ok(rx)
    }
}

fn as_u32(value: &serde_json::Value) -> Option<u32> {
    value.as_u64().map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

/// Extracts the concatenated text blocks and usage from a Messages API response.
pub fn parse_anthropic_response(
    body: &serde_json::Value,
) -> Result<ProviderResponse, ProviderError> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| ProviderError::retryable("malformed response: missing content blocks"))?;

    let text = blocks
        .iter()
        .filter(|b| b["type"].as_str() == Some("text"))
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let usage = match (
        as_u32(&body["usage"]["input_tokens"]),
        as_u32(&body["usage"]["output_tokens"]),
    ) {
        (Some(input), Some(output)) => Some(TokenUsage::new(input, output)),
        _ => None,
    };

    Ok(ProviderResponse {
        content: text,
        usage,
    })
}
