use super::{
    classify_reqwest_error, drain_sse_data, truncated_stream_error, ChunkReceiver,
    ProviderBackend, ProviderRequest, ProviderResponse, StreamChunk, STREAM_CHANNEL_CAPACITY,
};
use crate::config::{ProviderConfig, ProviderKind};
use async_trait::async_trait;
use docsmith_core::{ProviderError, TokenUsage};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

/// OpenAI-compatible chat completions backend.
///
/// Works with OpenAI, OpenRouter, Groq, and any other provider that
/// implements the OpenAI chat completions API.
pub struct OpenAiBackend {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    /// Creates a backend for any OpenAI-compatible chat completions endpoint.
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url())
    }

    fn build_body(&self, request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });

        if stream {
            body["stream"] = serde_json::json!(true);
            // Only the first-party API is known to honour stream_options.
            if self.config.kind == ProviderKind::OpenAi {
                body["stream_options"] = serde_json::json!({ "include_usage": true });
            }
        }
        body
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header(
                "Authorization",
                format!("Bearer {}", self.config.credential.as_deref().unwrap_or_default()),
            )
            .header("Content-Type", "application/json");

        // OpenRouter asks integrators to identify themselves.
        if self.config.kind == ProviderKind::OpenRouter {
            request
                .header("HTTP-Referer", "https://github.com/docsmith/docsmith")
                .header("X-Title", "Docsmith")
        } else {
            request
        }
    }

    async fn send(
        &self,
        request: &ProviderRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = self.build_body(request, stream);
        let resp = self
            .add_provider_headers(self.http.post(self.url()))
            .json(&body)
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
impl ProviderBackend for OpenAiBackend {
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let resp = self.send(request, false).await?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::retryable(format!("undecodable response: {e}")))?;
        parse_openai_response(&body)
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
                    if data == "[DONE]" {
                        return;
                    }
                    let Ok(event) = serde_json::from_str::<serde_json::Value>(&data) else {
                        debug!(provider = %provider, "Skipping malformed stream event");
                        continue;
                    };
                    for chunk in parse_openai_stream_event(&event) {
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Consumer went away; stop reading.
                            return;
                        }
                    }
                }
            }
            let _ = tx.send(Err(truncated_stream_error())).await;
        });

        Ok(rx)
    }
}

fn parse_usage(usage: &serde_json::Value) -> Option<TokenUsage> {
    let prompt = usage["prompt_tokens"].as_u64()?;
    let completion = usage["completion_tokens"].as_u64()?;
    Some(TokenUsage::new(
        u32::try_from(prompt).unwrap_or(u32::MAX),
        u32::try_from(completion).unwrap_or(u32::MAX),
    ))
}

/// Extracts the first choice's message and usage from a chat completions response.
pub fn parse_openai_response(body: &serde_json::Value) -> Result<ProviderResponse, ProviderError> {
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| ProviderError::retryable("malformed response: missing message content"))?;
    Ok(ProviderResponse {
        content: content.to_string(),
        usage: parse_usage(&body["usage"]),
    })
}

fn parse_openai_stream_event(event: &serde_json::Value) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    if let Some(text) = event["choices"][0]["delta"]["content"].as_str() {
        if !text.is_empty() {
            chunks.push(StreamChunk::Text(text.to_string()));
        }
    }
    if let Some(usage) = parse_usage(&event["usage"]) {
        chunks.push(StreamChunk::Usage(usage));
    }
    chunks
}
