use crate::backends::{ProviderRequest, ProviderResponse};
use crate::cache::{key_for, CacheEntry, ResponseCache};
use crate::config::{GatewayConfig, ProviderConfig};
use crate::events::{EventSink, GatewayEvent};
use crate::registry::ProviderRegistry;
use crate::tokens::{adaptive_max_tokens, estimate_usage};
use docsmith_core::{
    ConversationMessage, GatewayError, GatewayResult, ProviderError, ProviderFailure, TokenUsage,
};
use docsmith_session::Conversation;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Output budget used by [`InvocationEngine::is_functional`] probes.
const PROBE_MAX_TOKENS: usize = 8;
const PROBE_PROMPT: &str = "Reply with the single word: ok";

/// Retry behaviour applied to each provider in a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per provider, including the first one.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Delay before the retry that follows attempt `attempt` (zero-based):
/// `base * 2^attempt`, capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// Per-call overrides. Every field falls back to configuration when unset.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Start the fallback chain here instead of at the primary provider.
    pub provider: Option<String>,
    /// Upper bound on output tokens; the adaptive budget may lower it further.
    pub max_tokens: Option<usize>,
    /// Sampling temperature for this call only.
    pub temperature: Option<f32>,
    /// Prior turns sent ahead of the prompt.
    pub history: Option<Conversation>,
}

impl CallOptions {
    /// Starts the chain at `provider`.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Caps the output budget.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Overrides the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sends `history` ahead of the prompt.
    pub fn with_history(mut self, history: Conversation) -> Self {
        self.history = Some(history);
        self
    }

    /// Messages sent to the provider: history (if any), then the prompt.
    pub(crate) fn request_messages(&self, prompt: &str) -> Vec<ConversationMessage> {
        let mut messages = self
            .history
            .as_ref()
            .map(Conversation::snapshot)
            .unwrap_or_default();
        messages.push(ConversationMessage::user(prompt));
        messages
    }

    /// Text the cache key is derived from.
    fn cache_text(&self, prompt: &str) -> String {
        match &self.history {
            Some(history) => format!("{}\nuser: {prompt}", history.transcript()),
            None => prompt.to_string(),
        }
    }

    /// The provider the fallback chain starts from.
    pub(crate) fn chain_head<'a>(&'a self, gateway: &'a GatewayConfig) -> &'a str {
        self.provider
            .as_deref()
            .unwrap_or(&gateway.primary_provider)
    }
}

/// Result of a successful call or stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text.
    pub content: String,
    /// Reported usage, or an estimate when the provider sent none.
    pub usage: TokenUsage,
    /// Provider id that produced the content.
    pub provider: String,
    /// Model that produced the content.
    pub model: String,
    /// Whether the content was served from the response cache.
    pub cached: bool,
}

/// Builds the request for one provider, sizing the output budget to the
/// provider's context window.
pub(crate) fn build_request(
    gateway: &GatewayConfig,
    config: &ProviderConfig,
    messages: Vec<ConversationMessage>,
    options: &CallOptions,
) -> ProviderRequest {
    let mut request = ProviderRequest {
        model: config.model.clone(),
        messages,
        max_tokens: 0,
        temperature: options
            .temperature
            .or(config.temperature)
            .unwrap_or(gateway.temperature),
    };
    let requested = options.max_tokens.unwrap_or(gateway.default_max_tokens);
    request.max_tokens =
        requested.min(adaptive_max_tokens(&request.input_text(), config.max_context_tokens));
    request
}

/// Runs `op` against one provider until it succeeds, fails fatally, or runs
/// out of attempts.
///
/// Every attempt is bounded by `config.timeout_ms`; a timeout counts as a
/// retryable failure. On success returns the value and the number of attempts
/// used.
pub(crate) async fn attempt_with_retries<T, F, Fut>(
    config: &ProviderConfig,
    policy: &RetryPolicy,
    events: &dyn EventSink,
    mut op: F,
) -> Result<(T, u32), ProviderFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let timeout = Duration::from_millis(config.timeout_ms);
    let mut last_error = ProviderError::retryable("no attempt made");
    let mut attempts = 0;

    for attempt in 0..policy.max_attempts {
        attempts = attempt + 1;
        let outcome = match tokio::time::timeout(timeout, op()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::timeout(config.timeout_ms)),
        };

        let err = match outcome {
            Ok(value) => return Ok((value, attempts)),
            Err(err) => err,
        };

        events.record(&GatewayEvent::AttemptFailed {
            provider: config.id.clone(),
            attempt: attempts,
            retryable: err.is_retryable(),
            error: err.reason().to_string(),
        });

        if !err.is_retryable() {
            last_error = err;
            break;
        }
        if attempts < policy.max_attempts {
            let delay = compute_backoff(policy, attempt);
            debug!(
                provider = %config.id,
                attempt = attempts,
                delay_ms = delay,
                "Retryable error, backing off"
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        last_error = err;
    }

    Err(ProviderFailure {
        provider: config.id.clone(),
        attempts,
        reason: last_error.reason().to_string(),
    })
}

/// Why a provider in the chain cannot be tried at all, if it cannot.
pub(crate) fn unusable_reason(registry: &ProviderRegistry, id: &str) -> Option<&'static str> {
    if !registry.is_provider_available(id) {
        return Some("no credential configured");
    }
    match registry.backend_for(id) {
        Err(_) => Some("no backend installed"),
        Ok(backend) if !backend.is_available() => Some("backend unavailable"),
        Ok(_) => None,
    }
}

/// Request/response path with caching, retries and provider fallback.
pub struct InvocationEngine {
    registry: Arc<ProviderRegistry>,
    cache: Arc<dyn ResponseCache>,
    events: Arc<dyn EventSink>,
}

impl InvocationEngine {
    /// Creates an engine over `registry` that caches into `cache`.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Arc<dyn ResponseCache>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            cache,
            events,
        }
    }

    /// The provider registry calls are routed through.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Executes `prompt`, consulting the cache first when `use_cache` is set.
    ///
    /// With `use_cache == false` the cache is neither read nor written.
    pub async fn call(
        &self,
        prompt: &str,
        use_cache: bool,
        options: CallOptions,
    ) -> GatewayResult<Completion> {
        self.execute(prompt, use_cache, &options, None).await
    }

    /// Like [`call`](Self::call), but gives up with [`GatewayError::Cancelled`]
    /// once `cancel` fires. A cancelled call never writes the cache.
    pub async fn call_cancellable(
        &self,
        prompt: &str,
        use_cache: bool,
        options: CallOptions,
        cancel: &CancellationToken,
    ) -> GatewayResult<Completion> {
        self.execute(prompt, use_cache, &options, Some(cancel)).await
    }

    /// Whether the gateway can currently produce completions.
    ///
    /// Returns `false` without any network traffic when no provider has a
    /// credential; otherwise makes one small uncached call.
    pub async fn is_functional(&self) -> bool {
        if !self.registry.any_available() {
            return false;
        }
        let options = CallOptions::default().with_max_tokens(PROBE_MAX_TOKENS);
        match self.call(PROBE_PROMPT, false, options).await {
            Ok(_) => true,
            Err(e) => {
                info!(error = %e, "Gateway probe failed");
                false
            }
        }
    }

    /// Drops every cached response.
    pub async fn clear_cache(&self) -> GatewayResult<()> {
        self.cache.clear().await
    }

    async fn execute(
        &self,
        prompt: &str,
        use_cache: bool,
        options: &CallOptions,
        cancel: Option<&CancellationToken>,
    ) -> GatewayResult<Completion> {
        let gateway = self.registry.gateway_config();
        let head = options.chain_head(gateway);
        let head_config = self.registry.config_for(head)?;

        let key = use_cache.then(|| key_for(&head_config.model, &options.cache_text(prompt)));
        if let Some(key) = &key {
            if let Some(hit) = self.lookup(key, head).await {
                return Ok(hit);
            }
        }

        let messages = options.request_messages(prompt);
        let walk = self.walk_chain(head, messages, options);
        let completion = match cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => return Err(GatewayError::Cancelled),
                result = walk => result?,
            },
            None => walk.await?,
        };

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(GatewayError::Cancelled);
        }
        if let Some(key) = key {
            self.store(&key, &completion).await;
        }
        Ok(completion)
    }

    async fn lookup(&self, key: &str, head: &str) -> Option<Completion> {
        match self.cache.get(key).await {
            Ok(Some(entry)) => {
                self.events.record(&GatewayEvent::CacheHit {
                    key: key.to_string(),
                });
                let model = self
                    .registry
                    .config_for(head)
                    .map(|c| c.model.clone())
                    .unwrap_or_default();
                Some(Completion {
                    content: entry.content,
                    usage: entry.usage,
                    provider: head.to_string(),
                    model,
                    cached: true,
                })
            }
            Ok(None) => {
                self.events.record(&GatewayEvent::CacheMiss {
                    key: key.to_string(),
                });
                None
            }
            Err(e) => {
                self.events.record(&GatewayEvent::CacheError {
                    key: key.to_string(),
                    error: e.to_string(),
                });
                None
            }
        }
    }

    async fn store(&self, key: &str, completion: &Completion) {
        let entry = CacheEntry::new(key, completion.content.clone(), completion.usage);
        if let Err(e) = self.cache.set(key, entry).await {
            self.events.record(&GatewayEvent::CacheError {
                key: key.to_string(),
                error: e.to_string(),
            });
        }
    }

    async fn walk_chain(
        &self,
        head: &str,
        messages: Vec<ConversationMessage>,
        options: &CallOptions,
    ) -> GatewayResult<Completion> {
        let gateway = self.registry.gateway_config();
        let mut failures = Vec::new();
        let mut previous: Option<String> = None;

        for provider_id in self.registry.fallback_chain(head) {
            if let Some(reason) = unusable_reason(&self.registry, &provider_id) {
                self.events.record(&GatewayEvent::ProviderSkipped {
                    provider: provider_id.clone(),
                    reason: reason.to_string(),
                });
                failures.push(ProviderFailure {
                    provider: provider_id,
                    attempts: 0,
                    reason: reason.to_string(),
                });
                continue;
            }
            let config = self.registry.config_for(&provider_id)?;
            let backend = self.registry.backend_for(&provider_id)?;

            if let Some(from) = previous.replace(provider_id.clone()) {
                self.events.record(&GatewayEvent::ProviderSwitched {
                    from,
                    to: provider_id.clone(),
                });
            }

            let request = build_request(gateway, config, messages.clone(), options);
            let outcome = attempt_with_retries(
                config,
                &gateway.retry_policy,
                self.events.as_ref(),
                || backend.invoke(&request),
            )
            .await;

            match outcome {
                Ok((response, attempts)) => {
                    let completion = into_completion(config, &request, response);
                    self.events.record(&GatewayEvent::CallSucceeded {
                        provider: provider_id,
                        attempts,
                        usage: completion.usage,
                    });
                    return Ok(completion);
                }
                Err(failure) => failures.push(failure),
            }
        }

        Err(GatewayError::AllProvidersExhausted { failures })
    }
}

fn into_completion(
    config: &ProviderConfig,
    request: &ProviderRequest,
    response: ProviderResponse,
) -> Completion {
    let usage = response
        .usage
        .unwrap_or_else(|| estimate_usage(&request.input_text(), &response.content));
    Completion {
        content: response.content,
        usage,
        provider: config.id.clone(),
        model: config.model.clone(),
        cached: false,
    }
}
