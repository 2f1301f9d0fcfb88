use crate::cache::{InMemoryResponseCache, ResponseCache};
use crate::config::GatewaySettings;
use crate::engine::{CallOptions, Completion, InvocationEngine};
use crate::events::{EventSink, TracingEventSink};
use crate::registry::ProviderRegistry;
use crate::stream::{StreamCallbacks, StreamingDispatcher};
use docsmith_core::GatewayResult;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Entry point for document-enhancement callers.
///
/// Cheap to share: wrap it in an `Arc` and call it from as many tasks as
/// needed. Any error it returns means "enhancement unavailable"; see
/// [`GatewayError::is_enhancement_unavailable`](docsmith_core::GatewayError::is_enhancement_unavailable).
pub struct Gateway {
    engine: InvocationEngine,
    dispatcher: StreamingDispatcher,
}

impl Gateway {
    /// Assembles a gateway from already-built parts.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Arc<dyn ResponseCache>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            engine: InvocationEngine::new(registry.clone(), cache, events.clone()),
            dispatcher: StreamingDispatcher::new(registry, events),
        }
    }

    /// HTTP backends, an in-memory cache, and `tracing` diagnostics.
    pub fn from_settings(settings: GatewaySettings) -> GatewayResult<Self> {
        let registry = ProviderRegistry::from_settings(settings)?;
        info!(
            primary = %registry.primary(),
            fallbacks = ?registry.gateway_config().fallback_providers,
            "Gateway configured"
        );
        Ok(Self::new(
            Arc::new(registry),
            Arc::new(InMemoryResponseCache::new()),
            Arc::new(TracingEventSink),
        ))
    }

    /// The configured providers and their backends.
    pub fn registry(&self) -> &ProviderRegistry {
        self.engine.registry()
    }

    /// Request/response completion with caching, retries and fallback.
    pub async fn call(
        &self,
        prompt: &str,
        use_cache: bool,
        options: CallOptions,
    ) -> GatewayResult<Completion> {
        self.engine.call(prompt, use_cache, options).await
    }

    /// Like [`Gateway::call`], abandoned with [`GatewayError::Cancelled`](docsmith_core::GatewayError::Cancelled) once `cancel` fires.
    pub async fn call_cancellable(
        &self,
        prompt: &str,
        use_cache: bool,
        options: CallOptions,
        cancel: &CancellationToken,
    ) -> GatewayResult<Completion> {
        self.engine
            .call_cancellable(prompt, use_cache, options, cancel)
            .await
    }

    /// Streams a completion; every outcome is reported through `callbacks`.
    pub async fn stream(&self, prompt: &str, options: CallOptions, callbacks: StreamCallbacks) {
        self.dispatcher.stream(prompt, options, callbacks).await;
    }

    /// Like [`Gateway::stream`]; after `cancel` fires no further callback runs.
    pub async fn stream_cancellable(
        &self,
        prompt: &str,
        options: CallOptions,
        callbacks: StreamCallbacks,
        cancel: &CancellationToken,
    ) {
        self.dispatcher
            .stream_cancellable(prompt, options, callbacks, cancel)
            .await;
    }

    /// Sends a tiny probe to the primary provider.
    pub async fn is_functional(&self) -> bool {
        self.engine.is_functional().await
    }

    /// Drops every cached response.
    pub async fn clear_cache(&self) -> GatewayResult<()> {
        self.engine.clear_cache().await
    }
}
