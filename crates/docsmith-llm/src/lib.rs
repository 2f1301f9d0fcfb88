//! Resilient access to text-generation providers for Docsmith.
//!
//! [`Gateway`] is the entry point: request/response calls with caching,
//! retries and provider fallback, plus live streaming with progress
//! callbacks. Provider wire formats live behind [`ProviderBackend`].

/// Provider wire protocols behind one trait.
pub mod backends;
/// Response cache keyed by model and normalized prompt.
pub mod cache;
/// Gateway and provider settings.
pub mod config;
/// Request/response calls with retries and fallback.
pub mod engine;
/// Structured gateway events and their sinks.
pub mod events;
/// The public facade.
pub mod gateway;
/// Configured providers and their backends.
pub mod registry;
/// Live streaming with progress callbacks.
pub mod stream;
/// Token estimates and output budgets.
pub mod tokens;

pub use backends::{build_backend, ProviderBackend, ProviderRequest, ProviderResponse, StreamChunk};
pub use cache::{CacheEntry, InMemoryResponseCache, ResponseCache};
pub use config::{GatewayConfig, GatewaySettings, ProviderConfig, ProviderKind};
pub use engine::{CallOptions, Completion, InvocationEngine, RetryPolicy};
pub use events::{EventSink, GatewayEvent, RecordingEventSink, TracingEventSink};
pub use gateway::Gateway;
pub use registry::ProviderRegistry;
pub use stream::{StreamCallbacks, StreamProgress, StreamingDispatcher};
