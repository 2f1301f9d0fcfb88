//! Core types and error definitions for the Docsmith LLM gateway.
//!
//! This crate provides the foundational types shared by the conversation and
//! gateway crates: the error taxonomy, message representations, and token
//! accounting.
//!
//! # Main types
//!
//! - [`GatewayError`] — Errors that cross the gateway boundary.
//! - [`ProviderError`] — Retryable/fatal classification of one provider attempt.
//! - [`GatewayResult`] — Convenience alias for `Result<T, GatewayError>`.
//! - [`Role`] — Message role (system, user, assistant).
//! - [`ConversationMessage`] — A single message within a conversation history.
//! - [`TokenUsage`] — Prompt/completion token counts for one completion.

/// Error taxonomy.
pub mod error;
/// `tracing` subscriber installation.
pub mod logging;
/// Conversation message types.
pub mod message;
/// Token accounting.
pub mod usage;

pub use error::{GatewayError, GatewayResult, ProviderError, ProviderFailure};
pub use logging::{init_logging, LogFormat};
pub use message::{ConversationMessage, Role, META_FORKED, META_FORK_NAME};
pub use usage::TokenUsage;
