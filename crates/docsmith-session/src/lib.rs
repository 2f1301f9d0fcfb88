//! Conversation history for multi-turn generation in Docsmith.
//!
//! A [`Conversation`] holds an ordered message list that can be forked,
//! exported to JSON and imported back.

/// Conversation history and its persistence format.
pub mod conversation;

pub use conversation::{Conversation, DEFAULT_SYSTEM_MESSAGE, EXPORT_FORMAT_VERSION};
