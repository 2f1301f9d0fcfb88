use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata key set on a message that was tagged by a conversation fork.
pub const META_FORKED: &str = "forked";
/// Metadata key holding the name of the fork that tagged a message.
pub const META_FORK_NAME: &str = "forkName";

/// The role of the participant that authored a [`ConversationMessage`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A system-level instruction or persona.
    System,
    /// The person (or calling feature) asking for text.
    User,
    /// Text produced by a provider.
    Assistant,
}

impl Role {
    /// Lowercase wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message within a conversation history.
///
/// Messages are values: once created they are never mutated in place.
/// Operations that need a changed message (such as fork tagging) build a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// The role of the message author.
    pub role: Role,
    /// The textual content of the message.
    pub content: String,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary key-value metadata attached to the message.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConversationMessage {
    /// Creates a new message with the given role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Creates a new message with [`Role::System`].
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a new message with [`Role::User`].
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new message with [`Role::Assistant`].
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Returns the message with `metadata` merged over its existing metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Returns a copy tagged as the trigger of the named fork.
    pub fn tagged_as_fork(&self, fork_name: &str) -> Self {
        let mut tagged = self.clone();
        tagged
            .metadata
            .insert(META_FORKED.to_string(), serde_json::Value::Bool(true));
        tagged.metadata.insert(
            META_FORK_NAME.to_string(),
            serde_json::Value::String(fork_name.to_string()),
        );
        tagged
    }

    /// Whether this message was tagged by a fork.
    pub fn is_forked(&self) -> bool {
        self.metadata
            .get(META_FORKED)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Name of the fork that tagged this message, if any.
    pub fn fork_name(&self) -> Option<&str> {
        self.metadata
            .get(META_FORK_NAME)
            .and_then(serde_json::Value::as_str)
    }
}
