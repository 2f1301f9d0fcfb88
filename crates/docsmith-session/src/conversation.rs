use chrono::{DateTime, Utc};
use docsmith_core::{ConversationMessage, GatewayError, GatewayResult, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Persona used when the caller does not supply a system message.
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are Docsmith, a technical writing assistant. \
     You turn project interview answers into clear, accurate software project documents. \
     Keep the author's intent, prefer concrete language, and never invent requirements.";

/// Version written into every export envelope.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// Serialized form produced by [`Conversation::export_conversation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationExport {
    version: u32,
    id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fork_name: Option<String>,
    exported_at: DateTime<Utc>,
    messages: Vec<ConversationMessage>,
}

/// Accepted import payloads: a full export envelope or a bare message array.
#[derive(Deserialize)]
#[serde(untagged)]
enum ImportPayload {
    Envelope(ConversationExport),
    Messages(Vec<ConversationMessage>),
}

/// An ordered, append-only message history with a mandatory leading system
/// message.
///
/// A conversation has a single owner; all mutation goes through `&mut self`.
/// [`fork`](Self::fork) hands out an independent deep copy that can be moved
/// to another task.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    id: Uuid,
    parent_id: Option<Uuid>,
    fork_name: Option<String>,
    messages: Vec<ConversationMessage>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Creates a conversation seeded with [`DEFAULT_SYSTEM_MESSAGE`].
    pub fn new() -> Self {
        Self::with_system_message(DEFAULT_SYSTEM_MESSAGE)
    }

    /// Creates a conversation seeded with a caller-supplied system message.
    pub fn with_system_message(system_message: impl Into<String>) -> Self {
        Self::from_messages(vec![ConversationMessage::system(system_message)])
    }

    fn from_messages(messages: Vec<ConversationMessage>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            fork_name: None,
            messages,
            created_at: now,
            updated_at: now,
        }
    }

    /// Unique id of this conversation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of the conversation this one was forked from.
    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    /// Name given to the fork that produced this conversation.
    pub fn fork_name(&self) -> Option<&str> {
        self.fork_name.as_deref()
    }

    /// When the conversation was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the history last changed.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// The leading system message.
    pub fn system_message(&self) -> &ConversationMessage {
        &self.messages[0]
    }

    /// Appends a message with a freshly generated timestamp.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        self.push(ConversationMessage::new(role, content));
    }

    /// Appends a message carrying caller metadata.
    pub fn add_message_with_metadata(
        &mut self,
        role: Role,
        content: impl Into<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        self.push(ConversationMessage::new(role, content).with_metadata(metadata));
    }

    fn push(&mut self, message: ConversationMessage) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// Borrowed view of the history, oldest first.
    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Owned copy of the history that stays valid after further mutation.
    pub fn snapshot(&self) -> Vec<ConversationMessage> {
        self.messages.clone()
    }

    /// Number of messages, including the system message.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// The most recent message.
    pub fn last_message(&self) -> &ConversationMessage {
        // Never empty: the system message is always present.
        &self.messages[self.messages.len() - 1]
    }

    /// Truncates the history back to the original system message.
    pub fn clear_messages(&mut self) {
        self.messages.truncate(1);
        self.updated_at = Utc::now();
    }

    /// Renders the history as `role: content` lines.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Serializes the full history, including timestamps and metadata.
    pub fn export_conversation(&self) -> GatewayResult<String> {
        let export = ConversationExport {
            version: EXPORT_FORMAT_VERSION,
            id: self.id,
            parent_id: self.parent_id,
            fork_name: self.fork_name.clone(),
            exported_at: Utc::now(),
            messages: self.messages.clone(),
        };
        Ok(serde_json::to_string(&export)?)
    }

    /// Replaces the history with a previously exported one.
    ///
    /// Accepts the envelope written by [`export_conversation`](Self::export_conversation)
    /// or a bare JSON array of messages. When the imported history does not
    /// start with a system message the current system message is kept in
    /// front of it. On any error the history is left unchanged.
    pub fn import_conversation(&mut self, serialized: &str) -> GatewayResult<()> {
        let payload: ImportPayload = serde_json::from_str(serialized)
            .map_err(|e| GatewayError::Session(format!("Failed to parse conversation: {e}")))?;

        let imported = match payload {
            ImportPayload::Envelope(export) => {
                if export.version > EXPORT_FORMAT_VERSION {
                    return Err(GatewayError::Session(format!(
                        "Unsupported conversation format version {} (max {})",
                        export.version, EXPORT_FORMAT_VERSION
                    )));
                }
                export.messages
            }
            ImportPayload::Messages(messages) => messages,
        };

        if imported.is_empty() {
            return Err(GatewayError::Session(
                "Imported conversation contains no messages".into(),
            ));
        }

        let messages = if imported[0].role == Role::System {
            imported
        } else {
            let mut with_system = Vec::with_capacity(imported.len() + 1);
            with_system.push(self.system_message().clone());
            with_system.extend(imported);
            with_system
        };

        debug!(
            conversation_id = %self.id,
            count = messages.len(),
            "Imported conversation history"
        );
        self.messages = messages;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Branches the conversation.
    ///
    /// The copy holds the whole history; its most recent user message is
    /// tagged with `forked = true` and `forkName = name`. If there is no user
    /// message yet, nothing is tagged. `self` is not modified.
    pub fn fork(&self, name: &str) -> Conversation {
        let mut messages = self.messages.clone();
        match messages.iter().rposition(|m| m.role == Role::User) {
            Some(idx) => messages[idx] = messages[idx].tagged_as_fork(name),
            None => debug!(
                conversation_id = %self.id,
                fork = name,
                "Fork without a user message; nothing tagged"
            ),
        }
        self.child(name, messages)
    }

    /// Branches the conversation at an explicit trigger message.
    ///
    /// The copy holds the history up to and including `index`, and the
    /// message at `index` is tagged as the fork trigger.
    pub fn fork_at(&self, name: &str, index: usize) -> GatewayResult<Conversation> {
        let Some(trigger) = self.messages.get(index) else {
            return Err(GatewayError::Session(format!(
                "Fork index {index} out of range (history has {} messages)",
                self.messages.len()
            )));
        };
        let mut messages = self.messages[..index].to_vec();
        messages.push(trigger.tagged_as_fork(name));
        Ok(self.child(name, messages))
    }

    fn child(&self, name: &str, messages: Vec<ConversationMessage>) -> Conversation {
        let mut fork = Self::from_messages(messages);
        fork.parent_id = Some(self.id);
        fork.fork_name = Some(name.to_string());
        fork
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}
