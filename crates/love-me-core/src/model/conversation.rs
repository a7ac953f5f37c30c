//! Conversation and message records (§3 of the specification).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tagged metadata value carried on a `StoredMessage` or wire envelope.
/// Round-trips through JSON preserving its tag, per §9 design notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    /// UTF-8 text.
    String(String),
    /// A whole number.
    Int(i64),
    /// A floating-point number.
    Double(f64),
    /// A boolean.
    Bool(bool),
    /// The JSON null literal.
    Null,
    /// A nested array of tagged values.
    Array(Vec<MetaValue>),
    /// A nested object of tagged values.
    Object(HashMap<String, MetaValue>),
}

/// Convenience map type for message/envelope metadata.
pub type Metadata = HashMap<String, MetaValue>;

/// Who authored a `StoredMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// A message typed by the human user.
    User,
    /// A message generated by the LLM.
    Assistant,
    /// A record of the assistant invoking a tool.
    ToolUse,
    /// A record of a tool's response.
    ToolResult,
}

/// One entry in a conversation's append-only message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Who produced this message.
    pub role: MessageRole,
    /// The message body. For `ToolUse` this is the tool's argument JSON;
    /// for `ToolResult` this is the tool's content or error text.
    pub content: String,
    /// When this message was appended.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata (e.g. `toolId`/`toolName` for tool messages,
    /// `sourceType`/`emailThreadId` for email-originated messages).
    #[serde(default)]
    pub metadata: Metadata,
}

impl StoredMessage {
    /// Build a plain `user` or `assistant` message with no metadata.
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    /// Build a `tool_use` message carrying the tool's id, name, and args JSON.
    pub fn tool_use(tool_id: &str, tool_name: &str, arguments_json: impl Into<String>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("toolId".to_string(), MetaValue::String(tool_id.to_string()));
        metadata.insert(
            "toolName".to_string(),
            MetaValue::String(tool_name.to_string()),
        );
        Self {
            role: MessageRole::ToolUse,
            content: arguments_json.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Build a `tool_result` message carrying the tool's id, name, and
    /// whether it errored.
    pub fn tool_result(
        tool_id: &str,
        tool_name: &str,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("toolId".to_string(), MetaValue::String(tool_id.to_string()));
        metadata.insert(
            "toolName".to_string(),
            MetaValue::String(tool_name.to_string()),
        );
        metadata.insert("isError".to_string(), MetaValue::Bool(is_error));
        Self {
            role: MessageRole::ToolResult,
            content: content.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// An ordered, append-only sequence of messages with a title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique identifier.
    pub id: String,
    /// Display title (e.g. the email subject that created it).
    pub title: String,
    /// When the most recent message was appended.
    pub last_message_at: DateTime<Utc>,
    /// Full message history, in append order.
    pub messages: Vec<StoredMessage>,
}

impl Conversation {
    /// A brand-new, empty conversation.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            last_message_at: now,
            messages: Vec::new(),
        }
    }

    /// Project into the summary shape returned by `listAll()`.
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            last_message_at: self.last_message_at,
            message_count: self.messages.len(),
        }
    }
}

/// The projection returned by `ConversationStore::listAll()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// The conversation's id.
    pub id: String,
    /// The conversation's title.
    pub title: String,
    /// When the most recent message was appended.
    pub last_message_at: DateTime<Utc>,
    /// Total message count.
    pub message_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_use_message_carries_metadata() {
        let msg = StoredMessage::tool_use("t1", "clock", "{}");
        assert_eq!(msg.role, MessageRole::ToolUse);
        assert_eq!(
            msg.metadata.get("toolName"),
            Some(&MetaValue::String("clock".to_string()))
        );
    }

    #[test]
    fn tool_result_message_carries_error_flag() {
        let msg = StoredMessage::tool_result("t1", "clock", "boom", true);
        assert_eq!(msg.metadata.get("isError"), Some(&MetaValue::Bool(true)));
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let mut meta = Metadata::new();
        meta.insert("count".to_string(), MetaValue::Int(3));
        meta.insert("ok".to_string(), MetaValue::Bool(true));
        let json = serde_json::to_string(&meta).unwrap();
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }
}
