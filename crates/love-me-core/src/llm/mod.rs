//! LLM provider abstraction and the Turn Coordinator that drives one user
//! turn to completion, interleaving tool calls (C10).
//!
//! The vendor wire protocol is out of scope (§2): a provider is modeled as
//! an opaque stream of [`LlmStreamEvent`]s and the daemon never parses a
//! vendor-specific payload shape.

pub mod anthropic;
pub mod coordinator;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;
use crate::model::StoredMessage;
use crate::tools::ToolDescriptor;

pub use anthropic::AnthropicProvider;
pub use coordinator::{strip_one_markdown_fence, TurnCoordinator, TurnEvent};

/// One event in a provider's streaming reply.
#[derive(Debug, Clone)]
pub enum LlmStreamEvent {
    /// The model has started a reasoning/thinking segment.
    ThinkingStart,
    /// An incremental chunk of reasoning text.
    ThinkingDelta(String),
    /// The reasoning segment is complete.
    ThinkingDone,
    /// An incremental chunk of the visible reply.
    TextDelta(String),
    /// The model has begun invoking a tool.
    ToolUseStart {
        /// The tool call's id, referenced by the matching `ToolUseDone`.
        id: String,
        /// The tool's name.
        name: String,
    },
    /// A tool invocation's arguments are fully streamed.
    ToolUseDone {
        /// The tool call's id.
        id: String,
        /// The tool's name.
        name: String,
        /// The tool's arguments, as raw JSON text.
        arguments_json: String,
    },
    /// The provider reported an error; the turn terminates.
    Error(String),
}

/// One request to a provider: system prompt, full conversation history, and
/// the tool catalog the model may invoke.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// The synthesized system prompt (§4.10 step 2).
    pub system: String,
    /// Conversation history, oldest first.
    pub messages: Vec<StoredMessage>,
    /// Tools the model may call this turn.
    pub tools: Vec<ToolDescriptor>,
}

/// A skill's lightweight metadata, folded into the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillMetadata {
    /// The skill's name.
    pub name: String,
    /// A one-line description of when to use it.
    pub summary: String,
}

/// Trait abstracting one LLM vendor's streaming completion API. Object-safe
/// for use as `Arc<dyn LlmProvider>`.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// The provider's display name (e.g. `"anthropic"`, `"openai"`).
    fn name(&self) -> &str;

    /// Open a streaming completion for `request`.
    async fn stream(&self, request: LlmRequest) -> Result<BoxStream<'static, LlmStreamEvent>, LlmError>;
}

/// Returns `value` unchanged if it fits within `limit` bytes, otherwise
/// truncates to the limit and appends the tool-result truncation marker.
pub fn truncate_with_marker(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        return value.to_string();
    }
    let mut cut = limit;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[...truncated]", &value[..cut])
}

/// Returns `value` unchanged if it fits within `limit` characters, otherwise
/// truncates to the limit and appends the email body truncation marker
/// (distinct from [`truncate_with_marker`]'s tool-result marker per §8).
pub fn truncate_body_with_marker(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let cut: String = value.chars().take(limit).collect();
    format!("{cut}[... body truncated at {limit} characters ...]")
}
