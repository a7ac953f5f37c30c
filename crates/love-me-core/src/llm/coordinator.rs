//! Drives one user turn to completion: appends the user message, streams
//! the provider's reply, interleaves tool calls, and loops until the model
//! stops requesting tools (§4.10).

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;
use crate::model::{MessageRole, StoredMessage};
use crate::storage::ConversationStore;
use crate::tools::ToolRouter;

use super::{truncate_with_marker, LlmProvider, LlmRequest, LlmStreamEvent, SkillMetadata};

const TOOL_RESULT_TRUNCATE_BYTES: usize = 4 * 1024;

/// One client-visible event emitted while driving a turn. The Gateway maps
/// these onto the wire envelope shape; the coordinator itself knows nothing
/// about WebSocket framing.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A chunk of reasoning text.
    ThinkingChunk { text: String },
    /// The reasoning segment ended; `duration_secs` covers its whole span.
    ThinkingDone { duration_secs: f64 },
    /// A chunk of the visible reply.
    AssistantChunk { text: String },
    /// The model began invoking a tool.
    ToolCallStart {
        tool_id: String,
        tool_name: String,
        provider_name: String,
    },
    /// A tool invocation completed (or failed).
    ToolCallDone {
        tool_id: String,
        tool_name: String,
        success: bool,
        result: String,
        duration_secs: f64,
    },
    /// The turn finished with no further tool calls pending.
    AssistantDone,
    /// The turn failed; no further events follow.
    Error { message: String },
}

struct PendingToolCall {
    id: String,
    name: String,
    arguments_json: String,
}

/// Drives the multi-turn loop described in §4.10.
pub struct TurnCoordinator {
    conversations: Arc<ConversationStore>,
    tools: Arc<ToolRouter>,
    provider: Arc<dyn LlmProvider>,
    base_prompt: String,
    skills: Vec<SkillMetadata>,
}

impl TurnCoordinator {
    /// Build a coordinator over the given conversation store, tool router,
    /// and LLM provider.
    pub fn new(
        conversations: Arc<ConversationStore>,
        tools: Arc<ToolRouter>,
        provider: Arc<dyn LlmProvider>,
        base_prompt: impl Into<String>,
        skills: Vec<SkillMetadata>,
    ) -> Self {
        Self {
            conversations,
            tools,
            provider,
            base_prompt: base_prompt.into(),
            skills,
        }
    }

    async fn system_prompt(&self) -> String {
        let mut prompt = self.base_prompt.clone();
        if !self.skills.is_empty() {
            prompt.push_str("\n\nAvailable skills:\n");
            for skill in &self.skills {
                prompt.push_str(&format!("- {}: {}\n", skill.name, skill.summary));
            }
        }
        for instructions in self.tools.expert_instructions().await {
            prompt.push_str("\n\n");
            prompt.push_str(&instructions);
        }
        prompt
    }

    /// Run one user turn on `conversation_id`, emitting events via
    /// `on_event` as the stream progresses. Returns once the turn reaches a
    /// terminal state (`AssistantDone` or `Error`).
    pub async fn run_turn<F>(
        &self,
        conversation_id: &str,
        user_message: &str,
        cancel: CancellationToken,
        on_event: F,
    ) where
        F: Fn(TurnEvent) + Send + Sync,
    {
        if let Err(e) = self
            .conversations
            .add_message(
                conversation_id,
                StoredMessage::text(MessageRole::User, user_message),
            )
            .await
        {
            on_event(TurnEvent::Error {
                message: format!("failed to append user message: {e}"),
            });
            return;
        }

        loop {
            if cancel.is_cancelled() {
                on_event(TurnEvent::Error {
                    message: "turn cancelled".to_string(),
                });
                return;
            }

            let history = match self.conversations.load(conversation_id).await {
                Ok(Some(conversation)) => conversation.messages,
                Ok(None) => {
                    on_event(TurnEvent::Error {
                        message: format!("conversation {conversation_id} no longer exists"),
                    });
                    return;
                }
                Err(e) => {
                    on_event(TurnEvent::Error {
                        message: format!("failed to load conversation: {e}"),
                    });
                    return;
                }
            };

            let request = LlmRequest {
                system: self.system_prompt().await,
                messages: history,
                tools: self.tools.list().await,
            };

            let mut stream = match self.provider.stream(request).await {
                Ok(stream) => stream,
                Err(e) => {
                    on_event(self.llm_error_event(&e));
                    return;
                }
            };

            let mut full_text = String::new();
            let mut thinking_started_at: Option<Instant> = None;
            let mut pending_tool_calls: Vec<PendingToolCall> = Vec::new();
            let mut stream_errored = false;

            while let Some(event) = stream.next().await {
                if cancel.is_cancelled() {
                    on_event(TurnEvent::Error {
                        message: "turn cancelled".to_string(),
                    });
                    return;
                }
                match event {
                    LlmStreamEvent::ThinkingStart => {
                        thinking_started_at = Some(Instant::now());
                    }
                    LlmStreamEvent::ThinkingDelta(text) => {
                        on_event(TurnEvent::ThinkingChunk { text });
                    }
                    LlmStreamEvent::ThinkingDone => {
                        let duration_secs = thinking_started_at
                            .take()
                            .map(|start| start.elapsed().as_secs_f64())
                            .unwrap_or(0.0);
                        on_event(TurnEvent::ThinkingDone { duration_secs });
                    }
                    LlmStreamEvent::TextDelta(text) => {
                        full_text.push_str(&text);
                        on_event(TurnEvent::AssistantChunk { text });
                    }
                    LlmStreamEvent::ToolUseStart { id, name } => {
                        let provider_name = self
                            .tools
                            .lookup_provider(&name)
                            .await
                            .unwrap_or_else(|| "unknown".to_string());
                        on_event(TurnEvent::ToolCallStart {
                            tool_id: id,
                            tool_name: name,
                            provider_name,
                        });
                    }
                    LlmStreamEvent::ToolUseDone {
                        id,
                        name,
                        arguments_json,
                    } => {
                        pending_tool_calls.push(PendingToolCall {
                            id,
                            name,
                            arguments_json,
                        });
                    }
                    LlmStreamEvent::Error(message) => {
                        on_event(TurnEvent::Error { message });
                        stream_errored = true;
                        break;
                    }
                }
            }

            if stream_errored {
                return;
            }

            if !full_text.is_empty() {
                if let Err(e) = self
                    .conversations
                    .add_message(
                        conversation_id,
                        StoredMessage::text(MessageRole::Assistant, full_text),
                    )
                    .await
                {
                    on_event(TurnEvent::Error {
                        message: format!("failed to append assistant message: {e}"),
                    });
                    return;
                }
            }

            if pending_tool_calls.is_empty() {
                on_event(TurnEvent::AssistantDone);
                return;
            }

            for call in pending_tool_calls {
                if let Err(e) = self
                    .conversations
                    .add_message(
                        conversation_id,
                        StoredMessage::tool_use(&call.id, &call.name, call.arguments_json.clone()),
                    )
                    .await
                {
                    on_event(TurnEvent::Error {
                        message: format!("failed to append tool_use message: {e}"),
                    });
                    return;
                }

                let arguments =
                    serde_json::from_str(&call.arguments_json).unwrap_or(serde_json::Value::Null);
                let started = Instant::now();
                let result = self.tools.invoke(&call.name, arguments).await;
                let duration_secs = started.elapsed().as_secs_f64();

                if let Err(e) = self
                    .conversations
                    .add_message(
                        conversation_id,
                        StoredMessage::tool_result(
                            &call.id,
                            &call.name,
                            result.content.clone(),
                            result.is_error,
                        ),
                    )
                    .await
                {
                    on_event(TurnEvent::Error {
                        message: format!("failed to append tool_result message: {e}"),
                    });
                    return;
                }

                on_event(TurnEvent::ToolCallDone {
                    tool_id: call.id,
                    tool_name: call.name,
                    success: !result.is_error,
                    result: truncate_with_marker(&result.content, TOOL_RESULT_TRUNCATE_BYTES),
                    duration_secs,
                });
            }
            // Re-enter the stream with the updated conversation (step 6).
        }
    }

    fn llm_error_event(&self, error: &LlmError) -> TurnEvent {
        TurnEvent::Error {
            message: error.to_string(),
        }
    }
}

/// Strips exactly one layer of surrounding markdown code fences (e.g.
/// ` ```json\n{...}\n``` `) from LLM-authored JSON text. Whether to strip
/// more than one nested layer is unspecified by the source behavior this
/// was distilled from, so only one layer is ever removed.
pub fn strip_one_markdown_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let after_open = after_open
        .strip_prefix("json")
        .unwrap_or(after_open)
        .trim_start_matches('\n');
    let Some(body) = after_open.strip_suffix("```") else {
        return trimmed;
    };
    body.trim()
}
