//! Anthropic Messages API streaming provider.
//!
//! The vendor wire format itself is out of scope for the rest of the crate
//! (§2): this module is the one place that knows Anthropic's SSE event
//! shape, and its only job is to translate that shape into [`LlmStreamEvent`]s.

use std::collections::HashMap;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;
use crate::model::MessageRole;

use super::{LlmProvider, LlmRequest, LlmStreamEvent};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

/// LLM provider backed by the Anthropic Messages API, streaming mode.
pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    /// Build a provider against the production API.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Build a provider against a custom base URL, for tests.
    pub fn with_base_url(api_key: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, request: LlmRequest) -> Result<BoxStream<'static, LlmStreamEvent>, LlmError> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            stream: true,
            system: if request.system.is_empty() {
                None
            } else {
                Some(&request.system)
            },
            messages: merge_consecutive_same_role(
                request.messages.iter().filter_map(to_anthropic_message).collect(),
            ),
            tools: request.tools.iter().map(to_anthropic_tool).collect(),
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicErrorEnvelope>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(LlmError::Api { status, message });
        }

        let byte_stream = response.bytes_stream();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(drive_sse(byte_stream, tx));

        let events = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }
}

/// Read the SSE body, decode each `data:` payload, and push the translated
/// events to `tx`. Runs to completion or until the channel's receiver drops.
async fn drive_sse(
    mut byte_stream: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    tx: tokio::sync::mpsc::UnboundedSender<LlmStreamEvent>,
) {
    let mut buffer = String::new();
    let mut blocks: HashMap<u64, BlockState> = HashMap::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                let _ = tx.send(LlmStreamEvent::Error(error.to_string()));
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find("\n\n") {
            let raw_event: String = buffer.drain(..pos + 2).collect();
            if let Some(data) = extract_data_line(&raw_event) {
                if !handle_event(&data, &mut blocks, &tx) {
                    return;
                }
            }
        }
    }
}

struct BlockState {
    id: String,
    name: String,
    is_thinking: bool,
    json_buffer: String,
}

fn extract_data_line(raw_event: &str) -> Option<String> {
    raw_event
        .lines()
        .find_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
        .map(str::to_string)
}

/// Returns `false` once the turn is over (message_stop, a send failure, or a
/// terminal error) so the caller can stop reading the body.
fn handle_event(
    data: &str,
    blocks: &mut HashMap<u64, BlockState>,
    tx: &tokio::sync::mpsc::UnboundedSender<LlmStreamEvent>,
) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return true;
    };
    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "content_block_start" => {
            let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
            let block = value.get("content_block").cloned().unwrap_or(Value::Null);
            let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
            match block_type {
                "tool_use" => {
                    let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                    let name = block.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                    if tx
                        .send(LlmStreamEvent::ToolUseStart {
                            id: id.clone(),
                            name: name.clone(),
                        })
                        .is_err()
                    {
                        return false;
                    }
                    blocks.insert(
                        index,
                        BlockState {
                            id,
                            name,
                            is_thinking: false,
                            json_buffer: String::new(),
                        },
                    );
                }
                "thinking" => {
                    if tx.send(LlmStreamEvent::ThinkingStart).is_err() {
                        return false;
                    }
                    blocks.insert(
                        index,
                        BlockState {
                            id: String::new(),
                            name: String::new(),
                            is_thinking: true,
                            json_buffer: String::new(),
                        },
                    );
                }
                _ => {}
            }
            true
        }
        "content_block_delta" => {
            let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
            let delta = value.get("delta").cloned().unwrap_or(Value::Null);
            let delta_type = delta.get("type").and_then(Value::as_str).unwrap_or("");
            match delta_type {
                "text_delta" => {
                    let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                    tx.send(LlmStreamEvent::TextDelta(text.to_string())).is_ok()
                }
                "thinking_delta" => {
                    let text = delta.get("thinking").and_then(Value::as_str).unwrap_or_default();
                    tx.send(LlmStreamEvent::ThinkingDelta(text.to_string())).is_ok()
                }
                "input_json_delta" => {
                    if let Some(state) = blocks.get_mut(&index) {
                        let partial = delta.get("partial_json").and_then(Value::as_str).unwrap_or_default();
                        state.json_buffer.push_str(partial);
                    }
                    true
                }
                _ => true,
            }
        }
        "content_block_stop" => {
            let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
            if let Some(state) = blocks.remove(&index) {
                if state.is_thinking {
                    return tx.send(LlmStreamEvent::ThinkingDone).is_ok();
                }
                if !state.id.is_empty() {
                    return tx
                        .send(LlmStreamEvent::ToolUseDone {
                            id: state.id,
                            name: state.name,
                            arguments_json: state.json_buffer,
                        })
                        .is_ok();
                }
            }
            true
        }
        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown upstream error")
                .to_string();
            let _ = tx.send(LlmStreamEvent::Error(message));
            false
        }
        "message_stop" => false,
        _ => true,
    }
}

fn to_anthropic_message(message: &crate::model::StoredMessage) -> Option<AnthropicMessage> {
    let role = match message.role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        // Tool-use/tool-result turns are folded into the assistant/user
        // halves of the conversation by the Turn Coordinator's own
        // bookkeeping; the provider only ever sees plain text turns here.
        MessageRole::ToolUse => "assistant",
        MessageRole::ToolResult => "user",
    };
    Some(AnthropicMessage {
        role,
        content: message.content.clone(),
    })
}

/// The Messages API requires strictly alternating `user`/`assistant` turns.
/// A turn that both speaks and calls a tool (or calls more than one tool)
/// produces several consecutive same-role [`StoredMessage`]s; fold each run
/// into a single message so the request stays alternating.
fn merge_consecutive_same_role(messages: Vec<AnthropicMessage>) -> Vec<AnthropicMessage> {
    let mut merged: Vec<AnthropicMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(last) if last.role == message.role => {
                last.content.push_str("\n\n");
                last.content.push_str(&message.content);
            }
            _ => merged.push(message),
        }
    }
    merged
}

fn to_anthropic_tool(tool: &crate::tools::ToolDescriptor) -> AnthropicTool {
    AnthropicTool {
        name: tool.name.clone(),
        description: tool.description.clone(),
        input_schema: tool.parameter_schema.clone(),
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Deserialize)]
struct AnthropicErrorEnvelope {
    error: AnthropicErrorDetail,
}

#[derive(Deserialize)]
struct AnthropicErrorDetail {
    #[serde(default)]
    message: String,
}
