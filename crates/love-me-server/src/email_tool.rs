//! Built-in email tool provider (C1's "built-in email tools").
//!
//! Subprocess providers speak a line-framed JSON protocol (see
//! `love_me_core::tools::subprocess`); this one is in-process and exposes a
//! single tool letting an LLM turn resolve which conversation a mail thread
//! already landed in, without a round trip through a child process.

use std::sync::Arc;

use async_trait::async_trait;
use love_me_core::error::ToolError;
use love_me_core::storage::EmailStateStore;
use love_me_core::tools::{ToolDescriptor, ToolInvocationResult, ToolProvider};
use serde_json::Value;

pub struct EmailToolProvider {
    email_state: Arc<EmailStateStore>,
}

impl EmailToolProvider {
    pub fn new(email_state: Arc<EmailStateStore>) -> Self {
        Self { email_state }
    }
}

#[async_trait]
impl ToolProvider for EmailToolProvider {
    fn name(&self) -> &str {
        "email"
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        Ok(vec![ToolDescriptor {
            name: "email_thread_conversation".to_string(),
            description: "Look up the conversation id bound to a mail thread id, if any."
                .to_string(),
            parameter_schema: serde_json::json!({
                "type": "object",
                "properties": { "threadId": { "type": "string" } },
                "required": ["threadId"],
            }),
            provider_name: "email".to_string(),
        }])
    }

    async fn invoke(&self, tool_name: &str, arguments: Value) -> Result<ToolInvocationResult, ToolError> {
        if tool_name != "email_thread_conversation" {
            return Err(ToolError::UnknownTool {
                name: tool_name.to_string(),
            });
        }
        let thread_id = arguments
            .get("threadId")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::MalformedPayload("missing 'threadId'".to_string()))?;

        match self.email_state.conversation_for_thread(thread_id).await {
            Ok(Some(conversation_id)) => Ok(ToolInvocationResult::ok(
                serde_json::json!({ "conversationId": conversation_id }).to_string(),
            )),
            Ok(None) => Ok(ToolInvocationResult::ok(
                serde_json::json!({ "conversationId": null }).to_string(),
            )),
            Err(e) => Ok(ToolInvocationResult::error(e.to_string())),
        }
    }
}
