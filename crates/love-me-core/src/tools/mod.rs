//! Tool Router: registers providers, exposes a unified tool catalog, and
//! dispatches invocations to whichever provider owns a tool (C1).

pub mod subprocess;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::ToolError;

/// One tool a provider exposes, as advertised to the LLM Turn Coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// The tool's unique name (unique across all providers).
    pub name: String,
    /// Human-readable description surfaced to the LLM.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameter_schema: Value,
    /// The provider that owns this tool.
    pub provider_name: String,
}

/// The outcome of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    /// The tool's textual output, or an error message if `is_error`.
    pub content: String,
    /// Whether the invocation failed.
    pub is_error: bool,
}

impl ToolInvocationResult {
    /// A successful result carrying `content`.
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// A failed result carrying a human-readable `message`.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// A pluggable source of tools. The built-in email provider runs in-process;
/// external providers proxy to a subprocess. The trait is object-safe so the
/// Router can hold a heterogeneous set behind `Arc<dyn ToolProvider>`.
#[async_trait::async_trait]
pub trait ToolProvider: Send + Sync {
    /// The provider's registered name.
    fn name(&self) -> &str;

    /// The tools this provider currently exposes. Queried once at startup
    /// and cached by the Router.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError>;

    /// Invoke one of this provider's tools by name.
    async fn invoke(&self, tool_name: &str, arguments: Value) -> Result<ToolInvocationResult, ToolError>;

    /// An optional block of provider-specific instructions folded into the
    /// LLM Turn Coordinator's system prompt (§4.10 step 2) — how to phrase
    /// arguments, quirks of this provider's tools, etc. Most providers have
    /// none.
    fn expert_instructions(&self) -> Option<String> {
        None
    }
}

/// Registers tool providers and dispatches invocations by tool name.
/// Invocations hold no global lock — concurrent calls to different (or the
/// same) provider proceed independently.
#[derive(Default)]
pub struct ToolRouter {
    providers: RwLock<HashMap<String, Arc<dyn ToolProvider>>>,
    catalog: RwLock<HashMap<String, ToolDescriptor>>,
}

impl ToolRouter {
    /// An empty router with no registered providers.
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            catalog: RwLock::new(HashMap::new()),
        }
    }

    /// Register a provider and cache its current tool list. Re-registering
    /// the same provider name replaces it and refreshes its tools.
    pub async fn register_provider(&self, provider: Arc<dyn ToolProvider>) -> Result<(), ToolError> {
        let tools = provider.list_tools().await?;
        let provider_name = provider.name().to_string();

        let mut catalog = self.catalog.write().await;
        catalog.retain(|_, descriptor| descriptor.provider_name != provider_name);
        for tool in tools {
            catalog.insert(tool.name.clone(), tool);
        }
        drop(catalog);

        self.providers.write().await.insert(provider_name, provider);
        Ok(())
    }

    /// The full tool catalog across every registered provider.
    pub async fn list(&self) -> Vec<ToolDescriptor> {
        self.catalog.read().await.values().cloned().collect()
    }

    /// The provider name that owns `tool_name`, if registered.
    pub async fn lookup_provider(&self, tool_name: &str) -> Option<String> {
        self.catalog
            .read()
            .await
            .get(tool_name)
            .map(|d| d.provider_name.clone())
    }

    /// Every registered provider's expert-instruction blob, for providers
    /// that registered one (§4.10 step 2).
    pub async fn expert_instructions(&self) -> Vec<String> {
        self.providers
            .read()
            .await
            .values()
            .filter_map(|provider| provider.expert_instructions())
            .collect()
    }

    /// Invoke `tool_name` with `arguments`. Never returns `Err` to the
    /// caller for provider-side failures — those are coerced into an
    /// `is_error: true` result, per §4.1.
    pub async fn invoke(&self, tool_name: &str, arguments: Value) -> ToolInvocationResult {
        let Some(provider_name) = self.lookup_provider(tool_name).await else {
            return ToolInvocationResult::error(format!("unknown tool: {tool_name}"));
        };

        let provider = self.providers.read().await.get(&provider_name).cloned();
        let Some(provider) = provider else {
            return ToolInvocationResult::error(format!(
                "provider '{provider_name}' is no longer registered"
            ));
        };

        match provider.invoke(tool_name, arguments).await {
            Ok(result) => result,
            Err(err) => ToolInvocationResult::error(err.to_string()),
        }
    }
}
