//! External tool providers launched as subprocesses, speaking a
//! line-framed JSON request/response protocol over stdin/stdout.
//!
//! Request line: `{"id":"<uuid>","tool":"<name>","arguments":<json>}`, or
//! for the startup catalog query, `{"id":"<uuid>","listTools":true}`.
//! Response line: `{"id":"<uuid>","content":"<text>","isError":<bool>}` for
//! an invocation, or `{"id":"<uuid>","tools":[...]}` for a catalog query.
//! Every response line carries the `id` of the request it answers, so one
//! reader task can route concurrent in-flight requests by id.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};

use crate::error::ToolError;

use super::{ToolDescriptor, ToolInvocationResult, ToolProvider};

#[derive(Serialize)]
#[serde(untagged)]
enum Request<'a> {
    ListTools {
        id: String,
        #[serde(rename = "listTools")]
        list_tools: bool,
    },
    Invoke {
        id: String,
        tool: &'a str,
        arguments: Value,
    },
}

#[derive(Deserialize)]
struct RawToolDescriptor {
    name: String,
    description: String,
    #[serde(rename = "parameterSchema")]
    parameter_schema: Value,
}

/// One decoded response line, still tagged by which request it answers.
#[derive(Deserialize)]
struct Response {
    id: String,
    #[serde(default)]
    tools: Option<Vec<RawToolDescriptor>>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "isError")]
    is_error: Option<bool>,
}

/// An external tool provider running as a child process. One background
/// task reads response lines and routes them to the pending request by
/// `id`, so `list_tools` and multiple concurrent `invoke` calls share one
/// stdout stream without blocking each other.
pub struct SubprocessToolProvider {
    name: String,
    stdin: Mutex<ChildStdin>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>,
    _child: Mutex<Child>,
}

impl SubprocessToolProvider {
    /// Launch `command` with `args` and start the response-reader task.
    pub async fn spawn(
        name: impl Into<String>,
        command: &str,
        args: &[String],
    ) -> Result<Self, ToolError> {
        let name = name.into();
        let mut child = tokio::process::Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ToolError::ProviderFailure {
                provider: name.clone(),
                message: format!("failed to spawn: {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ToolError::ProviderFailure {
            provider: name.clone(),
            message: "child process has no stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ToolError::ProviderFailure {
            provider: name.clone(),
            message: "child process has no stdout".to_string(),
        })?;

        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = pending.clone();
        let reader_name = name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Ok(response) = serde_json::from_str::<Response>(&line) else {
                            tracing::warn!(provider = %reader_name, "malformed response line");
                            continue;
                        };
                        if let Some(sender) = reader_pending.lock().await.remove(&response.id) {
                            let _ = sender.send(response);
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(provider = %reader_name, "subprocess stdout closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(provider = %reader_name, error = %e, "error reading subprocess stdout");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            name,
            stdin: Mutex::new(stdin),
            pending,
            _child: Mutex::new(child),
        })
    }

    async fn write_line(&self, line: &str) -> Result<(), ToolError> {
        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await
        };
        write.await.map_err(|e| ToolError::ProviderFailure {
            provider: self.name.clone(),
            message: format!("write to subprocess failed: {e}"),
        })
    }

    async fn roundtrip(&self, request: &Request<'_>, id: String) -> Result<Response, ToolError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let line = serde_json::to_string(request).map_err(|e| ToolError::MalformedPayload(e.to_string()))?;
        self.write_line(&line).await?;

        match tokio::time::timeout(std::time::Duration::from_secs(300), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(ToolError::ProviderFailure {
                    provider: self.name.clone(),
                    message: "subprocess closed before responding".to_string(),
                })
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolError::ProviderFailure {
                    provider: self.name.clone(),
                    message: "subprocess invocation timed out".to_string(),
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl ToolProvider for SubprocessToolProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let id = uuid::Uuid::new_v4().to_string();
        let response = self
            .roundtrip(
                &Request::ListTools {
                    id: id.clone(),
                    list_tools: true,
                },
                id,
            )
            .await?;

        let raw = response.tools.ok_or_else(|| ToolError::MalformedPayload(
            "expected a 'tools' array in listTools response".to_string(),
        ))?;

        Ok(raw
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name,
                description: t.description,
                parameter_schema: t.parameter_schema,
                provider_name: self.name.clone(),
            })
            .collect())
    }

    async fn invoke(&self, tool_name: &str, arguments: Value) -> Result<ToolInvocationResult, ToolError> {
        let id = uuid::Uuid::new_v4().to_string();
        let response = self
            .roundtrip(
                &Request::Invoke {
                    id: id.clone(),
                    tool: tool_name,
                    arguments,
                },
                id,
            )
            .await?;

        Ok(ToolInvocationResult {
            content: response.content.unwrap_or_default(),
            is_error: response.is_error.unwrap_or(false),
        })
    }
}
