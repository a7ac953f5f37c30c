//! The Session Gateway (C11): one WebSocket endpoint, typed envelope
//! dispatch, and broadcast fan-out for asynchronous updates (§4.11).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use love_me_core::cron::CronExpression;
use love_me_core::email::{EmailProvider, GmailProvider};
use love_me_core::error::ValidationError;
use love_me_core::llm::{strip_one_markdown_fence, LlmRequest, LlmStreamEvent, TurnEvent};
use love_me_core::model::{EmailTriggerRule, MessageRole, StoredMessage, TriggerConditions, Workflow};
use love_me_core::workflow::ExecutorCallbacks;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::notify::ClientRunCallbacks;
use crate::state::AppState;

type Tx = mpsc::UnboundedSender<String>;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut broadcast_rx = state.broadcast_tx.subscribe();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<String>();

    let _ = direct_tx.send(status_envelope(&state).await);

    let reader_state = state.clone();
    let reader_tx = direct_tx.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let state = reader_state.clone();
                    let tx = reader_tx.clone();
                    let text = text.to_string();
                    tokio::spawn(async move { dispatch(state, text, tx).await });
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "websocket read error");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            msg = direct_rx.recv() => {
                match msg {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            broadcast = broadcast_rx.recv() => {
                match broadcast {
                    Ok(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "client lagged behind broadcast queue");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = &mut reader => break,
        }
    }
    reader.abort();
}

async fn status_envelope(state: &Arc<AppState>) -> String {
    let conversations = state.conversations.list_all().await.map(|v| v.len()).unwrap_or(0);
    let workflows = state.workflows.list().await.map(|v| v.len()).unwrap_or(0);
    let tools = state.tools.list().await.len();
    let email_configured = state.email_poller.read().await.is_some();
    let llm_configured = state.coordinator.is_some();

    serde_json::to_string(&json!({
        "type": "status",
        "metadata": {
            "conversations": {"int": conversations},
            "workflows": {"int": workflows},
            "tools": {"int": tools},
            "emailConfigured": {"bool": email_configured},
            "llmConfigured": {"bool": llm_configured},
        },
    }))
    .unwrap_or_default()
}

fn send(tx: &Tx, envelope: Value) {
    if let Ok(text) = serde_json::to_string(&envelope) {
        let _ = tx.send(text);
    }
}

fn send_error(tx: &Tx, code: &str, message: &str, id: Option<&str>) {
    send(
        tx,
        json!({
            "type": "error",
            "id": id,
            "metadata": {
                "code": {"string": code},
                "message": {"string": message},
            },
        }),
    );
}

fn required_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, GatewayError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::MissingField { field: field.to_string() }.into())
}

async fn dispatch(state: Arc<AppState>, text: String, tx: Tx) {
    let value: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            send_error(&tx, "INVALID_DATA", &format!("malformed envelope: {e}"), None);
            return;
        }
    };
    let id = value.get("id").and_then(Value::as_str).map(str::to_string);

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(k) => k.to_string(),
        None => {
            send_error(&tx, "MISSING_FIELD", "missing required field: type", None);
            return;
        }
    };

    if let Err(e) = route(&state, &kind, &value, &tx).await {
        send_error(&tx, e.code(), &e.message(), id.as_deref());
    }
}

async fn route(state: &Arc<AppState>, kind: &str, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    match kind {
        "ping" => {
            send(tx, json!({"type": "pong"}));
            Ok(())
        }
        "user_message" => handle_user_message(state.clone(), value, tx.clone()).await,
        "new_conversation" => handle_new_conversation(state, value, tx).await,
        "load_conversation" => handle_load_conversation(state, value, tx).await,
        "delete_conversation" => handle_delete_conversation(state, value, tx).await,
        "list_conversations" => handle_list_conversations(state, tx).await,
        "create_workflow" => handle_create_workflow(state, value, tx).await,
        "update_workflow" => handle_update_workflow(state, value, tx).await,
        "delete_workflow" => handle_delete_workflow(state, value, tx).await,
        "list_workflows" => handle_list_workflows(state, tx).await,
        "get_workflow" => handle_get_workflow(state, value, tx).await,
        "run_workflow" => handle_run_workflow(state, value, tx).await,
        "cancel_execution" => handle_cancel_execution(state, value, tx).await,
        "list_executions" => handle_list_executions(state, value, tx).await,
        "get_execution" => handle_get_execution(state, value, tx).await,
        "list_tools" => handle_list_tools(state, tx).await,
        "parse_schedule" => handle_parse_schedule(value, tx),
        "build_workflow" => handle_build_workflow(state, value, tx).await,
        "email_status" => handle_email_status(state, tx).await,
        "email_auth" => handle_email_auth(state, value, tx).await,
        "email_poll" => handle_email_poll(state, tx).await,
        "email_polling_update" => handle_email_polling_update(state, value, tx).await,
        "create_email_trigger" => handle_create_email_trigger(state, value, tx).await,
        "update_email_trigger" => handle_update_email_trigger(state, value, tx).await,
        "delete_email_trigger" => handle_delete_email_trigger(state, value, tx).await,
        "list_email_triggers" => handle_list_email_triggers(state, tx).await,
        other => Err(ValidationError::UnknownType { message_type: other.to_string() }.into()),
    }
}

// ---- Conversations (C9, C10) ----------------------------------------------

fn turn_event_envelope(conversation_id: &str, event: TurnEvent) -> Value {
    match event {
        TurnEvent::ThinkingChunk { text } => json!({
            "type": "thinking_chunk", "conversationId": conversation_id, "content": text,
        }),
        TurnEvent::ThinkingDone { duration_secs } => json!({
            "type": "thinking_done", "conversationId": conversation_id,
            "metadata": {"durationSecs": {"double": duration_secs}},
        }),
        TurnEvent::AssistantChunk { text } => json!({
            "type": "assistant_chunk", "conversationId": conversation_id, "content": text,
        }),
        TurnEvent::ToolCallStart { tool_id, tool_name, provider_name } => json!({
            "type": "tool_call_start", "conversationId": conversation_id, "id": tool_id,
            "metadata": {
                "toolName": {"string": tool_name},
                "providerName": {"string": provider_name},
            },
        }),
        TurnEvent::ToolCallDone { tool_id, tool_name, success, result, duration_secs } => json!({
            "type": "tool_call_done", "conversationId": conversation_id, "id": tool_id,
            "content": result,
            "metadata": {
                "toolName": {"string": tool_name},
                "success": {"bool": success},
                "durationSecs": {"double": duration_secs},
            },
        }),
        TurnEvent::AssistantDone => json!({
            "type": "assistant_done", "conversationId": conversation_id,
        }),
        TurnEvent::Error { message } => json!({
            "type": "error", "conversationId": conversation_id, "content": message,
        }),
    }
}

async fn handle_user_message(state: Arc<AppState>, value: &Value, tx: Tx) -> Result<(), GatewayError> {
    let conversation_id = required_str(value, "conversationId")?.to_string();
    let content = required_str(value, "content")?.to_string();

    let coordinator = state
        .coordinator
        .clone()
        .ok_or_else(|| GatewayError::BadEnvelope("no LLM provider configured".to_string()))?;

    {
        let mut active = state.active_turns.lock().await;
        if !active.insert(conversation_id.clone()) {
            return Err(GatewayError::BadEnvelope(format!(
                "a turn is already running for conversation {conversation_id}"
            )));
        }
    }

    let cancel = CancellationToken::new();
    let emit_conversation_id = conversation_id.clone();
    let on_event = move |event: TurnEvent| {
        send(&tx, turn_event_envelope(&emit_conversation_id, event));
    };
    coordinator.run_turn(&conversation_id, &content, cancel, on_event).await;

    state.active_turns.lock().await.remove(&conversation_id);
    Ok(())
}

async fn handle_new_conversation(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let title = value.get("content").and_then(Value::as_str).map(str::to_string);
    let conversation = state.conversations.create(title).await?;
    send(
        tx,
        json!({
            "type": "conversation_created",
            "conversationId": conversation.id,
            "content": serde_json::to_string(&conversation).unwrap_or_default(),
        }),
    );
    Ok(())
}

async fn handle_load_conversation(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let id = required_str(value, "conversationId")?;
    let conversation = state
        .conversations
        .load(id)
        .await?
        .ok_or_else(|| GatewayError::BadEnvelope(format!("unknown conversation id {id}")))?;
    send(
        tx,
        json!({
            "type": "conversation_loaded",
            "conversationId": id,
            "content": serde_json::to_string(&conversation).unwrap_or_default(),
        }),
    );
    Ok(())
}

async fn handle_delete_conversation(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let id = required_str(value, "conversationId")?;
    state.conversations.delete(id).await?;
    send(tx, json!({"type": "conversation_deleted", "conversationId": id}));
    Ok(())
}

async fn handle_list_conversations(state: &Arc<AppState>, tx: &Tx) -> Result<(), GatewayError> {
    let summaries = state.conversations.list_all().await?;
    send(
        tx,
        json!({
            "type": "conversation_list",
            "content": serde_json::to_string(&summaries).unwrap_or_default(),
        }),
    );
    Ok(())
}

// ---- Workflows (C4, C5, C6) ------------------------------------------------

fn workflow_envelope(kind: &str, def: &Workflow) -> Value {
    json!({
        "type": kind,
        "id": def.id,
        "content": serde_json::to_string(def).unwrap_or_default(),
    })
}

async fn handle_create_workflow(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let content = required_str(value, "content")?;
    let mut raw: Value = serde_json::from_str(content)
        .map_err(|e| GatewayError::BadEnvelope(format!("invalid workflow JSON: {e}")))?;
    let obj = raw
        .as_object_mut()
        .ok_or_else(|| GatewayError::BadEnvelope("workflow must be a JSON object".to_string()))?;
    obj.entry("id").or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
    let now = Value::String(chrono::Utc::now().to_rfc3339());
    obj.entry("created_at").or_insert_with(|| now.clone());
    obj.entry("updated_at").or_insert(now);
    obj.entry("notify").or_insert_with(|| {
        serde_json::to_value(love_me_core::model::NotificationPreferences::default()).unwrap()
    });
    obj.entry("description").or_insert_with(|| Value::String(String::new()));

    let def: Workflow = serde_json::from_value(raw)
        .map_err(|e| GatewayError::BadEnvelope(format!("invalid workflow JSON: {e}")))?;
    def.validate().map_err(GatewayError::BadEnvelope)?;
    let def = state.workflows.create(def).await?;
    state.scheduler.rebind(&def.id).await?;
    send(tx, workflow_envelope("workflow_created", &def));
    Ok(())
}

async fn handle_update_workflow(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let id = required_str(value, "id")?.to_string();
    let existing = state
        .workflows
        .get(&id)
        .await?
        .ok_or_else(|| GatewayError::BadEnvelope(format!("unknown workflow id {id}")))?;
    let content = required_str(value, "content")?;
    let mut raw: Value = serde_json::from_str(content)
        .map_err(|e| GatewayError::BadEnvelope(format!("invalid workflow JSON: {e}")))?;
    let obj = raw
        .as_object_mut()
        .ok_or_else(|| GatewayError::BadEnvelope("workflow must be a JSON object".to_string()))?;
    obj.insert("id".to_string(), Value::String(id.clone()));
    obj.entry("created_at")
        .or_insert_with(|| serde_json::to_value(existing.created_at).unwrap());
    obj.insert("updated_at".to_string(), serde_json::to_value(existing.updated_at).unwrap());

    let def: Workflow = serde_json::from_value(raw)
        .map_err(|e| GatewayError::BadEnvelope(format!("invalid workflow JSON: {e}")))?;
    def.validate().map_err(GatewayError::BadEnvelope)?;
    let def = state.workflows.update(def).await?;
    state.scheduler.rebind(&def.id).await?;
    send(tx, workflow_envelope("workflow_updated", &def));
    Ok(())
}

async fn handle_delete_workflow(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let id = required_str(value, "id")?.to_string();
    state.workflows.delete(&id).await?;
    state.scheduler.unbind(&id).await;
    send(tx, json!({"type": "workflow_deleted", "id": id}));
    Ok(())
}

async fn handle_list_workflows(state: &Arc<AppState>, tx: &Tx) -> Result<(), GatewayError> {
    let summaries = state.workflows.list().await?;
    send(
        tx,
        json!({"type": "workflow_list", "content": serde_json::to_string(&summaries).unwrap_or_default()}),
    );
    Ok(())
}

async fn handle_get_workflow(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let id = required_str(value, "id")?;
    let def = state
        .workflows
        .get(id)
        .await?
        .ok_or_else(|| GatewayError::BadEnvelope(format!("unknown workflow id {id}")))?;
    send(tx, workflow_envelope("workflow_loaded", &def));
    Ok(())
}

async fn handle_run_workflow(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let workflow_id = required_str(value, "id")?.to_string();
    let workflow = state
        .workflows
        .get(&workflow_id)
        .await?
        .ok_or_else(|| GatewayError::BadEnvelope(format!("unknown workflow id {workflow_id}")))?;

    let (exec_tx, exec_rx) = oneshot::channel();
    let callbacks: Arc<dyn ExecutorCallbacks> = Arc::new(ClientRunCallbacks::new(
        state.broadcast_tx.clone(),
        state.notifications.clone(),
        workflow.notify,
        exec_tx,
    ));

    let executor = state.executor.clone();
    tokio::spawn(async move {
        executor.execute(&workflow, "manual".to_string(), callbacks).await;
    });

    if let Ok(execution_id) = exec_rx.await {
        send(
            tx,
            json!({
                "type": "run_workflow_started",
                "id": workflow_id,
                "metadata": {"executionId": {"string": execution_id}},
            }),
        );
    }
    Ok(())
}

async fn handle_cancel_execution(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let execution_id = required_str(value, "id")?;
    state.executor.cancel(execution_id).await;
    send(tx, json!({"type": "execution_cancelled", "id": execution_id}));
    Ok(())
}

async fn handle_list_executions(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let workflow_id = required_str(value, "id")?;
    let executions = state.workflows.list_executions(workflow_id).await?;
    send(
        tx,
        json!({
            "type": "execution_list",
            "id": workflow_id,
            "content": serde_json::to_string(&executions).unwrap_or_default(),
        }),
    );
    Ok(())
}

async fn handle_get_execution(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let id = required_str(value, "id")?;
    let execution = state
        .workflows
        .get_execution(id)
        .await?
        .ok_or_else(|| GatewayError::BadEnvelope(format!("unknown execution id {id}")))?;
    send(
        tx,
        json!({
            "type": "execution_loaded",
            "id": id,
            "content": serde_json::to_string(&execution).unwrap_or_default(),
        }),
    );
    Ok(())
}

// ---- Tools (C1) -------------------------------------------------------------

async fn handle_list_tools(state: &Arc<AppState>, tx: &Tx) -> Result<(), GatewayError> {
    let tools = state.tools.list().await;
    send(
        tx,
        json!({"type": "tool_list", "content": serde_json::to_string(&tools).unwrap_or_default()}),
    );
    Ok(())
}

// ---- Cron preview (C3) -------------------------------------------------------

fn handle_parse_schedule(value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let expression = required_str(value, "content")?;
    match CronExpression::parse(expression) {
        Ok(parsed) => {
            send(
                tx,
                json!({"type": "schedule_parsed", "content": parsed.source(), "metadata": {"valid": {"bool": true}}}),
            );
        }
        Err(e) => {
            send(
                tx,
                json!({
                    "type": "schedule_parsed",
                    "content": expression,
                    "metadata": {"valid": {"bool": false}, "message": {"string": e.to_string()}},
                }),
            );
        }
    }
    Ok(())
}

// ---- LLM-authored workflow builder (C10, §9 Open Question) ------------------

async fn handle_build_workflow(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let description = required_str(value, "content")?.to_string();
    let provider = state
        .llm_provider
        .clone()
        .ok_or_else(|| GatewayError::BadEnvelope("no LLM provider configured".to_string()))?;

    let request = LlmRequest {
        system: "Respond with ONLY a JSON object describing one workflow: \
                 id, name, description, enabled, trigger, steps, notify. \
                 No prose, no explanation."
            .to_string(),
        messages: vec![StoredMessage::text(MessageRole::User, &description)],
        tools: Vec::new(),
    };

    let mut stream = provider
        .stream(request)
        .await
        .map_err(|e| GatewayError::BadEnvelope(e.to_string()))?;

    let mut full_text = String::new();
    while let Some(event) = stream.next().await {
        match event {
            LlmStreamEvent::TextDelta(delta) => full_text.push_str(&delta),
            LlmStreamEvent::Error(message) => return Err(GatewayError::BadEnvelope(message)),
            _ => {}
        }
    }

    let stripped = strip_one_markdown_fence(&full_text);
    let draft: Value = serde_json::from_str(stripped)
        .map_err(|e| GatewayError::BadEnvelope(format!("builder reply was not valid JSON: {e}")))?;
    send(
        tx,
        json!({"type": "workflow_built", "content": serde_json::to_string(&draft).unwrap_or_default()}),
    );
    Ok(())
}

// ---- Email (C7, C8) ---------------------------------------------------------

async fn handle_email_status(state: &Arc<AppState>, tx: &Tx) -> Result<(), GatewayError> {
    let configured = state.email_poller.read().await.is_some();
    let watermark = state.email_state.load_watermark().await?;
    let poll_interval_secs = state.config.read().await.email.poll_interval_secs;
    send(
        tx,
        json!({
            "type": "email_status",
            "metadata": {
                "configured": {"bool": configured},
                "pollIntervalSecs": {"int": poll_interval_secs},
                "totalProcessed": {"int": watermark.total_processed},
            },
        }),
    );
    Ok(())
}

async fn handle_email_auth(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let refresh_token = required_str(value, "content")?.to_string();

    let (client_id, client_secret, interval, ceiling) = {
        let mut config = state.config.write().await;
        config.email.refresh_token = Some(refresh_token.clone());
        config
            .save()
            .map_err(|e| GatewayError::BadEnvelope(e.to_string()))?;
        (
            config.email.client_id.clone().unwrap_or_default(),
            config.email.client_secret.clone().unwrap_or_default(),
            config.email.poll_interval_secs,
            config.email.backoff_ceiling_secs,
        )
    };

    if let Some(poller) = state.email_poller.write().await.take() {
        poller.stop().await;
    }
    let provider: Arc<dyn EmailProvider> = Arc::new(GmailProvider::new(client_id, client_secret, refresh_token));
    let poller = crate::state::build_email_poller(
        provider,
        state.email_state.clone(),
        state.events.clone(),
        state.email_bridge.clone(),
        interval,
        ceiling,
    );
    poller.start().await;
    *state.email_poller.write().await = Some(poller);

    send(tx, json!({"type": "email_auth_complete"}));
    Ok(())
}

async fn handle_email_poll(state: &Arc<AppState>, tx: &Tx) -> Result<(), GatewayError> {
    let poller = state
        .email_poller
        .read()
        .await
        .clone()
        .ok_or_else(|| GatewayError::BadEnvelope("email is not configured".to_string()))?;
    let processed = poller.poll_now().await?;
    send(
        tx,
        json!({"type": "email_poll_result", "metadata": {"processed": {"int": processed}}}),
    );
    Ok(())
}

async fn handle_email_polling_update(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let interval_secs = value
        .get("content")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| GatewayError::BadEnvelope("content must be an interval in seconds".to_string()))?;
    if !(10..=900).contains(&interval_secs) {
        return Err(GatewayError::BadEnvelope(
            "poll interval must be between 10 and 900 seconds".to_string(),
        ));
    }

    {
        let mut config = state.config.write().await;
        config.email.poll_interval_secs = interval_secs;
        config.save().map_err(|e| GatewayError::BadEnvelope(e.to_string()))?;
    }

    send(
        tx,
        json!({"type": "email_polling_updated", "metadata": {"pollIntervalSecs": {"int": interval_secs}}}),
    );
    Ok(())
}

fn trigger_rule_envelope(kind: &str, rule: &EmailTriggerRule) -> Value {
    json!({"type": kind, "id": rule.id, "content": serde_json::to_string(rule).unwrap_or_default()})
}

async fn handle_create_email_trigger(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let content = required_str(value, "content")?;
    let mut raw: Value = serde_json::from_str(content)
        .map_err(|e| GatewayError::BadEnvelope(format!("invalid trigger rule JSON: {e}")))?;
    let obj = raw
        .as_object_mut()
        .ok_or_else(|| GatewayError::BadEnvelope("trigger rule must be a JSON object".to_string()))?;
    obj.entry("id").or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
    obj.entry("enabled").or_insert(Value::Bool(true));
    obj.entry("conditions")
        .or_insert_with(|| serde_json::to_value(TriggerConditions::default()).unwrap());

    let rule: EmailTriggerRule = serde_json::from_value(raw)
        .map_err(|e| GatewayError::BadEnvelope(format!("invalid trigger rule JSON: {e}")))?;
    state.email_state.upsert_trigger(rule.clone()).await?;
    send(tx, trigger_rule_envelope("email_trigger_created", &rule));
    Ok(())
}

async fn handle_update_email_trigger(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let id = required_str(value, "id")?.to_string();
    let content = required_str(value, "content")?;
    let mut raw: Value = serde_json::from_str(content)
        .map_err(|e| GatewayError::BadEnvelope(format!("invalid trigger rule JSON: {e}")))?;
    let obj = raw
        .as_object_mut()
        .ok_or_else(|| GatewayError::BadEnvelope("trigger rule must be a JSON object".to_string()))?;
    obj.insert("id".to_string(), Value::String(id));

    let rule: EmailTriggerRule = serde_json::from_value(raw)
        .map_err(|e| GatewayError::BadEnvelope(format!("invalid trigger rule JSON: {e}")))?;
    state.email_state.upsert_trigger(rule.clone()).await?;
    send(tx, trigger_rule_envelope("email_trigger_updated", &rule));
    Ok(())
}

async fn handle_delete_email_trigger(state: &Arc<AppState>, value: &Value, tx: &Tx) -> Result<(), GatewayError> {
    let id = required_str(value, "id")?.to_string();
    state.email_state.delete_trigger(&id).await?;
    send(tx, json!({"type": "email_trigger_deleted", "id": id}));
    Ok(())
}

async fn handle_list_email_triggers(state: &Arc<AppState>, tx: &Tx) -> Result<(), GatewayError> {
    let rules = state.email_state.list_triggers().await?;
    send(
        tx,
        json!({"type": "email_trigger_list", "content": serde_json::to_string(&rules).unwrap_or_default()}),
    );
    Ok(())
}
