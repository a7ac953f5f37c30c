//! Notification fan-out for workflow executions (C6, C11).
//!
//! Two distinct callback paths exist on top of the Executor's plain
//! `ExecutorCallbacks` hook:
//! - [`GatewayNotificationSink`] implements `NotificationSink` and is shared
//!   by the Scheduler and the Email Bridge; it broadcasts a preference-gated
//!   `workflow_notification` envelope to every connected client.
//! - [`ClientRunCallbacks`] is built fresh for a Gateway-initiated
//!   `run_workflow` command. It unconditionally broadcasts raw
//!   step/execution envelopes (the requesting client asked for progress),
//!   additionally routes through the same preference-gated path used by
//!   triggered runs, and signals the freshly minted execution id back to
//!   the handler via a one-shot channel the first time the execution is
//!   observed `Running`.

use std::sync::Mutex;

use love_me_core::model::{ExecutionStatus, StepResult, StepStatus, WorkflowExecution};
use love_me_core::workflow::{preference_routing_callbacks, ExecutorCallbacks, NotificationSink};
use serde_json::json;
use tokio::sync::{broadcast, oneshot};

fn broadcast_envelope(tx: &broadcast::Sender<String>, envelope: serde_json::Value) {
    if let Ok(text) = serde_json::to_string(&envelope) {
        // A lagging/closed receiver is the client's problem, not ours.
        let _ = tx.send(text);
    }
}

fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Cancelled => "cancelled",
    }
}

fn step_status_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::Running => "running",
        StepStatus::Success => "success",
        StepStatus::Error => "error",
        StepStatus::Skipped => "skipped",
    }
}

/// Broadcasts preference-gated `workflow_notification` envelopes for every
/// execution, regardless of what triggered it. Shared by the Scheduler and
/// the Email Bridge.
pub struct GatewayNotificationSink {
    broadcast_tx: broadcast::Sender<String>,
}

impl GatewayNotificationSink {
    pub fn new(broadcast_tx: broadcast::Sender<String>) -> Self {
        Self { broadcast_tx }
    }

    fn send(&self, event: &str, execution: &WorkflowExecution, step: Option<&StepResult>) {
        broadcast_envelope(
            &self.broadcast_tx,
            json!({
                "type": "workflow_notification",
                "id": execution.workflow_id,
                "metadata": {
                    "event": {"string": event},
                    "executionId": {"string": execution.id},
                    "status": {"string": status_label(execution.status)},
                    "stepId": step.map(|s| json!({"string": s.step_id})),
                },
            }),
        );
    }
}

impl NotificationSink for GatewayNotificationSink {
    fn notify_start(&self, execution: &WorkflowExecution) {
        self.send("start", execution, None);
    }

    fn notify_complete(&self, execution: &WorkflowExecution) {
        self.send("complete", execution, None);
    }

    fn notify_error(&self, execution: &WorkflowExecution) {
        self.send("error", execution, None);
    }

    fn notify_step_complete(&self, execution: &WorkflowExecution, step: &StepResult) {
        self.send("step_complete", execution, Some(step));
    }
}

/// Callbacks for one Gateway-initiated `run_workflow` invocation.
pub struct ClientRunCallbacks {
    broadcast_tx: broadcast::Sender<String>,
    preference_callbacks: std::sync::Arc<dyn ExecutorCallbacks>,
    execution_id_tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl ClientRunCallbacks {
    pub fn new(
        broadcast_tx: broadcast::Sender<String>,
        sink: std::sync::Arc<dyn NotificationSink>,
        notify: love_me_core::model::NotificationPreferences,
        execution_id_tx: oneshot::Sender<String>,
    ) -> Self {
        Self {
            broadcast_tx,
            preference_callbacks: preference_routing_callbacks(notify, sink),
            execution_id_tx: Mutex::new(Some(execution_id_tx)),
        }
    }

    fn step_envelope(execution: &WorkflowExecution, step: &StepResult) -> serde_json::Value {
        json!({
            "type": "workflow_step_update",
            "id": execution.workflow_id,
            "metadata": {
                "executionId": {"string": execution.id},
                "stepId": {"string": step.step_id},
                "stepName": {"string": step.step_name},
                "status": {"string": step_status_label(step.status)},
            },
            "content": step.output.clone().or_else(|| step.error.clone()),
        })
    }

    fn execution_envelope(kind: &str, execution: &WorkflowExecution) -> serde_json::Value {
        json!({
            "type": kind,
            "id": execution.workflow_id,
            "metadata": {
                "executionId": {"string": execution.id},
                "status": {"string": status_label(execution.status)},
                "triggerInfo": {"string": execution.trigger_info},
            },
        })
    }
}

impl ExecutorCallbacks for ClientRunCallbacks {
    fn on_step_update(&self, execution: &WorkflowExecution, step: &StepResult) {
        broadcast_envelope(&self.broadcast_tx, Self::step_envelope(execution, step));
        self.preference_callbacks.on_step_update(execution, step);
    }

    fn on_execution_update(&self, execution: &WorkflowExecution) {
        if execution.status == ExecutionStatus::Running {
            if let Some(tx) = self.execution_id_tx.lock().unwrap().take() {
                let _ = tx.send(execution.id.clone());
            }
            broadcast_envelope(
                &self.broadcast_tx,
                Self::execution_envelope("workflow_execution_started", execution),
            );
        } else if execution.status.is_terminal() {
            broadcast_envelope(
                &self.broadcast_tx,
                Self::execution_envelope("workflow_execution_done", execution),
            );
        }
        self.preference_callbacks.on_execution_update(execution);
    }
}
