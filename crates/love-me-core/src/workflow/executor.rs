//! Executes a workflow's step DAG: topological scheduling, dependency
//! gating, variable substitution, error policies, and cooperative
//! cancellation (§4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::{
    ErrorPolicy, ExecutionStatus, InputValue, Step, StepResult, StepStatus, Workflow,
    WorkflowExecution,
};
use crate::storage::WorkflowStore;
use crate::tools::ToolRouter;

use super::jsonpath;

const RETRY_DELAYS_SECS: [u64; 2] = [1, 2];
const MAX_ATTEMPTS: u32 = 3;

/// `onStepUpdate` / `onExecutionUpdate` callbacks set once at construction
/// (§4.5). Both run synchronously between transitions so a caller observing
/// them sees transitions in the order they occur.
pub trait ExecutorCallbacks: Send + Sync {
    /// Invoked after a step's status changes.
    fn on_step_update(&self, execution: &WorkflowExecution, step: &StepResult);
    /// Invoked after the execution's own status changes.
    fn on_execution_update(&self, execution: &WorkflowExecution);
}

/// Runs workflow executions and tracks cancellation flags per execution id.
pub struct Executor {
    tools: Arc<ToolRouter>,
    store: Arc<WorkflowStore>,
    default_step_timeout: Duration,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl Executor {
    /// Build an executor backed by `tools` and `store`, with a default
    /// per-step timeout of `step_timeout_secs` (§4.5, default 300s).
    pub fn new(tools: Arc<ToolRouter>, store: Arc<WorkflowStore>, step_timeout_secs: u64) -> Self {
        Self {
            tools,
            store,
            default_step_timeout: Duration::from_secs(step_timeout_secs),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Request cooperative cancellation of `execution_id`. A no-op if it is
    /// not currently running.
    pub async fn cancel(&self, execution_id: &str) {
        if let Some(token) = self.running.lock().await.get(execution_id) {
            token.cancel();
        }
    }

    /// Drive `definition` to completion, calling `callbacks` on every
    /// status transition and persisting intermediate and terminal state to
    /// the Workflow Store.
    pub async fn execute(
        &self,
        definition: &Workflow,
        trigger_info: String,
        callbacks: Arc<dyn ExecutorCallbacks>,
    ) -> WorkflowExecution {
        let cancel = CancellationToken::new();
        let execution_id = Uuid::new_v4().to_string();
        self.running
            .lock()
            .await
            .insert(execution_id.clone(), cancel.clone());

        let mut steps: Vec<StepResult> = definition.steps.iter().map(StepResult::pending).collect();
        let mut execution = WorkflowExecution {
            id: execution_id.clone(),
            workflow_id: definition.id.clone(),
            workflow_name: definition.name.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            trigger_info,
            steps: steps.clone(),
        };
        callbacks.on_execution_update(&execution);
        let _ = self.store.upsert_execution(&execution).await;

        let id_index: HashMap<&str, usize> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut overall_status = ExecutionStatus::Completed;
        let mut halted = false;

        loop {
            if cancel.is_cancelled() {
                overall_status = ExecutionStatus::Cancelled;
                break;
            }
            if halted {
                break;
            }

            let ready: Vec<usize> = (0..steps.len())
                .filter(|&i| steps[i].status == StepStatus::Pending)
                .filter(|&i| {
                    definition.steps[i]
                        .depends_on
                        .iter()
                        .all(|dep| id_index.get(dep.as_str()).is_some_and(|&j| steps[j].status.is_terminal_in_dag()))
                })
                .collect();

            if ready.is_empty() {
                break;
            }

            let mut to_run = Vec::new();
            for i in ready {
                // A dependency's own error policy decides whether this step
                // proceeds: `skip` on the failed dependency means downstream
                // steps run with its output treated as empty (§4.5); any
                // other policy on a failed/skipped dependency skips this step.
                let dep_failed = definition.steps[i].depends_on.iter().any(|dep| {
                    id_index.get(dep.as_str()).is_some_and(|&j| {
                        matches!(steps[j].status, StepStatus::Error | StepStatus::Skipped)
                            && definition.steps[j].error_policy != ErrorPolicy::Skip
                    })
                });

                if dep_failed {
                    steps[i].status = StepStatus::Skipped;
                    steps[i].started_at = Some(Utc::now());
                    steps[i].completed_at = Some(Utc::now());
                    callbacks.on_step_update(&execution, &steps[i]);
                    continue;
                }

                steps[i].status = StepStatus::Running;
                steps[i].started_at = Some(Utc::now());
                callbacks.on_step_update(&execution, &steps[i]);
                to_run.push(i);
            }

            let mut handles = Vec::new();
            for &i in &to_run {
                let step = definition.steps[i].clone();
                let results_snapshot = steps.clone();
                let tools = self.tools.clone();
                let timeout = self.default_step_timeout;
                let cancel = cancel.clone();
                handles.push((
                    i,
                    tokio::spawn(async move {
                        run_step(&step, &results_snapshot, &tools, timeout, &cancel).await
                    }),
                ));
            }

            for (i, handle) in handles {
                let outcome = handle.await.unwrap_or_else(|_| StepOutcome {
                    status: StepStatus::Error,
                    output: None,
                    error: Some("step task panicked".to_string()),
                });
                steps[i].status = outcome.status;
                steps[i].output = outcome.output;
                steps[i].error = outcome.error;
                steps[i].completed_at = Some(Utc::now());
                callbacks.on_step_update(&execution, &steps[i]);

                if steps[i].status == StepStatus::Error
                    && definition.steps[i].error_policy == ErrorPolicy::Stop
                {
                    overall_status = ExecutionStatus::Failed;
                    halted = true;
                }
                if steps[i].status == StepStatus::Error
                    && definition.steps[i].error_policy == ErrorPolicy::Retry
                {
                    // Retry exhausted inside run_step already behaves as stop.
                    overall_status = ExecutionStatus::Failed;
                    halted = true;
                }
            }

            execution.steps = steps.clone();
        }

        if halted || cancel.is_cancelled() {
            for result in &mut steps {
                if result.status == StepStatus::Pending {
                    result.status = StepStatus::Skipped;
                    result.completed_at = Some(Utc::now());
                }
            }
        } else if steps.iter().any(|s| s.status == StepStatus::Error) {
            overall_status = ExecutionStatus::Failed;
        }

        execution.status = overall_status;
        execution.completed_at = Some(Utc::now());
        execution.steps = steps;
        callbacks.on_execution_update(&execution);
        let _ = self.store.upsert_execution(&execution).await;

        self.running.lock().await.remove(&execution_id);
        execution
    }
}

struct StepOutcome {
    status: StepStatus,
    output: Option<String>,
    error: Option<String>,
}

/// Resolve a step's inputs, invoke its tool (with retry/timeout per its
/// error policy), and report the resulting status.
async fn run_step(
    step: &Step,
    results_so_far: &[StepResult],
    tools: &Arc<ToolRouter>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> StepOutcome {
    let outputs_by_id: HashMap<&str, &StepResult> = results_so_far
        .iter()
        .map(|r| (r.step_id.as_str(), r))
        .collect();

    let arguments = resolve_inputs(step, &outputs_by_id);

    let attempts = if step.error_policy == ErrorPolicy::Retry {
        MAX_ATTEMPTS
    } else {
        1
    };

    let mut last_error = String::new();
    for attempt in 0..attempts {
        if attempt > 0 {
            if cancel.is_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(RETRY_DELAYS_SECS[(attempt - 1) as usize])).await;
        }

        let invocation = tokio::time::timeout(timeout, tools.invoke(&step.tool_name, arguments.clone())).await;
        match invocation {
            Ok(result) if !result.is_error => {
                return StepOutcome {
                    status: StepStatus::Success,
                    output: Some(result.content),
                    error: None,
                };
            }
            Ok(result) => {
                last_error = result.content;
            }
            Err(_) => {
                last_error = format!("step '{}' timed out after {}s", step.id, timeout.as_secs());
            }
        }
    }

    StepOutcome {
        status: StepStatus::Error,
        output: None,
        error: Some(last_error),
    }
}

/// Build the tool arguments object for `step` by resolving each input
/// template entry (§4.5 "Variable substitution").
fn resolve_inputs(step: &Step, outputs_by_id: &HashMap<&str, &StepResult>) -> Value {
    let mut object = serde_json::Map::new();
    for (key, template) in &step.input {
        object.insert(key.clone(), resolve_one(template, outputs_by_id));
    }
    Value::Object(object)
}

fn resolve_one(template: &InputValue, outputs_by_id: &HashMap<&str, &StepResult>) -> Value {
    match template {
        InputValue::Literal { value } => {
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.clone()))
        }
        InputValue::Reference { step_id, json_path } => {
            let Some(producer) = outputs_by_id.get(step_id.as_str()) else {
                return Value::String(String::new());
            };
            let Some(raw_output) = &producer.output else {
                return Value::String(String::new());
            };
            match serde_json::from_str::<Value>(raw_output) {
                Ok(parsed) => jsonpath::apply(&parsed, json_path)
                    .unwrap_or_else(|| Value::String(raw_output.clone())),
                Err(_) => Value::String(raw_output.clone()),
            }
        }
    }
}

trait DagTerminal {
    fn is_terminal_in_dag(self) -> bool;
}

impl DagTerminal for StepStatus {
    fn is_terminal_in_dag(self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Error | StepStatus::Skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::tools::{ToolDescriptor, ToolInvocationResult, ToolProvider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingCallbacks {
        step_events: std::sync::Mutex<Vec<(String, StepStatus)>>,
        execution_events: std::sync::Mutex<Vec<ExecutionStatus>>,
    }

    impl RecordingCallbacks {
        fn new() -> Self {
            Self {
                step_events: std::sync::Mutex::new(Vec::new()),
                execution_events: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl ExecutorCallbacks for RecordingCallbacks {
        fn on_step_update(&self, _execution: &WorkflowExecution, step: &StepResult) {
            self.step_events
                .lock()
                .unwrap()
                .push((step.step_id.clone(), step.status));
        }

        fn on_execution_update(&self, execution: &WorkflowExecution) {
            self.execution_events.lock().unwrap().push(execution.status);
        }
    }

    struct EchoTool;

    #[async_trait]
    impl ToolProvider for EchoTool {
        fn name(&self) -> &str {
            "builtin"
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
            Ok(vec![ToolDescriptor {
                name: "echo".to_string(),
                description: "echoes".to_string(),
                parameter_schema: serde_json::json!({}),
                provider_name: "builtin".to_string(),
            }])
        }

        async fn invoke(&self, _tool_name: &str, arguments: Value) -> Result<ToolInvocationResult, ToolError> {
            Ok(ToolInvocationResult::ok(arguments.to_string()))
        }
    }

    struct FailNTimesTool {
        remaining_failures: AtomicUsize,
    }

    #[async_trait]
    impl ToolProvider for FailNTimesTool {
        fn name(&self) -> &str {
            "builtin"
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
            Ok(vec![ToolDescriptor {
                name: "flaky".to_string(),
                description: "fails a few times then succeeds".to_string(),
                parameter_schema: serde_json::json!({}),
                provider_name: "builtin".to_string(),
            }])
        }

        async fn invoke(&self, _tool_name: &str, _arguments: Value) -> Result<ToolInvocationResult, ToolError> {
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Ok(ToolInvocationResult::error("transient failure"));
            }
            Ok(ToolInvocationResult::ok("recovered"))
        }
    }

    fn literal_input(key: &str, value: &str) -> HashMap<String, InputValue> {
        let mut map = HashMap::new();
        map.insert(
            key.to_string(),
            InputValue::Literal {
                value: value.to_string(),
            },
        );
        map
    }

    fn step(id: &str, tool: &str, deps: &[&str], policy: ErrorPolicy) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            tool_name: tool.to_string(),
            provider_name: "builtin".to_string(),
            input: literal_input("v", "\"hi\""),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            error_policy: policy,
        }
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: "wf1".to_string(),
            name: "test".to_string(),
            description: String::new(),
            enabled: true,
            trigger: crate::model::Trigger::Cron {
                expression: "* * * * *".to_string(),
            },
            steps,
            notify: crate::model::NotificationPreferences::default(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn executor_with(tools: Arc<ToolRouter>) -> (Executor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WorkflowStore::new(dir.path()));
        (Executor::new(tools, store, 300), dir)
    }

    #[tokio::test]
    async fn linear_success_completes() {
        let tools = Arc::new(ToolRouter::new());
        tools.register_provider(Arc::new(EchoTool)).await.unwrap();
        let (executor, _dir) = executor_with(tools).await;

        let wf = workflow(vec![step("a", "echo", &[], ErrorPolicy::Stop)]);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let execution = executor.execute(&wf, "test".to_string(), callbacks).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps[0].status, StepStatus::Success);
        assert_eq!(execution.steps[0].output.as_deref(), Some(r#"{"v":"hi"}"#));
    }

    #[tokio::test]
    async fn stop_policy_skips_unstarted_downstream() {
        let tools = Arc::new(ToolRouter::new());
        struct AlwaysFail;
        #[async_trait]
        impl ToolProvider for AlwaysFail {
            fn name(&self) -> &str {
                "builtin"
            }
            async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
                Ok(vec![ToolDescriptor {
                    name: "boom".to_string(),
                    description: "".to_string(),
                    parameter_schema: serde_json::json!({}),
                    provider_name: "builtin".to_string(),
                }])
            }
            async fn invoke(&self, _t: &str, _a: Value) -> Result<ToolInvocationResult, ToolError> {
                Ok(ToolInvocationResult::error("nope"))
            }
        }
        tools.register_provider(Arc::new(AlwaysFail)).await.unwrap();
        tools.register_provider(Arc::new(EchoTool)).await.unwrap();
        let (executor, _dir) = executor_with(tools).await;

        let wf = workflow(vec![
            step("a", "boom", &[], ErrorPolicy::Stop),
            step("b", "echo", &["a"], ErrorPolicy::Stop),
        ]);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let execution = executor.execute(&wf, "test".to_string(), callbacks).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.steps[0].status, StepStatus::Error);
        assert_eq!(execution.steps[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn skip_policy_on_failing_step_lets_downstream_proceed() {
        let tools = Arc::new(ToolRouter::new());
        struct AlwaysFail;
        #[async_trait]
        impl ToolProvider for AlwaysFail {
            fn name(&self) -> &str {
                "builtin"
            }
            async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
                Ok(vec![ToolDescriptor {
                    name: "boom".to_string(),
                    description: "".to_string(),
                    parameter_schema: serde_json::json!({}),
                    provider_name: "builtin".to_string(),
                }])
            }
            async fn invoke(&self, _t: &str, _a: Value) -> Result<ToolInvocationResult, ToolError> {
                Ok(ToolInvocationResult::error("nope"))
            }
        }
        tools.register_provider(Arc::new(AlwaysFail)).await.unwrap();
        tools.register_provider(Arc::new(EchoTool)).await.unwrap();
        let (executor, _dir) = executor_with(tools).await;

        // "a" fails but carries the `skip` policy itself, so "b" proceeds
        // (treating "a"'s output as empty) rather than being skipped.
        let wf = workflow(vec![
            step("a", "boom", &[], ErrorPolicy::Skip),
            step("b", "echo", &["a"], ErrorPolicy::Stop),
        ]);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let execution = executor.execute(&wf, "test".to_string(), callbacks).await;

        assert_eq!(execution.steps[0].status, StepStatus::Error);
        assert_eq!(execution.steps[1].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn retry_recovers_within_attempt_budget() {
        let tools = Arc::new(ToolRouter::new());
        tools
            .register_provider(Arc::new(FailNTimesTool {
                remaining_failures: AtomicUsize::new(2),
            }))
            .await
            .unwrap();
        let (executor, _dir) = executor_with(tools).await;

        let wf = workflow(vec![step("a", "flaky", &[], ErrorPolicy::Retry)]);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let execution = executor.execute(&wf, "test".to_string(), callbacks).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.steps[0].output.as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn retry_exhausted_behaves_as_stop() {
        let tools = Arc::new(ToolRouter::new());
        tools
            .register_provider(Arc::new(FailNTimesTool {
                remaining_failures: AtomicUsize::new(10),
            }))
            .await
            .unwrap();
        let (executor, _dir) = executor_with(tools).await;

        let wf = workflow(vec![step("a", "flaky", &[], ErrorPolicy::Retry)]);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let execution = executor.execute(&wf, "test".to_string(), callbacks).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.steps[0].status, StepStatus::Error);
    }

    #[tokio::test]
    async fn variable_substitution_resolves_producer_json_path() {
        let tools = Arc::new(ToolRouter::new());
        struct JsonEmitter;
        #[async_trait]
        impl ToolProvider for JsonEmitter {
            fn name(&self) -> &str {
                "builtin"
            }
            async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
                Ok(vec![
                    ToolDescriptor {
                        name: "emit".to_string(),
                        description: "".to_string(),
                        parameter_schema: serde_json::json!({}),
                        provider_name: "builtin".to_string(),
                    },
                    ToolDescriptor {
                        name: "capture".to_string(),
                        description: "".to_string(),
                        parameter_schema: serde_json::json!({}),
                        provider_name: "builtin".to_string(),
                    },
                ])
            }
            async fn invoke(&self, tool_name: &str, arguments: Value) -> Result<ToolInvocationResult, ToolError> {
                if tool_name == "emit" {
                    Ok(ToolInvocationResult::ok(r#"{"out":"hi"}"#))
                } else {
                    Ok(ToolInvocationResult::ok(arguments.to_string()))
                }
            }
        }
        tools.register_provider(Arc::new(JsonEmitter)).await.unwrap();
        let (executor, _dir) = executor_with(tools).await;

        let mut capture_input = HashMap::new();
        capture_input.insert(
            "v".to_string(),
            InputValue::Reference {
                step_id: "a".to_string(),
                json_path: ".out".to_string(),
            },
        );

        let wf = workflow(vec![
            Step {
                id: "a".to_string(),
                name: "a".to_string(),
                tool_name: "emit".to_string(),
                provider_name: "builtin".to_string(),
                input: HashMap::new(),
                depends_on: vec![],
                error_policy: ErrorPolicy::Stop,
            },
            Step {
                id: "b".to_string(),
                name: "b".to_string(),
                tool_name: "capture".to_string(),
                provider_name: "builtin".to_string(),
                input: capture_input,
                depends_on: vec!["a".to_string()],
                error_policy: ErrorPolicy::Stop,
            },
        ]);
        let callbacks = Arc::new(RecordingCallbacks::new());
        let execution = executor.execute(&wf, "test".to_string(), callbacks).await;

        assert_eq!(execution.steps[1].output.as_deref(), Some(r#"{"v":"hi"}"#));
    }

    #[tokio::test]
    async fn cancellation_mid_execution_skips_unstarted_downstream() {
        let tools = Arc::new(ToolRouter::new());
        struct SlowTool;
        #[async_trait]
        impl ToolProvider for SlowTool {
            fn name(&self) -> &str {
                "builtin"
            }
            async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
                Ok(vec![ToolDescriptor {
                    name: "slow".to_string(),
                    description: "".to_string(),
                    parameter_schema: serde_json::json!({}),
                    provider_name: "builtin".to_string(),
                }])
            }
            async fn invoke(&self, _t: &str, _a: Value) -> Result<ToolInvocationResult, ToolError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(ToolInvocationResult::ok("done"))
            }
        }
        tools.register_provider(Arc::new(SlowTool)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WorkflowStore::new(dir.path()));
        let executor = Arc::new(Executor::new(tools, store.clone(), 300));

        let wf = Arc::new(workflow(vec![
            step("a", "slow", &[], ErrorPolicy::Stop),
            step("b", "slow", &["a"], ErrorPolicy::Stop),
        ]));
        let callbacks = Arc::new(RecordingCallbacks::new());

        let executor_clone = executor.clone();
        let wf_clone = wf.clone();
        let callbacks_clone = callbacks.clone();
        let handle = tokio::spawn(async move {
            executor_clone.execute(&wf_clone, "test".to_string(), callbacks_clone).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let executions = store.list_executions("wf1").await.unwrap();
        let execution_id = executions[0].id.clone();
        executor.cancel(&execution_id).await;

        let execution = handle.await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.steps[0].status, StepStatus::Success);
        assert_eq!(execution.steps[1].status, StepStatus::Skipped);
    }
}
