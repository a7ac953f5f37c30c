//! Workflow, step, and execution records (§3 of the specification).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An input-template value: either a literal string or a reference that
/// resolves at run time to another step's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputValue {
    /// A literal value, passed through unchanged.
    Literal {
        /// The literal string.
        value: String,
    },
    /// A reference to a producer step's output, resolved with a dotted
    /// JSON path (e.g. `.a.b.0.c`).
    Reference {
        /// The id of the step whose output is read.
        step_id: String,
        /// The dotted JSON path applied to that step's output.
        json_path: String,
    },
}

/// How a step's failure affects the rest of the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// A failure transitions the whole execution to `failed`.
    Stop,
    /// A failure is recorded but downstream steps proceed with empty input.
    Skip,
    /// Re-invoke up to 3 total attempts with 1s/2s backoff, then behave as `Stop`.
    Retry,
}

/// One node of a workflow's step DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the owning workflow.
    pub id: String,
    /// Display name shown to the client.
    pub name: String,
    /// The tool to invoke, resolved through the Tool Router.
    pub tool_name: String,
    /// The provider that registered `tool_name`, cached at definition time.
    pub provider_name: String,
    /// Parameter name -> literal or reference.
    pub input: HashMap<String, InputValue>,
    /// Step ids that must be `success` before this step may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// What to do if this step's tool invocation errors.
    pub error_policy: ErrorPolicy,
}

/// The rule that starts an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// A 5-field cron expression, matched per `crate::cron`.
    Cron {
        /// The raw expression, e.g. `"*/5 * * * *"`.
        expression: String,
    },
    /// An in-process event subscription.
    Event {
        /// Event source, e.g. `"email"`.
        source: String,
        /// Event type, e.g. `"email_received"`.
        event_type: String,
        /// Optional AND-combined key/value filter on the event's data map.
        #[serde(default)]
        filter: Option<HashMap<String, String>>,
    },
}

/// Per-workflow notification preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationPreferences {
    /// Notify when an execution starts.
    #[serde(default)]
    pub on_start: bool,
    /// Notify when an execution completes successfully.
    #[serde(default)]
    pub on_complete: bool,
    /// Notify when an execution fails.
    #[serde(default)]
    pub on_error: bool,
    /// Notify after each step completes.
    #[serde(default)]
    pub on_step_complete: bool,
}

/// A persisted automation: trigger + step DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier, assigned at creation.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Whether the scheduler binds this workflow to its trigger.
    pub enabled: bool,
    /// Cron or event trigger.
    pub trigger: Trigger,
    /// Ordered step DAG. Non-empty when `enabled`.
    pub steps: Vec<Step>,
    /// Notification preferences.
    #[serde(default)]
    pub notify: NotificationPreferences,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last-update instant.
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Verify the invariants from §3: dependency references resolve within
    /// the workflow, the dependency graph is acyclic, and an enabled
    /// workflow has at least one step.
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.steps.is_empty() {
            return Err("enabled workflow must have at least one step".to_string());
        }
        let ids: std::collections::HashSet<&str> =
            self.steps.iter().map(|s| s.id.as_str()).collect();
        if ids.len() != self.steps.len() {
            return Err("duplicate step id".to_string());
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ));
                }
            }
        }
        if let Some(cycle) = find_cycle(&self.steps) {
            return Err(format!("dependency cycle through step '{cycle}'"));
        }
        Ok(())
    }

    /// Project this workflow into the summary shape returned by `list()`.
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            enabled: self.enabled,
            step_count: self.steps.len(),
            updated_at: self.updated_at,
        }
    }
}

/// Depth-first search for a cycle in the `dependsOn` graph; returns the id
/// of a step found on the recursion stack a second time, if any.
fn find_cycle(steps: &[Step]) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Step>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<String> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(id.to_string()),
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        if let Some(step) = by_id.get(id) {
            for dep in &step.depends_on {
                if let Some(cycle) = visit(dep.as_str(), by_id, marks) {
                    return Some(cycle);
                }
            }
        }
        marks.insert(id, Mark::Done);
        None
    }

    for step in steps {
        if let Some(cycle) = visit(step.id.as_str(), &by_id, &mut marks) {
            return Some(cycle);
        }
    }
    None
}

/// The projection returned by `WorkflowStore::list()`; never stored
/// redundantly, always computed from the full `Workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// The workflow's id.
    pub id: String,
    /// The workflow's display name.
    pub name: String,
    /// Whether the workflow is enabled.
    pub enabled: bool,
    /// Number of steps in the DAG.
    pub step_count: usize,
    /// Last-update instant.
    pub updated_at: DateTime<Utc>,
}

/// Terminal and in-flight states of a `WorkflowExecution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created but not yet dispatched.
    Pending,
    /// At least one step has started.
    Running,
    /// All steps resolved without a `stop`-policy failure.
    Completed,
    /// A `stop`-policy (or exhausted `retry`-policy) step failed.
    Failed,
    /// Cancelled before reaching a terminal state naturally.
    Cancelled,
}

impl ExecutionStatus {
    /// Executions in `Completed`, `Failed`, or `Cancelled` are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet eligible to run (dependencies outstanding).
    Pending,
    /// Currently invoking its tool.
    Running,
    /// The tool invocation returned `isError=false`.
    Success,
    /// The tool invocation returned `isError=true`, or retries were exhausted.
    Error,
    /// A dependency resolved `Error` or `Skipped` and this step's policy is not `Skip`.
    Skipped,
}

/// The outcome of one step within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The step's id, snapshotted from the definition.
    pub step_id: String,
    /// The step's display name, snapshotted from the definition.
    pub step_name: String,
    /// Current status.
    pub status: StepStatus,
    /// When the step transitioned out of `Pending`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// The tool's raw text output, if it ran.
    pub output: Option<String>,
    /// A human-readable error, if `status == Error`.
    pub error: Option<String>,
}

impl StepResult {
    /// A freshly-created, not-yet-started result for `step`.
    pub fn pending(step: &Step) -> Self {
        Self {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
        }
    }
}

/// A single run of a workflow, persisted in the execution journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique identifier.
    pub id: String,
    /// The workflow that was run.
    pub workflow_id: String,
    /// Snapshot of the workflow's name at execution time.
    pub workflow_name: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Human-readable description of what fired this execution.
    pub trigger_info: String,
    /// Step results in declaration order.
    pub steps: Vec<StepResult>,
}

impl WorkflowExecution {
    /// `true` once every step transition observed so far falls within
    /// `[started_at, completed_at]`, per the invariant in §8.
    pub fn timestamps_well_ordered(&self) -> bool {
        let Some(completed) = self.completed_at else {
            return true;
        };
        self.steps.iter().all(|s| {
            s.started_at.is_none_or(|t| t >= self.started_at && t <= completed)
                && s.completed_at.is_none_or(|t| t >= self.started_at && t <= completed)
        })
    }
}
