//! Durable storage of workflow definitions and the execution journal (C4).

use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::model::{Workflow, WorkflowExecution, WorkflowSummary};

use super::{atomic_write_json, list_entity_ids, read_json};

/// One file per workflow under `workflows/`, one file per execution under
/// `executions/`. A single mutex per directory serializes writes; reads do
/// not take it.
pub struct WorkflowStore {
    workflows_dir: PathBuf,
    executions_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl WorkflowStore {
    /// Open a store rooted at `home_dir` (typically `~/.love-me`).
    pub fn new(home_dir: &std::path::Path) -> Self {
        Self {
            workflows_dir: home_dir.join("workflows"),
            executions_dir: home_dir.join("executions"),
            write_lock: Mutex::new(()),
        }
    }

    fn workflow_path(&self, id: &str) -> PathBuf {
        self.workflows_dir.join(format!("{id}.json"))
    }

    fn execution_path(&self, id: &str) -> PathBuf {
        self.executions_dir.join(format!("{id}.json"))
    }

    /// Summaries of every stored workflow, projected rather than stored
    /// redundantly.
    pub async fn list(&self) -> Result<Vec<WorkflowSummary>, StorageError> {
        let ids = list_entity_ids(&self.workflows_dir).await?;
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(wf) = self.get(&id).await? {
                summaries.push(wf.summary());
            }
        }
        Ok(summaries)
    }

    /// Fetch one workflow by id, or `None` if absent.
    pub async fn get(&self, id: &str) -> Result<Option<Workflow>, StorageError> {
        read_json(&self.workflow_path(id)).await
    }

    /// Create a new workflow. Fails if `def.id` already exists.
    pub async fn create(&self, def: Workflow) -> Result<Workflow, StorageError> {
        def.validate()
            .map_err(|message| StorageError::InvalidDefinition { message })?;
        let _guard = self.write_lock.lock().await;
        if self.get(&def.id).await?.is_some() {
            return Err(StorageError::AlreadyExists { id: def.id.clone() });
        }
        atomic_write_json(&self.workflow_path(&def.id), &def).await?;
        Ok(def)
    }

    /// Replace an existing workflow, bumping `updated_at`. Fails if the id
    /// is missing.
    pub async fn update(&self, mut def: Workflow) -> Result<Workflow, StorageError> {
        def.validate()
            .map_err(|message| StorageError::InvalidDefinition { message })?;
        let _guard = self.write_lock.lock().await;
        if self.get(&def.id).await?.is_none() {
            return Err(StorageError::NotFound { id: def.id.clone() });
        }
        def.updated_at = Utc::now();
        atomic_write_json(&self.workflow_path(&def.id), &def).await?;
        Ok(def)
    }

    /// Delete a workflow. Fails if the id is missing.
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        if self.get(id).await?.is_none() {
            return Err(StorageError::NotFound { id: id.to_string() });
        }
        tokio::fs::remove_file(self.workflow_path(id))
            .await
            .map_err(|source| StorageError::Io {
                path: self.workflow_path(id).display().to_string(),
                source,
            })
    }

    /// Executions belonging to `workflow_id`, most recent first.
    pub async fn list_executions(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowExecution>, StorageError> {
        let ids = list_entity_ids(&self.executions_dir).await?;
        let mut executions = Vec::new();
        for id in ids {
            if let Some(exec) = self.get_execution(&id).await? {
                if exec.workflow_id == workflow_id {
                    executions.push(exec);
                }
            }
        }
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(executions)
    }

    /// Fetch one execution by id, or `None` if absent.
    pub async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, StorageError> {
        read_json(&self.execution_path(id)).await
    }

    /// Insert or overwrite an execution record — the Executor drives
    /// intermediate writes, terminal states are always written before
    /// broadcasting (§7).
    pub async fn upsert_execution(&self, exec: &WorkflowExecution) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        atomic_write_json(&self.execution_path(&exec.id), exec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorPolicy, NotificationPreferences, Trigger};
    use std::collections::HashMap;

    fn workflow(id: &str, enabled: bool) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: id.to_string(),
            name: "wf".to_string(),
            description: String::new(),
            enabled,
            trigger: Trigger::Cron {
                expression: "* * * * *".to_string(),
            },
            steps: if enabled {
                vec![crate::model::Step {
                    id: "s1".to_string(),
                    name: "s1".to_string(),
                    tool_name: "echo".to_string(),
                    provider_name: "builtin".to_string(),
                    input: HashMap::new(),
                    depends_on: vec![],
                    error_policy: ErrorPolicy::Stop,
                }]
            } else {
                vec![]
            },
            notify: NotificationPreferences::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn execution(id: &str, workflow_id: &str) -> WorkflowExecution {
        WorkflowExecution {
            id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_name: "wf".to_string(),
            status: crate::model::ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            trigger_info: "test".to_string(),
            steps: vec![],
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let wf = workflow("wf1", true);
        store.create(wf.clone()).await.unwrap();
        let fetched = store.get("wf1").await.unwrap().unwrap();
        assert_eq!(fetched, wf);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        store.create(workflow("wf1", true)).await.unwrap();
        let err = store.create(workflow("wf1", true)).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn create_rejects_invalid_definition() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let err = store.create(workflow("wf1", true).tap_empty()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn update_bumps_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let wf = store.create(workflow("wf1", true)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let updated = store.update(wf.clone()).await.unwrap();
        assert!(updated.updated_at >= wf.updated_at);
    }

    #[tokio::test]
    async fn update_rejects_missing_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let err = store.update(workflow("missing", true)).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_rejects_missing_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let err = store.delete("missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_projects_summaries_not_full_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        store.create(workflow("wf1", true)).await.unwrap();
        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, "wf1");
        assert_eq!(summaries[0].step_count, 1);
    }

    #[tokio::test]
    async fn executions_filter_by_workflow_and_sort_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let mut older = execution("e1", "wf1");
        older.started_at = Utc::now() - chrono::Duration::seconds(10);
        let newer = execution("e2", "wf1");
        let other = execution("e3", "wf2");

        store.upsert_execution(&older).await.unwrap();
        store.upsert_execution(&newer).await.unwrap();
        store.upsert_execution(&other).await.unwrap();

        let listed = store.list_executions("wf1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "e2");
        assert_eq!(listed[1].id, "e1");
    }

    trait TapEmpty {
        fn tap_empty(self) -> Self;
    }

    impl TapEmpty for Workflow {
        fn tap_empty(mut self) -> Self {
            self.steps.clear();
            self.enabled = true;
            self
        }
    }
}
