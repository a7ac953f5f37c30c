//! Persisted email ingestion state: the polling watermark, the thread →
//! conversation map, and trigger rules (§3, §4.7, §4.8).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::model::{EmailTriggerRule, PollingWatermark};

use super::{atomic_write_json, read_json};

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct ThreadMap {
    #[serde(default)]
    thread_to_conversation: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct TriggerRuleSet {
    #[serde(default)]
    rules: Vec<EmailTriggerRule>,
}

/// Single-file-per-concern storage for the email pipeline's side state.
/// All three files are independent and guarded by their own lock, since
/// they're written by different components (poller vs. bridge vs. API).
pub struct EmailStateStore {
    watermark_path: PathBuf,
    threads_path: PathBuf,
    triggers_path: PathBuf,
    watermark_lock: Mutex<()>,
    threads_lock: Mutex<()>,
    triggers_lock: Mutex<()>,
}

impl EmailStateStore {
    /// Open a store rooted at `home_dir`.
    pub fn new(home_dir: &Path) -> Self {
        Self {
            watermark_path: home_dir.join("email-state.json"),
            threads_path: home_dir.join("email-threads.json"),
            triggers_path: home_dir.join("email-triggers.json"),
            watermark_lock: Mutex::new(()),
            threads_lock: Mutex::new(()),
            triggers_lock: Mutex::new(()),
        }
    }

    /// The poller's current position, or the zero value if none has been
    /// persisted yet.
    pub async fn load_watermark(&self) -> Result<PollingWatermark, StorageError> {
        Ok(read_json(&self.watermark_path).await?.unwrap_or_default())
    }

    /// Persist the poller's position after a successful page.
    pub async fn save_watermark(&self, watermark: &PollingWatermark) -> Result<(), StorageError> {
        let _guard = self.watermark_lock.lock().await;
        atomic_write_json(&self.watermark_path, watermark).await
    }

    /// Look up the conversation bound to a mail thread, if the bridge has
    /// already created one.
    pub async fn conversation_for_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<String>, StorageError> {
        let map: ThreadMap = read_json(&self.threads_path).await?.unwrap_or_default();
        Ok(map.thread_to_conversation.get(thread_id).cloned())
    }

    /// Record that `thread_id` now maps to `conversation_id`. Idempotent —
    /// calling twice with the same pair is a no-op change.
    pub async fn bind_thread(
        &self,
        thread_id: &str,
        conversation_id: &str,
    ) -> Result<(), StorageError> {
        let _guard = self.threads_lock.lock().await;
        let mut map: ThreadMap = read_json(&self.threads_path).await?.unwrap_or_default();
        map.thread_to_conversation
            .insert(thread_id.to_string(), conversation_id.to_string());
        atomic_write_json(&self.threads_path, &map).await
    }

    /// All persisted trigger rules, in storage order.
    pub async fn list_triggers(&self) -> Result<Vec<EmailTriggerRule>, StorageError> {
        let set: TriggerRuleSet = read_json(&self.triggers_path).await?.unwrap_or_default();
        Ok(set.rules)
    }

    /// Append or replace a trigger rule by id.
    pub async fn upsert_trigger(&self, rule: EmailTriggerRule) -> Result<(), StorageError> {
        let _guard = self.triggers_lock.lock().await;
        let mut set: TriggerRuleSet = read_json(&self.triggers_path).await?.unwrap_or_default();
        match set.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => set.rules.push(rule),
        }
        atomic_write_json(&self.triggers_path, &set).await
    }

    /// Remove a trigger rule by id. A no-op if the id is absent.
    pub async fn delete_trigger(&self, id: &str) -> Result<(), StorageError> {
        let _guard = self.triggers_lock.lock().await;
        let mut set: TriggerRuleSet = read_json(&self.triggers_path).await?.unwrap_or_default();
        set.rules.retain(|r| r.id != id);
        atomic_write_json(&self.triggers_path, &set).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriggerConditions;

    #[tokio::test]
    async fn watermark_defaults_to_zero_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmailStateStore::new(dir.path());
        let watermark = store.load_watermark().await.unwrap();
        assert_eq!(watermark.total_processed, 0);
        assert!(watermark.last_seen_id.is_none());
    }

    #[tokio::test]
    async fn watermark_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmailStateStore::new(dir.path());
        let watermark = PollingWatermark {
            last_seen_id: Some("m42".to_string()),
            last_seen_at: Some(chrono::Utc::now()),
            total_processed: 7,
        };
        store.save_watermark(&watermark).await.unwrap();
        let loaded = store.load_watermark().await.unwrap();
        assert_eq!(loaded.last_seen_id, Some("m42".to_string()));
        assert_eq!(loaded.total_processed, 7);
    }

    #[tokio::test]
    async fn thread_binding_is_idempotent_and_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmailStateStore::new(dir.path());
        assert_eq!(store.conversation_for_thread("t1").await.unwrap(), None);

        store.bind_thread("t1", "c1").await.unwrap();
        store.bind_thread("t1", "c1").await.unwrap();
        assert_eq!(
            store.conversation_for_thread("t1").await.unwrap(),
            Some("c1".to_string())
        );
    }

    #[tokio::test]
    async fn trigger_upsert_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmailStateStore::new(dir.path());
        let rule = EmailTriggerRule {
            id: "r1".to_string(),
            workflow_id: "wf1".to_string(),
            enabled: true,
            conditions: TriggerConditions::default(),
        };
        store.upsert_trigger(rule.clone()).await.unwrap();

        let mut updated = rule.clone();
        updated.enabled = false;
        store.upsert_trigger(updated).await.unwrap();

        let rules = store.list_triggers().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(!rules[0].enabled);
    }

    #[tokio::test]
    async fn trigger_delete_removes_rule() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmailStateStore::new(dir.path());
        let rule = EmailTriggerRule {
            id: "r1".to_string(),
            workflow_id: "wf1".to_string(),
            enabled: true,
            conditions: TriggerConditions::default(),
        };
        store.upsert_trigger(rule).await.unwrap();
        store.delete_trigger("r1").await.unwrap();
        assert!(store.list_triggers().await.unwrap().is_empty());
    }
}
