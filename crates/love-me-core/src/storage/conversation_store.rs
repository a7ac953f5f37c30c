//! Durable, append-only conversation storage (C9).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::model::{Conversation, ConversationSummary, StoredMessage};

use super::{atomic_write_json, list_entity_ids, read_json};

/// One file per conversation under `conversations/`. `addMessage` is
/// serialized per conversation id (not globally), matching §4.9 — two
/// conversations can be appended to concurrently.
pub struct ConversationStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    /// Open a store rooted at `home_dir`.
    pub fn new(home_dir: &std::path::Path) -> Self {
        Self {
            dir: home_dir.join("conversations"),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Create a new, empty conversation. `title` defaults to `"New
    /// conversation"` when `None`.
    pub async fn create(&self, title: Option<String>) -> Result<Conversation, StorageError> {
        let id = uuid::Uuid::new_v4().to_string();
        let conversation = Conversation::new(
            id.clone(),
            title.unwrap_or_else(|| "New conversation".to_string()),
        );
        let guard = self.lock_for(&id).await;
        let _permit = guard.lock().await;
        atomic_write_json(&self.path(&id), &conversation).await?;
        Ok(conversation)
    }

    /// Append one message, serialized against any other append to the same
    /// conversation id.
    pub async fn add_message(
        &self,
        id: &str,
        message: StoredMessage,
    ) -> Result<Conversation, StorageError> {
        let guard = self.lock_for(id).await;
        let _permit = guard.lock().await;

        let mut conversation = read_json::<Conversation>(&self.path(id))
            .await?
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })?;
        conversation.last_message_at = message.timestamp;
        conversation.messages.push(message);
        atomic_write_json(&self.path(id), &conversation).await?;
        Ok(conversation)
    }

    /// Load a conversation in full, or `None` if absent.
    pub async fn load(&self, id: &str) -> Result<Option<Conversation>, StorageError> {
        read_json(&self.path(id)).await
    }

    /// Summaries of every stored conversation, newest-first by
    /// `last_message_at`.
    pub async fn list_all(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        let ids = list_entity_ids(&self.dir).await?;
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(conversation) = self.load(&id).await? {
                summaries.push(conversation.summary());
            }
        }
        summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(summaries)
    }

    /// Delete a conversation. Fails if the id is missing.
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let guard = self.lock_for(id).await;
        let _permit = guard.lock().await;
        if self.load(id).await?.is_none() {
            return Err(StorageError::NotFound { id: id.to_string() });
        }
        tokio::fs::remove_file(self.path(id))
            .await
            .map_err(|source| StorageError::Io {
                path: self.path(id).display().to_string(),
                source,
            })
    }
}
