//! File-backed storage layer for love-me.
//!
//! Every persisted entity is one JSON file, written with a write-temp +
//! atomic-rename sequence so a crash never leaves a half-written file on
//! disk (§6). Each store owns a single mutex guarding its writes, matching
//! the actor-per-component discipline in §5 — reads never block on it.

pub mod conversation_store;
pub mod email_state;
pub mod workflow_store;

pub use conversation_store::ConversationStore;
pub use email_state::EmailStateStore;
pub use workflow_store::WorkflowStore;

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::StorageError;

/// Serialize `value` as pretty JSON and write it to `path` atomically:
/// write to `<path>.tmp` in the same directory, then `rename` over the
/// destination. `rename` within one filesystem is atomic, so readers never
/// observe a partially-written file.
pub async fn atomic_write_json<T: Serialize + Sync>(
    path: &Path,
    value: &T,
) -> Result<(), StorageError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|source| StorageError::Io {
            path: parent.display().to_string(),
            source,
        })?;

    let rendered = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Decode {
        path: path.display().to_string(),
        source,
    })?;

    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, &rendered)
        .await
        .map_err(|source| StorageError::Io {
            path: tmp_path.display().to_string(),
            source,
        })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|source| StorageError::Io {
            path: path.display().to_string(),
            source,
        })?;
    Ok(())
}

/// Read and decode one JSON entity file. Returns `Ok(None)` if the file
/// does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|source| StorageError::Decode {
                path: path.display().to_string(),
                source,
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StorageError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// List the `.json` entity files directly inside `dir`, returning their
/// file stems (the entity ids). Returns an empty list if `dir` does not
/// exist yet.
pub async fn list_entity_ids(dir: &Path) -> Result<Vec<String>, StorageError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StorageError::Io {
                path: dir.display().to_string(),
                source,
            })
        }
    };

    let mut ids = Vec::new();
    loop {
        let entry = entries.next_entry().await.map_err(|source| StorageError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let Some(entry) = entry else { break };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
    }
    Ok(ids)
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    std::path::PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    #[tokio::test]
    async fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let sample = Sample { value: 42 };

        atomic_write_json(&path, &sample).await.unwrap();
        let read_back: Option<Sample> = read_json(&path).await.unwrap();
        assert_eq!(read_back, Some(sample));
    }

    #[tokio::test]
    async fn read_json_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read_back: Option<Sample> = read_json(&path).await.unwrap();
        assert_eq!(read_back, None);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        atomic_write_json(&path, &Sample { value: 1 }).await.unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn list_entity_ids_returns_stems() {
        let dir = tempfile::tempdir().unwrap();
        atomic_write_json(&dir.path().join("a.json"), &Sample { value: 1 })
            .await
            .unwrap();
        atomic_write_json(&dir.path().join("b.json"), &Sample { value: 2 })
            .await
            .unwrap();

        let mut ids = list_entity_ids(dir.path()).await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn list_entity_ids_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(list_entity_ids(&missing).await.unwrap(), Vec::<String>::new());
    }
}
