//! JSON snapshot persistence shared by the registry and the ledger
//!
//! Snapshots are written to a uniquely named sibling temp file and renamed
//! into place so a crash mid-write never leaves a truncated file behind.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Read a JSON snapshot, returning `T::default()` if the file does not exist
pub async fn read_json_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        warn!("{} not found, starting empty", path.display());
        return Ok(T::default());
    }

    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Persistence(format!("Failed to read {}: {}", path.display(), e)))?;

    serde_json::from_str(&data)
        .map_err(|e| Error::Persistence(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Write a JSON snapshot atomically
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Persistence(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
    }

    // One temp file per write; concurrent writers must never share it
    let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| Error::Persistence(format!("Failed to write {}: {}", tmp.display(), e)))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::Persistence(format!(
            "Failed to replace {}: {}",
            path.display(),
            e
        )));
    }

    debug!("Saved snapshot to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_yields_default() {
        let dir = tempdir().unwrap();
        let value: HashMap<String, u32> = read_json_or_default(&dir.path().join("none.json"))
            .await
            .unwrap();
        assert!(value.is_empty());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut value = HashMap::new();
        value.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &value).await.unwrap();

        let loaded: HashMap<String, u32> = read_json_or_default(&path).await.unwrap();
        assert_eq!(loaded.get("a"), Some(&1));
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_never_collide() {
        let dir = tempdir().unwrap();
        let path = std::sync::Arc::new(dir.path().join("state.json"));

        let handles: Vec<_> = (0..32u32)
            .map(|i| {
                let path = path.clone();
                tokio::spawn(async move {
                    let mut value = HashMap::new();
                    value.insert("n".to_string(), i);
                    write_json_atomic(&path, &value).await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let loaded: HashMap<String, u32> = read_json_or_default(&path).await.unwrap();
        assert!(loaded.get("n").is_some());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_persistence_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();

        let result: Result<HashMap<String, u32>> = read_json_or_default(&path).await;
        assert!(matches!(result, Err(Error::Persistence(_))));
    }
}
