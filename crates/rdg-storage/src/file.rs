//! Filesystem cache backend: one file per key, replaced by atomic rename.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdg_core::CacheError;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::CacheBackend;

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    expires_at: Option<DateTime<Utc>>,
    value: String,
}

#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // Keys are hex encoded so any prefix or report name maps to a safe file name.
    fn entry_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{ENTRY_EXTENSION}", hex::encode(key.as_bytes())))
    }

    fn key_from_path(path: &Path) -> Option<String> {
        if path.extension()?.to_str()? != ENTRY_EXTENSION {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<FileEntry>, CacheError> {
        match fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let path = self.entry_path(key);
        let Some(entry) = self.read_entry(&path).await? else {
            return Ok(None);
        };
        if entry.expires_at.is_some_and(|at| at <= Utc::now()) {
            let _ = fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    /// Writes to a temp file in the same directory and renames it over the entry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root).await?;

        let expires_at = ttl
            .and_then(|ttl| chrono::TimeDelta::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl);
        let body = serde_json::to_vec(&FileEntry { expires_at, value })?;

        let target = self.entry_path(key);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), body.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&body).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut keys = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            if let Some(key) = Self::key_from_path(&item.path()) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_writes_replace_and_leave_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let backend = FileBackend::new(dir.path().join("cache"));

        backend.set("sales:all:summary", "one".into(), None).await.unwrap();
        backend.set("sales:all:summary", "two".into(), None).await.unwrap();
        backend.set("sales:meta", "m".into(), None).await.unwrap();

        assert_eq!(
            backend.get("sales:all:summary").await.unwrap().as_deref(),
            Some("two")
        );
        let mut names = std::fs::read_dir(backend.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));

        assert_eq!(
            backend.keys_with_prefix("sales:").await.unwrap(),
            vec!["sales:all:summary".to_string(), "sales:meta".to_string()]
        );
        assert!(backend.delete("sales:meta").await.unwrap());
        assert!(!backend.delete("sales:meta").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_on_read() {
        let dir = tempdir().expect("tempdir");
        let backend = FileBackend::new(dir.path());
        backend
            .set("k", "v".into(), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.keys_with_prefix("").await.unwrap().is_empty());
    }
}
