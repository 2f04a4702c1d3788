//! YAML endpoint definitions on disk.
//!
//! Every load re-reads the file; every write replaces the whole file through a
//! temp file and rename.

use std::path::{Path, PathBuf};

use rdg_core::env::env_or;
use rdg_core::report::endpoint_entries;
use rdg_core::{ConfigError, ReportCatalog, ReportDefinition};
use serde_yaml::{Mapping, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_CONFIG_PATH: &str = "config/endpoints.yaml";

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    // serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(env_or("RDG_CONFIG_PATH", DEFAULT_CONFIG_PATH))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, err: impl std::fmt::Display) -> ConfigError {
        ConfigError::Io {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// Raw `name -> definition` entries. A missing file holds no endpoints.
    pub async fn load_entries(&self) -> Result<Mapping, ConfigError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Mapping::new()),
            Err(err) => return Err(self.io_error(err)),
        };
        if text.trim().is_empty() {
            return Ok(Mapping::new());
        }
        let document: Value =
            serde_yaml::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        endpoint_entries(document)
    }

    pub async fn load(&self) -> Result<ReportCatalog, ConfigError> {
        Ok(ReportCatalog::from_entries(&self.load_entries().await?))
    }

    pub async fn get(&self, name: &str) -> Result<ReportDefinition, ConfigError> {
        let entries = self.load_entries().await?;
        let raw = entries
            .get(name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        ReportDefinition::from_value(name, raw)
    }

    pub async fn get_raw(&self, name: &str) -> Result<Value, ConfigError> {
        self.load_entries()
            .await?
            .remove(name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))
    }

    /// Adds a new definition; fails when the name is already taken.
    pub async fn create(&self, name: &str, raw: Value) -> Result<ReportDefinition, ConfigError> {
        let definition = ReportDefinition::from_value(name, &raw)?;
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load_entries().await?;
        if entries.contains_key(name) {
            return Err(ConfigError::Duplicate(name.to_string()));
        }
        entries.insert(Value::String(name.to_string()), raw);
        self.save(&entries).await?;
        info!(report = name, "endpoint created");
        Ok(definition)
    }

    /// Validates and then inserts or replaces one definition.
    pub async fn upsert(&self, name: &str, raw: Value) -> Result<ReportDefinition, ConfigError> {
        let definition = ReportDefinition::from_value(name, &raw)?;
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load_entries().await?;
        entries.insert(Value::String(name.to_string()), raw);
        self.save(&entries).await?;
        info!(report = name, "endpoint saved");
        Ok(definition)
    }

    pub async fn remove(&self, name: &str) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load_entries().await?;
        if entries.remove(name).is_none() {
            return Err(ConfigError::NotFound(name.to_string()));
        }
        self.save(&entries).await?;
        info!(report = name, "endpoint removed");
        Ok(())
    }

    /// Writes all entries under `endpoints:`, replacing the file atomically.
    pub async fn save(&self, entries: &Mapping) -> Result<(), ConfigError> {
        let mut root = Mapping::new();
        root.insert(
            Value::String("endpoints".to_string()),
            Value::Mapping(entries.clone()),
        );
        let body = serde_yaml::to_string(&root).map_err(|err| ConfigError::Parse(err.to_string()))?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), body.len()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(err));
        }
        Ok(())
    }
}
