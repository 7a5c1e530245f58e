//! Persistent key/value settings
//!
//! The build core never touches process-wide state; anything it needs to
//! remember between invocations goes through [`Settings`].

use crate::error::{ConfigError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Narrow persistent-settings collaborator
pub trait Settings: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
    fn save(&self) -> Result<()>;
}

/// Settings backed by a flat YAML string map on disk
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileSettings {
    /// Load settings from `path`. A missing file yields empty settings.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
                    path: path.clone(),
                    message: e.to_string(),
                })?
            }
        } else {
            tracing::debug!("Config file not found at {}, starting empty", path.display());
            BTreeMap::new()
        };

        Ok(Self { path, values })
    }

    /// Load `config.yml` from the default config directory
    pub fn open_default() -> Result<Self> {
        Self::open(crate::config_file_path()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Settings for FileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).filter(|v| !v.is_empty()).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(&self.values).map_err(|e| ConfigError::Write {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        std::fs::write(&self.path, content).map_err(|e| ConfigError::Write {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }
}

/// In-memory settings; `save` only counts calls
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    values: BTreeMap<String, String>,
    saves: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Settings for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).filter(|v| !v.is_empty()).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn save(&self) -> Result<()> {
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = tempdir().unwrap();
        let settings = FileSettings::open(temp_dir.path().join("config.yml")).unwrap();
        assert_eq!(settings.get("anything"), None);
    }

    #[test]
    fn test_set_save_reopen() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.yml");

        let mut settings = FileSettings::open(&path).unwrap();
        settings.set("buildkit_node_id", "abc123");
        settings.save().unwrap();

        let reopened = FileSettings::open(&path).unwrap();
        assert_eq!(reopened.get("buildkit_node_id").as_deref(), Some("abc123"));
    }

    #[test]
    fn test_empty_value_reads_as_unset() {
        let mut settings = MemorySettings::new();
        settings.set("access_token", "");
        assert_eq!(settings.get("access_token"), None);
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.yml");
        std::fs::write(&path, "- not\n- a\n- map\n").unwrap();

        let err = FileSettings::open(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
