//! Persisted per-plugin enabled flags.

use crate::descriptor::PluginId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read plugin settings {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write plugin settings {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse plugin settings {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize plugin settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub trait SettingsStore: Send + Sync {
    /// `None` when the plugin has never been toggled.
    fn is_enabled(&self, plugin_id: &PluginId) -> Option<bool>;

    fn set_enabled(&self, plugin_id: &PluginId, enabled: bool) -> Result<(), SettingsError>;
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    flags: Mutex<HashMap<PluginId, bool>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn is_enabled(&self, plugin_id: &PluginId) -> Option<bool> {
        self.flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .copied()
    }

    fn set_enabled(&self, plugin_id: &PluginId, enabled: bool) -> Result<(), SettingsError> {
        self.flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.clone(), enabled);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    plugins: BTreeMap<String, PluginSettings>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PluginSettings {
    enabled: bool,
}

/// TOML file of the form
///
/// ```toml
/// [plugins.<plugin id>]
/// enabled = false
/// ```
///
/// The file is read once on open and rewritten on every change.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    state: Mutex<SettingsFile>,
}

impl FileSettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let state = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| SettingsError::Read {
                path: path.clone(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| SettingsError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            SettingsFile::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettingsStore {
    fn is_enabled(&self, plugin_id: &PluginId) -> Option<bool> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .plugins
            .get(plugin_id.as_str())
            .map(|s| s.enabled)
    }

    fn set_enabled(&self, plugin_id: &PluginId, enabled: bool) -> Result<(), SettingsError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = state.clone();
        next.plugins
            .insert(plugin_id.to_string(), PluginSettings { enabled });
        let contents = toml::to_string_pretty(&next)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.path, contents).map_err(|source| SettingsError::Write {
            path: self.path.clone(),
            source,
        })?;
        *state = next;
        Ok(())
    }
}
