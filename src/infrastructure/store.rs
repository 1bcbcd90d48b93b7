//! Persistence of the last successfully connected device.

use crate::domain::settings::SettingsService;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Key-value persistence holding one entry: the last connected device uid.
pub trait DeviceStore {
    fn last_device_uid(&self) -> Option<String>;
    fn set_last_device_uid(&mut self, uid: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredState {
    #[serde(default)]
    last_device_uid: Option<String>,
}

/// JSON file backed store.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: StoredState,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring corrupt device store");
                StoredState::default()
            }),
            Err(_) => StoredState::default(),
        };
        Self { path, state }
    }

    /// `<config_dir>/WearableLink/last_device.json`
    pub fn default_path() -> anyhow::Result<PathBuf> {
        Ok(SettingsService::config_dir()?.join("last_device.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceStore for JsonFileStore {
    fn last_device_uid(&self) -> Option<String> {
        self.state.last_device_uid.clone()
    }

    fn set_last_device_uid(&mut self, uid: &str) -> Result<()> {
        if self.state.last_device_uid.as_deref() == Some(uid) {
            return Ok(());
        }
        self.state.last_device_uid = Some(uid.to_string());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.state)?)?;
        debug!(uid, path = %self.path.display(), "last device stored");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    last_device_uid: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_last_device(uid: &str) -> Self {
        Self {
            last_device_uid: Some(uid.to_string()),
        }
    }
}

impl DeviceStore for MemoryStore {
    fn last_device_uid(&self) -> Option<String> {
        self.last_device_uid.clone()
    }

    fn set_last_device_uid(&mut self, uid: &str) -> Result<()> {
        self.last_device_uid = Some(uid.to_string());
        Ok(())
    }
}
