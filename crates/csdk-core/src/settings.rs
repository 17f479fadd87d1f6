use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const SETTINGS_FILE: &str = "sdk-settings.json";
pub const SDK_ROOT_ENV: &str = "CSDK_SDK_ROOT";
pub const AUTO_UPDATE_ENV: &str = "CSDK_AUTO_UPDATE";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to write {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("unknown setting `{0}`")]
    UnknownKey(String),

    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkSettings {
    /// Unset means the managed default under the data dir.
    pub sdk_root: Option<PathBuf>,
    pub automatic_updates: bool,
    pub last_automatic_update_millis: Option<i64>,
}

impl Default for SdkSettings {
    fn default() -> Self {
        Self {
            sdk_root: None,
            automatic_updates: true,
            last_automatic_update_millis: None,
        }
    }
}

impl SdkSettings {
    /// `CSDK_SDK_ROOT` wins over the stored value.
    pub fn effective_sdk_root(&self) -> PathBuf {
        if let Ok(root) = std::env::var(SDK_ROOT_ENV) {
            if !root.trim().is_empty() {
                return csdk_util::expand_user(root.trim());
            }
        }
        self.sdk_root
            .clone()
            .unwrap_or_else(csdk_util::managed_sdk_root)
    }

    /// `CSDK_AUTO_UPDATE` wins over the stored value.
    pub fn effective_automatic_updates(&self) -> bool {
        csdk_util::env_flag(AUTO_UPDATE_ENV).unwrap_or(self.automatic_updates)
    }

    /// Applies a `key=value` style change from the command line.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let invalid = || SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "sdk_root" => {
                let value = value.trim();
                self.sdk_root = if value.is_empty() {
                    None
                } else {
                    Some(csdk_util::expand_user(value))
                };
            }
            "automatic_updates" => {
                self.automatic_updates = match value.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" => false,
                    _ => return Err(invalid()),
                };
            }
            "last_automatic_update_millis" => {
                let value = value.trim();
                self.last_automatic_update_millis = if value.is_empty() {
                    None
                } else {
                    Some(value.parse().map_err(|_| invalid())?)
                };
            }
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

/// Settings file plus the in-memory copy shared by the CLI and scheduler.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: Mutex<SdkSettings>,
}

impl SettingsStore {
    pub fn open_default() -> Self {
        Self::load(csdk_util::state_file_path(SETTINGS_FILE))
    }

    /// Missing or unreadable files fall back to defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = load_settings(&path);
        Self {
            path,
            current: Mutex::new(current),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> SdkSettings {
        self.lock().clone()
    }

    /// Mutates and persists the settings, returning the new value.
    pub fn update<F>(&self, change: F) -> Result<SdkSettings, SettingsError>
    where
        F: FnOnce(&mut SdkSettings) -> Result<(), SettingsError>,
    {
        let mut current = self.lock();
        let mut next = current.clone();
        change(&mut next)?;
        csdk_util::write_json_atomic(&self.path, &next).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })?;
        *current = next.clone();
        Ok(next)
    }

    pub fn update_best_effort<F>(&self, change: F)
    where
        F: FnOnce(&mut SdkSettings),
    {
        if let Err(err) = self.update(|settings| {
            change(settings);
            Ok(())
        }) {
            warn!("Failed to persist SDK settings: {}", err);
        }
    }

    pub fn record_automatic_update(&self, at_millis: i64) {
        self.update_best_effort(|settings| {
            settings.last_automatic_update_millis = Some(at_millis);
        });
    }

    fn lock(&self) -> MutexGuard<'_, SdkSettings> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_settings(path: &Path) -> SdkSettings {
    match fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str::<SdkSettings>(&data) {
            Ok(settings) => settings,
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                SdkSettings::default()
            }
        },
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), err);
            }
            SdkSettings::default()
        }
    }
}
