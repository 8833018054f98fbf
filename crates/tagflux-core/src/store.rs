//! Settings persistence for connection and tag configuration.
//!
//! The monitoring core must come up even when its settings file is missing
//! or damaged, so loading never fails: a missing file yields the default
//! empty settings, and a corrupt file is logged and replaced by the default
//! in memory (the damaged file is left on disk untouched).

use crate::config::ConnectionConfig;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Settings {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(
                    "settings file {} not found, starting with empty configuration",
                    self.path.display()
                );
                return Settings::default();
            }
            Err(e) => {
                warn!(
                    "failed to read settings file {}: {}, starting with empty configuration",
                    self.path.display(),
                    e
                );
                return Settings::default();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(
                    "settings file {} is corrupt: {}, starting with empty configuration",
                    self.path.display(),
                    e
                );
                Settings::default()
            }
        }
    }

    /// Write settings via a temp file and rename, so a crash mid-write
    /// cannot leave a half-written settings file behind.
    pub fn save(&self, settings: &Settings) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_string_pretty(settings)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, TagAddress, TagConfig};
    use tempfile::tempdir;

    fn sample_settings() -> Settings {
        Settings {
            connections: vec![ConnectionConfig {
                name: "plant-a".to_string(),
                backend: BackendConfig::Modbus {
                    host: "10.0.0.5".to_string(),
                    port: 502,
                    unit_id: 1,
                },
                enabled: true,
                scan_interval_ms: 1_000,
                tags: vec![TagConfig {
                    name: "flow".to_string(),
                    address: TagAddress::NodeId("ns=2;s=Flow".to_string()),
                    sampling_interval_ms: 500,
                    active: true,
                    alarms_enabled: true,
                    limits: Default::default(),
                    alarm_message: None,
                    outlier: Default::default(),
                }],
            }],
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));
        let settings = sample_settings();
        store.save(&settings).unwrap();
        assert_eq!(store.load(), settings);
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("nope.json"));
        assert_eq!(store.load(), Settings::default());
    }

    #[test]
    fn corrupt_file_yields_default_and_is_left_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = SettingsStore::new(&path);
        assert_eq!(store.load(), Settings::default());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }
}
