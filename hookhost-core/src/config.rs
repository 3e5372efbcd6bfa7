// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Host configuration and the enabled-extension store.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! data_dir = "/var/lib/hookhost"
//! resolve_off_thread = true
//! slow_handler_threshold_ms = 8
//! ```

use crate::error::{HostError, HostResult};
use crate::{CACHE_FILE_PREFIX, CONFIG_FILE_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the extension host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Directory holding the signature caches and the enabled-set file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// File name prefix of per-version signature caches.
    #[serde(default = "default_cache_prefix")]
    pub cache_file_prefix: String,

    /// Name of the enabled-set file inside `data_dir`.
    #[serde(default = "default_config_file")]
    pub config_file_name: String,

    /// Run the signature scan on a blocking worker instead of the caller's thread.
    #[serde(default = "default_resolve_off_thread")]
    pub resolve_off_thread: bool,

    /// Event handlers slower than this are logged.
    #[serde(default = "default_slow_handler_threshold")]
    pub slow_handler_threshold_ms: u64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hookhost")
}

fn default_cache_prefix() -> String {
    CACHE_FILE_PREFIX.to_string()
}

fn default_config_file() -> String {
    CONFIG_FILE_NAME.to_string()
}

fn default_resolve_off_thread() -> bool {
    true
}

fn default_slow_handler_threshold() -> u64 {
    16
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache_file_prefix: default_cache_prefix(),
            config_file_name: default_config_file(),
            resolve_off_thread: default_resolve_off_thread(),
            slow_handler_threshold_ms: default_slow_handler_threshold(),
        }
    }
}

impl HostConfig {
    /// Configuration rooted at `data_dir`, everything else default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> HostResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| HostError::ConfigParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> HostResult<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HostResult<()> {
        if self.cache_file_prefix.is_empty() {
            return Err(HostError::InvalidConfig(
                "cache_file_prefix must not be empty".to_string(),
            ));
        }
        if self.cache_file_prefix.contains(['/', '\\']) {
            return Err(HostError::InvalidConfig(format!(
                "cache_file_prefix '{}' must not contain path separators",
                self.cache_file_prefix
            )));
        }
        if self.config_file_name.is_empty() {
            return Err(HostError::InvalidConfig(
                "config_file_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn slow_handler_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_handler_threshold_ms)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(&self.config_file_name)
    }

    /// File name of the signature cache for `version`.
    pub fn cache_file_name(&self, version: &str) -> String {
        format!("{}{}.json", self.cache_file_prefix, version)
    }
}

/// The host's view of persisted user configuration.
///
/// Only set membership and a save call are needed; how the set is stored is
/// up to the implementation.
pub trait EnabledSet: Send {
    /// Whether the extension with `internal_name` should be enabled.
    fn is_enabled(&self, internal_name: &str) -> bool;

    /// Record the user's choice for `internal_name`.
    fn set_enabled(&mut self, internal_name: &str, enabled: bool);

    /// Persist the current state.
    fn save(&mut self) -> HostResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredConfig {
    #[serde(default)]
    enabled_extensions: BTreeSet<String>,
}

/// JSON file backed [`EnabledSet`].
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    stored: StoredConfig,
    dirty: bool,
}

impl JsonConfigStore {
    /// Load the store at `path`; a missing file yields an empty set.
    pub fn load(path: impl Into<PathBuf>) -> HostResult<Self> {
        let path = path.into();
        let stored = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            StoredConfig::default()
        };

        Ok(Self {
            path,
            stored,
            dirty: false,
        })
    }

    /// Load the store and drop names that no registered extension uses.
    pub fn load_for(path: impl Into<PathBuf>, known: &[&str]) -> HostResult<Self> {
        let mut store = Self::load(path)?;
        let before = store.stored.enabled_extensions.len();
        store
            .stored
            .enabled_extensions
            .retain(|name| known.contains(&name.as_str()));
        if store.stored.enabled_extensions.len() != before {
            tracing::debug!(
                removed = before - store.stored.enabled_extensions.len(),
                "Dropped unknown extensions from enabled set"
            );
            store.dirty = true;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.stored.enabled_extensions.iter().map(String::as_str)
    }
}

impl EnabledSet for JsonConfigStore {
    fn is_enabled(&self, internal_name: &str) -> bool {
        self.stored.enabled_extensions.contains(internal_name)
    }

    fn set_enabled(&mut self, internal_name: &str, enabled: bool) {
        let changed = if enabled {
            self.stored
                .enabled_extensions
                .insert(internal_name.to_string())
        } else {
            self.stored.enabled_extensions.remove(internal_name)
        };
        self.dirty |= changed;
    }

    /// Write the set, unless the file already holds it.
    fn save(&mut self) -> HostResult<()> {
        if !self.dirty && self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.stored)?;
        std::fs::write(&self.path, content)?;
        self.dirty = false;
        tracing::debug!(path = %self.path.display(), "Saved enabled set");
        Ok(())
    }
}

/// In-memory [`EnabledSet`], for hosts that persist elsewhere.
#[derive(Debug, Default, Clone)]
pub struct MemoryConfigStore {
    enabled: BTreeSet<String>,
    saves: usize,
}

impl MemoryConfigStore {
    pub fn new<I, S>(enabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: enabled.into_iter().map(Into::into).collect(),
            saves: 0,
        }
    }

    /// Number of times `save` was called.
    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl EnabledSet for MemoryConfigStore {
    fn is_enabled(&self, internal_name: &str) -> bool {
        self.enabled.contains(internal_name)
    }

    fn set_enabled(&mut self, internal_name: &str, enabled: bool) {
        if enabled {
            self.enabled.insert(internal_name.to_string());
        } else {
            self.enabled.remove(internal_name);
        }
    }

    fn save(&mut self) -> HostResult<()> {
        self.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_file_name("2024.01.01"), "SigCache_2024.01.01.json");
    }

    #[test]
    fn test_from_toml() {
        let config = HostConfig::from_toml(
            r#"
data_dir = "/tmp/hookhost"
resolve_off_thread = false
slow_handler_threshold_ms = 4
"#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/hookhost"));
        assert!(!config.resolve_off_thread);
        assert_eq!(config.slow_handler_threshold(), Duration::from_millis(4));
        assert_eq!(config.cache_file_prefix, CACHE_FILE_PREFIX);
    }

    #[test]
    fn test_rejects_prefix_with_separator() {
        let result = HostConfig::from_json(r#"{"cache_file_prefix": "../SigCache_"}"#);
        assert!(matches!(result, Err(HostError::InvalidConfig(_))));
    }

    #[test]
    fn test_json_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut store = JsonConfigStore::load(&path).unwrap();
        assert!(!store.is_enabled("Alpha"));
        store.set_enabled("Alpha", true);
        store.set_enabled("Beta", true);
        store.set_enabled("Beta", false);
        store.save().unwrap();

        let reloaded = JsonConfigStore::load(&path).unwrap();
        assert!(reloaded.is_enabled("Alpha"));
        assert!(!reloaded.is_enabled("Beta"));
    }

    #[test]
    fn test_load_for_drops_unknown_names() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"enabled_extensions": ["Alpha", "Removed"]}"#).unwrap();

        let mut store = JsonConfigStore::load_for(&path, &["Alpha", "Beta"]).unwrap();
        assert_eq!(store.enabled().collect::<Vec<_>>(), vec!["Alpha"]);
        store.save().unwrap();

        let reloaded = JsonConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.enabled().collect::<Vec<_>>(), vec!["Alpha"]);
    }

    #[test]
    fn test_unchanged_store_is_not_rewritten() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        let original = r#"{"enabled_extensions":["Alpha"]}"#;
        std::fs::write(&path, original).unwrap();

        let mut store = JsonConfigStore::load(&path).unwrap();
        store.set_enabled("Alpha", true);
        store.save().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);

        store.set_enabled("Beta", true);
        store.save().unwrap();
        assert_ne!(std::fs::read_to_string(&path).unwrap(), original);
    }
}
