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

//! Per-version signature cache files.

use crate::error::HostResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: String,
    #[serde(default)]
    offsets: BTreeMap<String, u64>,
}

/// Offsets found for one host binary version, stored in the file named by
/// [`HostConfig::cache_file_name`](crate::config::HostConfig::cache_file_name).
#[derive(Debug)]
pub struct SignatureCache {
    path: PathBuf,
    file: CacheFile,
}

impl SignatureCache {
    /// Open the cache for `version` at `path`; a missing or unreadable file
    /// is empty.
    pub fn open(path: impl Into<PathBuf>, version: &str) -> Self {
        let path = path.into();
        let empty = || CacheFile {
            version: version.to_string(),
            offsets: BTreeMap::new(),
        };

        let file = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CacheFile>(&content) {
                Ok(file) if file.version == version => file,
                Ok(file) => {
                    tracing::warn!(
                        path = %path.display(),
                        expected = %version,
                        found = %file.version,
                        "Signature cache version mismatch, ignoring"
                    );
                    empty()
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Corrupt signature cache, ignoring");
                    empty()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => empty(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable signature cache, ignoring");
                empty()
            }
        };

        Self { path, file }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.file.version
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.file.offsets.get(key).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, offset: u64) {
        self.file.offsets.insert(key.into(), offset);
    }

    pub fn len(&self) -> usize {
        self.file.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.offsets.is_empty()
    }

    pub fn save(&self) -> HostResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.file)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// Delete every `<prefix>*.json` in `dir` except `keep_file_name`.
///
/// Returns the number of files removed. Failures to delete are logged.
pub fn purge_stale(dir: &Path, prefix: &str, keep_file_name: &str) -> usize {
    if !dir.is_dir() {
        return 0;
    }

    let mut removed = 0;
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy();
        if !name.starts_with(prefix) || !name.ends_with(".json") || name == keep_file_name {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                tracing::debug!(path = %entry.path().display(), "Deleted stale signature cache");
                removed += 1;
            }
            Err(e) => {
                tracing::warn!(
                    path = %entry.path().display(),
                    error = %e,
                    "Failed to delete stale signature cache"
                );
            }
        }
    }
    removed
}
