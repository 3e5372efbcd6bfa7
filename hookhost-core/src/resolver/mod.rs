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

//! Address resolution against the host binary.
//!
//! Signatures are resolved once per startup. Offsets found for a host
//! binary version are cached in `<prefix><version>.json`; on the next start
//! with the same version only signatures missing from the cache are
//! scanned. Cache files belonging to any other version are deleted before
//! resolving, so an address found for an older binary is never served.
//!
//! ```rust,ignore
//! let resolver = AddressResolver::new(space, "2024.03.27.0000.0000", &config)?;
//! let resolution = resolver.resolve(&requests);
//! let target = resolution.lookup("Framework.Update");
//! ```

mod cache;
mod pattern;
mod scanner;

pub use cache::{purge_stale, SignatureCache};
pub use pattern::{Pattern, Signature};
pub use scanner::{MemoryScanner, SearchSpace, SignatureScanner};

use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// One entry point to resolve, under the key it is cached by.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub key: String,
    pub signature: Signature,
}

impl ResolveRequest {
    pub fn new(signature: Signature, type_key: Option<&str>) -> Self {
        Self {
            key: signature.cache_key(type_key),
            signature,
        }
    }
}

/// Outcome of one resolver pass.
#[derive(Debug, Default, Clone)]
pub struct Resolution {
    addresses: HashMap<String, usize>,
    unresolved: BTreeSet<String>,
    from_cache: usize,
    scanned: usize,
}

impl Resolution {
    /// Resolution built from already known addresses, for hosts that locate
    /// entry points by other means.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, usize)>) -> Self {
        Self {
            addresses: pairs.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Resolved address for `key`; `None` if it was not found or never requested.
    pub fn lookup(&self, key: &str) -> Option<usize> {
        self.addresses.get(key).copied()
    }

    pub fn is_unresolved(&self, key: &str) -> bool {
        self.unresolved.contains(key)
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &str> {
        self.unresolved.iter().map(String::as_str)
    }

    /// Number of keys served from the cache file.
    pub fn from_cache(&self) -> usize {
        self.from_cache
    }

    /// Number of keys that required a scan.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    pub fn resolved_count(&self) -> usize {
        self.addresses.len()
    }
}

/// Resolves signatures inside one search space for one host version.
pub struct AddressResolver {
    space: SearchSpace,
    version: String,
    cache_dir: PathBuf,
    cache_prefix: String,
    cache_file: String,
    scanner: Arc<dyn SignatureScanner>,
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressResolver")
            .field("space", &self.space)
            .field("version", &self.version)
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl AddressResolver {
    /// Resolver scanning process memory with [`MemoryScanner`].
    pub fn new(space: SearchSpace, version: impl Into<String>, config: &HostConfig) -> HostResult<Self> {
        Self::with_scanner(space, version, config, Arc::new(MemoryScanner))
    }

    pub fn with_scanner(
        space: SearchSpace,
        version: impl Into<String>,
        config: &HostConfig,
        scanner: Arc<dyn SignatureScanner>,
    ) -> HostResult<Self> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(HostError::MissingHostVersion);
        }
        if version.contains(['/', '\\']) {
            return Err(HostError::InvalidConfig(format!(
                "host version '{}' cannot be used in a file name",
                version
            )));
        }

        Ok(Self {
            space,
            cache_file: config.cache_file_name(&version),
            version,
            cache_dir: config.data_dir.clone(),
            cache_prefix: config.cache_file_prefix.clone(),
            scanner,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.join(&self.cache_file)
    }

    /// Delete cache files of every other host version.
    pub fn purge_stale_caches(&self) -> usize {
        let removed = purge_stale(&self.cache_dir, &self.cache_prefix, &self.cache_file);
        if removed > 0 {
            tracing::info!(removed, version = %self.version, "Purged stale signature caches");
        }
        removed
    }

    /// Resolve every request, consulting and then updating the cache.
    ///
    /// Unfound signatures are reported in the result, never as an error.
    pub fn resolve(&self, requests: &[ResolveRequest]) -> Resolution {
        let start = Instant::now();
        self.purge_stale_caches();

        let mut cache = SignatureCache::open(self.cache_path(), &self.version);
        let mut resolution = Resolution::default();
        let mut seen: HashMap<&str, &Signature> = HashMap::new();
        let mut cache_dirty = false;

        for request in requests {
            if let Some(previous) = seen.get(request.key.as_str()) {
                if previous.pattern() != request.signature.pattern() {
                    tracing::warn!(
                        key = %request.key,
                        "Conflicting patterns requested for the same key, keeping the first"
                    );
                }
                continue;
            }
            seen.insert(&request.key, &request.signature);

            if let Some(offset) = cache.get(&request.key) {
                let address = self.space.base().wrapping_add(offset as usize);
                if self.space.contains(address) {
                    resolution.addresses.insert(request.key.clone(), address);
                    resolution.from_cache += 1;
                    continue;
                }
                tracing::warn!(
                    key = %request.key,
                    offset = %format!("{:#x}", offset),
                    "Cached offset lies outside the search space, rescanning"
                );
            }

            resolution.scanned += 1;
            match scanner::locate(self.scanner.as_ref(), &self.space, &request.signature) {
                Some(offset) => {
                    tracing::trace!(key = %request.key, offset = %format!("{:#x}", offset), "Signature found");
                    cache.insert(request.key.clone(), offset);
                    cache_dirty = true;
                    resolution
                        .addresses
                        .insert(request.key.clone(), self.space.base().wrapping_add(offset as usize));
                }
                None => {
                    tracing::warn!(
                        key = %request.key,
                        pattern = %request.signature.pattern(),
                        "Signature not found"
                    );
                    resolution.unresolved.insert(request.key.clone());
                }
            }
        }

        if cache_dirty {
            if let Err(e) = cache.save() {
                tracing::warn!(path = %cache.path().display(), error = %e, "Failed to write signature cache");
            }
        }

        tracing::info!(
            version = %self.version,
            resolved = resolution.resolved_count(),
            unresolved = resolution.unresolved.len(),
            from_cache = resolution.from_cache,
            scanned = resolution.scanned,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Signature resolution completed"
        );
        resolution
    }

    /// Run [`resolve`](Self::resolve) on a blocking worker thread.
    pub async fn resolve_in_background(
        self: Arc<Self>,
        requests: Vec<ResolveRequest>,
    ) -> HostResult<Resolution> {
        tokio::task::spawn_blocking(move || self.resolve(&requests))
            .await
            .map_err(|e| HostError::ResolverTask(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Scanner that counts scans and delegates to memory.
    #[derive(Default)]
    struct CountingScanner {
        scans: Mutex<Vec<String>>,
    }

    impl SignatureScanner for CountingScanner {
        fn scan(&self, space: &SearchSpace, pattern: &Pattern) -> Option<usize> {
            self.scans.lock().push(pattern.to_string());
            MemoryScanner.scan(space, pattern)
        }

        fn read_i32(&self, space: &SearchSpace, offset: usize) -> Option<i32> {
            MemoryScanner.read_i32(space, offset)
        }
    }

    fn space() -> SearchSpace {
        let bytes = vec![0xCC, 0x48, 0x89, 0x5C, 0x24, 0x08, 0xC3, 0x40, 0x53, 0x90];
        SearchSpace::from_static(Box::leak(bytes.into_boxed_slice()))
    }

    fn requests() -> Vec<ResolveRequest> {
        vec![
            ResolveRequest::new(Signature::new("A", "48 89 5C 24").unwrap(), None),
            ResolveRequest::new(Signature::new("B", "40 53").unwrap(), None),
            ResolveRequest::new(Signature::new("Missing", "FF FF FF").unwrap(), None),
        ]
    }

    #[test]
    fn test_rejects_empty_version() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::with_data_dir(dir.path());
        assert!(matches!(
            AddressResolver::new(space(), "  ", &config),
            Err(HostError::MissingHostVersion)
        ));
    }

    #[test]
    fn test_cache_path_follows_config_prefix() {
        let dir = TempDir::new().unwrap();
        let mut config = HostConfig::with_data_dir(dir.path());
        config.cache_file_prefix = "Offsets_".to_string();

        let resolver = AddressResolver::new(space(), "7.1", &config).unwrap();
        assert_eq!(resolver.cache_path(), dir.path().join("Offsets_7.1.json"));
    }

    #[test]
    fn test_resolve_scans_then_uses_cache() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::with_data_dir(dir.path());
        let space = space();

        let scanner = Arc::new(CountingScanner::default());
        let resolver = AddressResolver::with_scanner(space, "1.0", &config, scanner.clone()).unwrap();
        let first = resolver.resolve(&requests());

        assert_eq!(first.lookup("A"), Some(space.base() + 1));
        assert_eq!(first.lookup("B"), Some(space.base() + 7));
        assert!(first.is_unresolved("Missing"));
        assert_eq!(first.scanned(), 3);
        assert!(resolver.cache_path().exists());

        let again = Arc::new(CountingScanner::default());
        let resolver = AddressResolver::with_scanner(space, "1.0", &config, again.clone()).unwrap();
        let second = resolver.resolve(&requests());

        assert_eq!(second.from_cache(), 2);
        assert_eq!(second.lookup("A"), first.lookup("A"));
        // Only the signature missing from the cache is scanned again.
        assert_eq!(again.scans.lock().as_slice(), &["FF FF FF".to_string()]);
    }

    #[test]
    fn test_out_of_range_cache_entry_is_rescanned() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::with_data_dir(dir.path());
        std::fs::write(
            dir.path().join("SigCache_1.0.json"),
            r#"{"version": "1.0", "offsets": {"A": 4096}}"#,
        )
        .unwrap();

        let scanner = Arc::new(CountingScanner::default());
        let resolver = AddressResolver::with_scanner(space(), "1.0", &config, scanner.clone()).unwrap();
        let resolution = resolver.resolve(&requests()[..1]);

        assert_eq!(resolution.from_cache(), 0);
        assert_eq!(resolution.lookup("A"), Some(resolver.space().base() + 1));
        assert_eq!(scanner.scans.lock().len(), 1);
    }

    #[test]
    fn test_duplicate_keys_resolve_once() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::with_data_dir(dir.path());
        let scanner = Arc::new(CountingScanner::default());
        let resolver = AddressResolver::with_scanner(space(), "1.0", &config, scanner.clone()).unwrap();

        let sig = Signature::new("A", "48 89 5C 24").unwrap();
        let resolution = resolver.resolve(&[
            ResolveRequest::new(sig.clone(), None),
            ResolveRequest::new(sig, None),
        ]);

        assert_eq!(resolution.resolved_count(), 1);
        assert_eq!(scanner.scans.lock().len(), 1);
    }

    #[test]
    fn test_version_change_purges_old_cache() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::with_data_dir(dir.path());

        let v1 = AddressResolver::new(space(), "1.0", &config).unwrap();
        v1.resolve(&requests());
        assert!(v1.cache_path().exists());

        let v2 = AddressResolver::new(space(), "2.0", &config).unwrap();
        let resolution = v2.resolve(&requests());

        assert!(!v1.cache_path().exists());
        assert!(v2.cache_path().exists());
        assert_eq!(resolution.from_cache(), 0);
    }

    #[tokio::test]
    async fn test_resolve_in_background() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::with_data_dir(dir.path());
        let resolver = Arc::new(AddressResolver::new(space(), "1.0", &config).unwrap());

        let resolution = resolver.resolve_in_background(requests()).await.unwrap();
        assert_eq!(resolution.resolved_count(), 2);
    }
}
