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

//! Extension registry
//!
//! Holds the explicit list of extension factories and the ordered collection
//! of live instances built from it. Registration order is dispatch order.

use crate::error::{HostError, HostResult};
use crate::extension::{Extension, ExtensionInfo, ExtensionState, StageFailure};
use crate::hooks::{HookSet, HookStatus};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Builds one extension instance.
pub type ExtensionFactory = Box<dyn Fn() -> Box<dyn Extension> + Send + Sync>;

/// One live extension and everything the host tracks about it.
pub struct ExtensionEntry {
    pub(crate) info: ExtensionInfo,
    pub(crate) extension: Box<dyn Extension>,
    pub(crate) state: ExtensionState,
    pub(crate) last_error: Option<StageFailure>,
    pub(crate) hooks: HookSet,
    pub(crate) hooks_declared: bool,
    pub(crate) declare_failure: Option<StageFailure>,
}

impl ExtensionEntry {
    pub fn new(extension: Box<dyn Extension>) -> Self {
        let info = extension.info();
        let hooks = HookSet::new(info.internal_name.clone());
        Self {
            info,
            extension,
            state: ExtensionState::Unresolved,
            last_error: None,
            hooks,
            hooks_declared: false,
            declare_failure: None,
        }
    }

    pub fn info(&self) -> &ExtensionInfo {
        &self.info
    }

    pub fn internal_name(&self) -> &str {
        &self.info.internal_name
    }

    pub fn state(&self) -> ExtensionState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == ExtensionState::Enabled
    }

    pub fn last_error(&self) -> Option<&StageFailure> {
        self.last_error.as_ref()
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    pub fn status(&self) -> ExtensionStatus {
        ExtensionStatus {
            info: self.info.clone(),
            state: self.state,
            last_error: self.last_error.clone(),
            hooks: self.hooks.statuses(),
        }
    }

    pub(crate) fn record(&mut self, failure: StageFailure) {
        self.last_error = Some(failure);
    }
}

impl fmt::Debug for ExtensionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionEntry")
            .field("name", &self.info.internal_name)
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Serializable snapshot of an extension.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionStatus {
    #[serde(flatten)]
    pub info: ExtensionInfo,
    pub state: ExtensionState,
    pub last_error: Option<StageFailure>,
    pub hooks: Vec<HookStatus>,
}

/// Factory list plus the instances built from it.
#[derive(Default)]
pub struct ExtensionRegistry {
    factories: Vec<ExtensionFactory>,
    entries: Vec<ExtensionEntry>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory. Instances are built by [`instantiate`](Self::instantiate).
    pub fn register<F, E>(&mut self, factory: F) -> &mut Self
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: Extension + 'static,
    {
        self.factories
            .push(Box::new(move || Box::new(factory()) as Box<dyn Extension>));
        self
    }

    /// Builder form of [`register`](Self::register) for `Default` types.
    pub fn with<E>(mut self) -> Self
    where
        E: Extension + Default + 'static,
    {
        self.register(E::default);
        self
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }

    /// Build one instance per registered factory, in registration order.
    ///
    /// A factory (or `info`) that panics is logged and skipped. Fails on the
    /// first duplicate or empty internal name; nothing from this call is
    /// kept in that case.
    pub fn instantiate(&mut self) -> HostResult<usize> {
        let mut built: Vec<ExtensionEntry> = Vec::with_capacity(self.factories.len());
        for (index, factory) in self.factories.drain(..).enumerate() {
            let built_entry = panic::catch_unwind(AssertUnwindSafe(|| ExtensionEntry::new(factory())));
            let entry = match built_entry {
                Ok(entry) => entry,
                Err(_) => {
                    tracing::error!(factory = index, "Extension factory panicked, skipping");
                    continue;
                }
            };
            let name = entry.internal_name();
            if name.is_empty() {
                return Err(HostError::InvalidConfig(
                    "extension internal name must not be empty".to_string(),
                ));
            }
            if self.entries.iter().chain(built.iter()).any(|e| e.internal_name() == name) {
                return Err(HostError::DuplicateExtension(name.to_string()));
            }
            tracing::debug!(extension = %name, "Instantiated extension");
            built.push(entry);
        }

        let count = built.len();
        self.entries.extend(built);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ExtensionEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [ExtensionEntry] {
        &mut self.entries
    }

    pub fn get(&self, internal_name: &str) -> Option<&ExtensionEntry> {
        self.entries.iter().find(|e| e.internal_name() == internal_name)
    }

    pub fn get_mut(&mut self, internal_name: &str) -> Option<&mut ExtensionEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.internal_name() == internal_name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(ExtensionEntry::internal_name).collect()
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("pending_factories", &self.factories.len())
            .field("entries", &self.entries)
            .finish()
    }
}
