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

//! Per-extension registry of hook descriptors.

use super::descriptor::{HookDescriptor, HookKind};
use super::interceptor::Interceptor;
use crate::resolver::{ResolveRequest, Resolution};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why a single descriptor failed a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookFailureReason {
    #[error("signature '{key}' was not found in the host binary")]
    Unresolved { key: String },

    #[error("dispatch table of '{type_name}' is unavailable")]
    TableUnavailable { type_name: String },

    #[error("slot {slot} is outside the {slot_count}-entry table of '{type_name}'")]
    SlotOutOfRange {
        type_name: String,
        slot: usize,
        slot_count: usize,
    },

    #[error("hook has no resolved target")]
    NotResolved,

    #[error("interceptor error: {0}")]
    Interceptor(String),
}

/// A failure of one named hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub hook: String,
    pub reason: HookFailureReason,
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.hook, self.reason)
    }
}

/// Aggregate failure of one registry stage for one extension.
#[derive(Debug, Clone, Error)]
#[error("{} of {total} hooks failed for '{owner}': {}", .failures.len(), join(.failures))]
pub struct HookSetError {
    pub owner: String,
    pub total: usize,
    pub failures: Vec<HookFailure>,
}

fn join(failures: &[HookFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl HookSetError {
    /// Whether any failure means the host binary no longer has what the
    /// extension expects.
    pub fn is_outdated(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f.reason, HookFailureReason::Unresolved { .. }))
    }
}

/// Snapshot of one hook for status inspection.
#[derive(Debug, Clone, Serialize)]
pub struct HookStatus {
    pub name: String,
    pub kind: &'static str,
    pub target: Option<usize>,
    pub installed: bool,
}

/// The hooks of one extension.
///
/// Descriptors are kept with dispatch-table hooks first, so those are
/// resolved and installed before any signature hook and removed after them.
pub struct HookSet {
    owner: String,
    descriptors: Vec<HookDescriptor>,
}

impl HookSet {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            descriptors: Vec::new(),
        }
    }

    /// Take ownership of the extension's declared descriptors.
    pub fn declare(&mut self, descriptors: Vec<HookDescriptor>) {
        self.descriptors = descriptors;
        // Stable, so declaration order is kept within each group.
        self.descriptors.sort_by_key(|d| !d.kind().is_vtable());
        tracing::debug!(
            extension = %self.owner,
            hooks = self.descriptors.len(),
            "Declared hooks"
        );
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[HookDescriptor] {
        &self.descriptors
    }

    pub fn installed_count(&self) -> usize {
        self.descriptors.iter().filter(|d| d.is_installed()).count()
    }

    pub fn resolved_count(&self) -> usize {
        self.descriptors.iter().filter(|d| d.is_resolved()).count()
    }

    /// Signatures the address resolver has to find for this set.
    pub fn resolve_requests(&self) -> Vec<ResolveRequest> {
        self.descriptors
            .iter()
            .filter_map(|d| d.kind().resolve_request())
            .collect()
    }

    pub fn statuses(&self) -> Vec<HookStatus> {
        self.descriptors
            .iter()
            .map(|d| HookStatus {
                name: d.name().to_string(),
                kind: d.kind().label(),
                target: d.target(),
                installed: d.is_installed(),
            })
            .collect()
    }

    /// Compute every descriptor's target. Failed descriptors stay unresolved
    /// and do not stop the others.
    pub fn resolve(&mut self, resolution: &Resolution) -> Result<(), HookSetError> {
        let mut failures = Vec::new();

        for descriptor in &mut self.descriptors {
            if descriptor.is_resolved() {
                continue;
            }
            match resolve_target(descriptor.kind(), resolution) {
                Ok(target) => {
                    tracing::trace!(
                        extension = %self.owner,
                        hook = %descriptor.name(),
                        kind = descriptor.kind().label(),
                        target = %format!("{:#x}", target),
                        "Hook resolved"
                    );
                    descriptor.set_target(target);
                }
                Err(reason) => failures.push(HookFailure {
                    hook: descriptor.name().to_string(),
                    reason,
                }),
            }
        }

        self.finish(failures)
    }

    /// Redirect every resolved hook. Already installed hooks are left alone.
    pub fn install(&mut self, interceptor: &dyn Interceptor) -> Result<(), HookSetError> {
        let mut failures = Vec::new();

        for descriptor in &mut self.descriptors {
            if descriptor.is_installed() {
                continue;
            }
            if let Err(reason) = install_one(descriptor, interceptor) {
                failures.push(HookFailure {
                    hook: descriptor.name().to_string(),
                    reason,
                });
            } else {
                tracing::debug!(extension = %self.owner, hook = %descriptor.name(), "Hook installed");
            }
        }

        self.finish(failures)
    }

    /// Restore original dispatch for every installed hook, in reverse order.
    pub fn uninstall(&mut self) -> Result<(), HookSetError> {
        let mut failures = Vec::new();

        for descriptor in self.descriptors.iter_mut().rev() {
            if !descriptor.is_installed() {
                continue;
            }
            let result = match descriptor.interception.as_mut() {
                Some(interception) => interception.disable(),
                None => Ok(()),
            };
            match result {
                Ok(()) => {
                    descriptor.handle_ref().publish_uninstalled();
                    tracing::debug!(extension = %self.owner, hook = %descriptor.name(), "Hook uninstalled");
                }
                Err(e) => failures.push(HookFailure {
                    hook: descriptor.name().to_string(),
                    reason: HookFailureReason::Interceptor(e.to_string()),
                }),
            }
        }

        self.finish(failures)
    }

    /// Uninstall everything and free the interceptions.
    ///
    /// An interception that refuses to disable is dropped anyway, so the
    /// set never keeps an active redirection after release.
    pub fn release(&mut self) -> Result<(), HookSetError> {
        let result = self.uninstall();
        for descriptor in &mut self.descriptors {
            if descriptor.interception.take().is_some() {
                descriptor.handle_ref().publish_uninstalled();
            }
        }
        result
    }

    fn finish(&self, failures: Vec<HookFailure>) -> Result<(), HookSetError> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(HookSetError {
                owner: self.owner.clone(),
                total: self.descriptors.len(),
                failures,
            })
        }
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("owner", &self.owner)
            .field("descriptors", &self.descriptors)
            .finish()
    }
}

fn resolve_target(kind: &HookKind, resolution: &Resolution) -> Result<usize, HookFailureReason> {
    match kind {
        HookKind::VTable { table, slot } => {
            if *slot >= table.slot_count() {
                return Err(HookFailureReason::SlotOutOfRange {
                    type_name: table.type_name().to_string(),
                    slot: *slot,
                    slot_count: table.slot_count(),
                });
            }
            let base = table
                .locate()
                .ok_or_else(|| HookFailureReason::TableUnavailable {
                    type_name: table.type_name().to_string(),
                })?;
            Ok(base + slot * std::mem::size_of::<usize>())
        }
        HookKind::Address { .. } | HookKind::GenericAddress { .. } => {
            let request = kind
                .resolve_request()
                .ok_or(HookFailureReason::NotResolved)?;
            resolution
                .lookup(&request.key)
                .ok_or(HookFailureReason::Unresolved { key: request.key })
        }
    }
}

fn install_one(
    descriptor: &mut HookDescriptor,
    interceptor: &dyn Interceptor,
) -> Result<(), HookFailureReason> {
    let target = descriptor.target().ok_or(HookFailureReason::NotResolved)?;

    if descriptor.interception.is_none() {
        let detour = descriptor.detour();
        // SAFETY: `target` came from the resolver or a validated table slot,
        // and the detour was supplied by the owning extension for it.
        let created = unsafe {
            if descriptor.kind().is_vtable() {
                interceptor.table_slot(target, detour)
            } else {
                interceptor.inline(target, detour)
            }
        };
        descriptor.interception =
            Some(created.map_err(|e| HookFailureReason::Interceptor(e.to_string()))?);
    }

    let interception = descriptor
        .interception
        .as_mut()
        .ok_or(HookFailureReason::NotResolved)?;
    interception
        .enable()
        .map_err(|e| HookFailureReason::Interceptor(e.to_string()))?;
    let original = interception.original();
    descriptor.handle_ref().publish_installed(original);
    Ok(())
}
