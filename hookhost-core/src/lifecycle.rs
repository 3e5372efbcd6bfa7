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

//! Extension lifecycle controller
//!
//! ```text
//! Unresolved --resolve--> Ready | Outdated
//! Ready --activate--> Enabled
//! Enabled --deactivate--> Ready
//! any but Disposed --teardown--> Disposed
//! ```
//!
//! Every stage contains its own failures: errors and panics from the
//! extension or the interception layer are recorded as the extension's
//! `last_error` and reported in the returned [`StageOutcome`].

use crate::error::ExtensionError;
use crate::extension::{run_guarded, ExtensionState, FailureKind, StageFailure};
use crate::hooks::Interceptor;
use crate::registry::ExtensionEntry;
use crate::resolver::{ResolveRequest, Resolution};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// What a single lifecycle stage did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran and the extension moved on.
    Completed,
    /// The extension was not in a state this stage applies to.
    Skipped,
    /// The stage ran into a failure, also stored as `last_error`.
    Failed(StageFailure),
}

impl StageOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutcome::Skipped)
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        match self {
            StageOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Drives extensions through their lifecycle.
#[derive(Clone)]
pub struct LifecycleController {
    interceptor: Arc<dyn Interceptor>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController").finish_non_exhaustive()
    }
}

impl LifecycleController {
    pub fn new(interceptor: Arc<dyn Interceptor>) -> Self {
        Self { interceptor }
    }

    /// Collect the extension's hook descriptors. Runs at most once per
    /// extension; later calls return the cached requests, or the failure if
    /// declaring panicked.
    pub fn declare(&self, entry: &mut ExtensionEntry) -> Result<Vec<ResolveRequest>, StageFailure> {
        if let Some(failure) = &entry.declare_failure {
            return Err(failure.clone());
        }
        if !entry.hooks_declared {
            let declared =
                panic::catch_unwind(AssertUnwindSafe(|| entry.extension.declare_hooks()));
            entry.hooks_declared = true;
            match declared {
                Ok(descriptors) => entry.hooks.declare(descriptors),
                Err(_) => {
                    let failure =
                        StageFailure::new(FailureKind::Resolution, "panicked while declaring hooks");
                    tracing::error!(extension = %entry.internal_name(), "Hook declaration panicked");
                    entry.record(failure.clone());
                    entry.declare_failure = Some(failure.clone());
                    return Err(failure);
                }
            }
        }
        Ok(entry.hooks.resolve_requests())
    }

    /// Resolve hooks, then run `setup`. Only applies to `Unresolved`.
    pub fn resolve(&self, entry: &mut ExtensionEntry, resolution: &Resolution) -> StageOutcome {
        if entry.state != ExtensionState::Unresolved {
            return StageOutcome::Skipped;
        }
        if let Err(failure) = self.declare(entry) {
            return StageOutcome::Failed(failure);
        }

        if let Err(e) = entry.hooks.resolve(resolution) {
            if e.is_outdated() {
                return mark_outdated(entry, e.to_string());
            }
            return fail(entry, FailureKind::Resolution, e.to_string());
        }

        let extension = &mut entry.extension;
        match run_guarded(|| extension.setup()) {
            Ok(()) => {
                transition(entry, ExtensionState::Ready);
                StageOutcome::Completed
            }
            Err(ExtensionError::Outdated(reason)) => mark_outdated(entry, reason),
            Err(e) => fail(entry, FailureKind::Setup, e.to_string()),
        }
    }

    /// Install hooks, then run `enable`. Only applies to `Ready`.
    ///
    /// Once every hook is installed the extension is `Enabled`, even if its
    /// own `enable` fails. If installation fails, hooks installed so far are
    /// removed again and the extension stays `Ready`.
    pub fn activate(&self, entry: &mut ExtensionEntry) -> StageOutcome {
        if entry.state != ExtensionState::Ready {
            return StageOutcome::Skipped;
        }

        if let Err(e) = entry.hooks.install(self.interceptor.as_ref()) {
            if let Err(rollback) = entry.hooks.uninstall() {
                tracing::error!(
                    extension = %entry.internal_name(),
                    error = %rollback,
                    "Failed to roll back partially installed hooks"
                );
            }
            return fail(entry, FailureKind::Activation, e.to_string());
        }

        let extension = &mut entry.extension;
        let enabled = run_guarded(|| extension.enable());
        transition(entry, ExtensionState::Enabled);
        match enabled {
            Ok(()) => StageOutcome::Completed,
            Err(e) => fail(entry, FailureKind::Activation, e.to_string()),
        }
    }

    /// Run `disable`, then remove hooks. Only applies to `Enabled`; the
    /// extension ends up `Ready` whatever fails.
    pub fn deactivate(&self, entry: &mut ExtensionEntry) -> StageOutcome {
        if entry.state != ExtensionState::Enabled {
            return StageOutcome::Skipped;
        }

        let extension = &mut entry.extension;
        let disabled = run_guarded(|| extension.disable());
        let uninstalled = entry.hooks.uninstall();
        transition(entry, ExtensionState::Ready);

        let mut outcome = StageOutcome::Completed;
        if let Err(e) = disabled {
            outcome = fail(entry, FailureKind::Deactivation, e.to_string());
        }
        if let Err(e) = uninstalled {
            outcome = fail(entry, FailureKind::Deactivation, e.to_string());
        }
        outcome
    }

    /// Release all hooks, run `dispose` and mark the extension `Disposed`.
    ///
    /// An `Enabled` extension is deactivated first. Calling this again is a
    /// no-op.
    pub fn teardown(&self, entry: &mut ExtensionEntry) -> StageOutcome {
        if entry.state == ExtensionState::Disposed {
            return StageOutcome::Skipped;
        }

        let mut outcome = StageOutcome::Completed;
        if entry.state == ExtensionState::Enabled {
            if let StageOutcome::Failed(failure) = self.deactivate(entry) {
                outcome = StageOutcome::Failed(failure);
            }
        }

        let released = entry.hooks.release();
        let extension = &mut entry.extension;
        let disposed = run_guarded(|| extension.dispose());
        transition(entry, ExtensionState::Disposed);

        if let Err(e) = released {
            outcome = fail(entry, FailureKind::Disposal, e.to_string());
        }
        if let Err(e) = disposed {
            outcome = fail(entry, FailureKind::Disposal, e.to_string());
        }
        outcome
    }

    /// Resolve every extension; returns how many became `Ready`.
    pub fn resolve_all(&self, entries: &mut [ExtensionEntry], resolution: &Resolution) -> usize {
        entries
            .iter_mut()
            .map(|entry| self.resolve(entry, resolution))
            .filter(StageOutcome::is_completed)
            .count()
    }

    /// Activate every extension `predicate` selects; returns how many are
    /// `Enabled` afterwards.
    pub fn activate_where<P>(&self, entries: &mut [ExtensionEntry], mut predicate: P) -> usize
    where
        P: FnMut(&ExtensionEntry) -> bool,
    {
        for entry in entries.iter_mut() {
            if predicate(entry) {
                self.activate(entry);
            }
        }
        entries.iter().filter(|e| e.is_enabled()).count()
    }

    /// Deactivate then tear down everything, in reverse registration order.
    pub fn shutdown_all(&self, entries: &mut [ExtensionEntry]) {
        for entry in entries.iter_mut().rev() {
            self.deactivate(entry);
        }
        for entry in entries.iter_mut().rev() {
            self.teardown(entry);
        }
        tracing::info!(extensions = entries.len(), "All extensions disposed");
    }
}

fn transition(entry: &mut ExtensionEntry, next: ExtensionState) {
    debug_assert!(
        entry.state.can_transition_to(next),
        "illegal transition {} -> {}",
        entry.state,
        next
    );
    tracing::debug!(
        extension = %entry.internal_name(),
        from = %entry.state,
        to = %next,
        "Extension state changed"
    );
    if next == ExtensionState::Enabled {
        tracing::info!(extension = %entry.internal_name(), "Enabled extension");
    }
    entry.state = next;
}

fn fail(entry: &mut ExtensionEntry, kind: FailureKind, message: String) -> StageOutcome {
    tracing::error!(
        extension = %entry.internal_name(),
        stage = %kind,
        error = %message,
        "Extension stage failed"
    );
    let failure = StageFailure::new(kind, message);
    entry.record(failure.clone());
    StageOutcome::Failed(failure)
}

fn mark_outdated(entry: &mut ExtensionEntry, reason: String) -> StageOutcome {
    tracing::warn!(
        extension = %entry.internal_name(),
        reason = %reason,
        "Extension is outdated for this host version"
    );
    let failure = StageFailure::new(FailureKind::Outdated, reason);
    entry.record(failure.clone());
    transition(entry, ExtensionState::Outdated);
    StageOutcome::Failed(failure)
}
