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

//! Extension authoring surface
//!
//! An extension implements [`Extension`]; every callback defaults to a no-op,
//! so a type only overrides the stages and events it cares about.

use crate::dispatcher::FrameContext;
use crate::error::{ExtensionError, ExtensionResult};
use crate::hooks::HookDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Identity and display metadata of an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    /// Stable unique name, used as the configuration key
    pub internal_name: String,
    /// Display name
    pub name: String,
    /// Description
    pub description: String,
    /// Shown when the extension is known to clash with other software
    #[serde(default)]
    pub incompatibility_warnings: Vec<String>,
}

impl ExtensionInfo {
    pub fn new(internal_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            internal_name: internal_name.into(),
            name: name.into(),
            description: String::new(),
            incompatibility_warnings: Vec::new(),
        }
    }

    /// Info named after the type `T`, without its module path or generics.
    pub fn of<T: ?Sized>() -> Self {
        let name = short_type_name(std::any::type_name::<T>());
        Self::new(name, name)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_incompatibility_warning(mut self, warning: impl Into<String>) -> Self {
        self.incompatibility_warnings.push(warning.into());
        self
    }
}

fn short_type_name(full: &str) -> &str {
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

/// An optional feature module hosted in-process.
#[allow(unused_variables)]
pub trait Extension: Send {
    /// Identity of this extension; must not change between calls.
    ///
    /// Defaults to the implementing type's name for both internal and
    /// display name.
    fn info(&self) -> ExtensionInfo {
        ExtensionInfo::of::<Self>()
    }

    /// The hooks this extension needs. Called once, before resolution.
    fn declare_hooks(&mut self) -> Vec<HookDescriptor> {
        Vec::new()
    }

    /// One-time initialization after hooks are resolved.
    ///
    /// Return [`ExtensionError::Outdated`] if the host no longer provides
    /// what the extension relies on.
    fn setup(&mut self) -> ExtensionResult {
        Ok(())
    }

    /// Called after the extension's hooks are installed.
    fn enable(&mut self) -> ExtensionResult {
        Ok(())
    }

    /// Called before the extension's hooks are removed.
    fn disable(&mut self) -> ExtensionResult {
        Ok(())
    }

    /// Final cleanup; hooks are already removed.
    fn dispose(&mut self) -> ExtensionResult {
        Ok(())
    }

    /// Runs every host frame; keep it cheap.
    fn on_tick(&mut self, frame: &FrameContext) -> ExtensionResult {
        Ok(())
    }

    fn on_login(&mut self) -> ExtensionResult {
        Ok(())
    }

    fn on_logout(&mut self) -> ExtensionResult {
        Ok(())
    }

    fn on_zone_changed(&mut self, zone_id: u16) -> ExtensionResult {
        Ok(())
    }

    fn on_panel_opened(&mut self, panel: &str) -> ExtensionResult {
        Ok(())
    }

    fn on_panel_closed(&mut self, panel: &str) -> ExtensionResult {
        Ok(())
    }

    fn on_language_changed(&mut self, language: &str) -> ExtensionResult {
        Ok(())
    }

    /// The player's inventory contents changed.
    fn on_inventory_updated(&mut self) -> ExtensionResult {
        Ok(())
    }

    /// One of this extension's own settings changed.
    fn on_config_changed(&mut self, field: &str) -> ExtensionResult {
        Ok(())
    }
}

/// Lifecycle state of an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionState {
    /// Created, hooks not (successfully) resolved or setup incomplete
    Unresolved,
    /// Host binary no longer matches; terminal for this process
    Outdated,
    /// Hooks resolved and setup done, not active
    Ready,
    /// Hooks installed and receiving events
    Enabled,
    /// Torn down; terminal
    Disposed,
}

impl ExtensionState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Teardown of `Unresolved` and `Outdated` extensions is allowed because
    /// host shutdown disposes every extension regardless of state.
    pub fn can_transition_to(self, next: ExtensionState) -> bool {
        use ExtensionState::*;
        matches!(
            (self, next),
            (Unresolved, Ready)
                | (Unresolved, Outdated)
                | (Ready, Enabled)
                | (Enabled, Ready)
                | (Unresolved | Outdated | Ready | Enabled, Disposed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExtensionState::Outdated | ExtensionState::Disposed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExtensionState::Unresolved => "unresolved",
            ExtensionState::Outdated => "outdated",
            ExtensionState::Ready => "ready",
            ExtensionState::Enabled => "enabled",
            ExtensionState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// One or more hooks could not be resolved or installed
    Resolution,
    /// Host binary no longer matches the extension
    Outdated,
    Setup,
    Activation,
    Deactivation,
    Disposal,
    /// An event handler failed
    Handler,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Resolution => "resolution",
            FailureKind::Outdated => "outdated",
            FailureKind::Setup => "setup",
            FailureKind::Activation => "activation",
            FailureKind::Deactivation => "deactivation",
            FailureKind::Disposal => "disposal",
            FailureKind::Handler => "handler",
        };
        f.write_str(s)
    }
}

/// The last failure recorded against an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

/// Run an extension callback, turning a panic into an error.
pub(crate) fn run_guarded<F>(callback: F) -> ExtensionResult
where
    F: FnOnce() -> ExtensionResult,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(ExtensionError::Failed(anyhow::anyhow!("panicked: {}", message)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_edges() {
        use ExtensionState::*;
        assert!(Unresolved.can_transition_to(Ready));
        assert!(Unresolved.can_transition_to(Outdated));
        assert!(Ready.can_transition_to(Enabled));
        assert!(Enabled.can_transition_to(Ready));
        assert!(Enabled.can_transition_to(Disposed));

        assert!(!Outdated.can_transition_to(Ready));
        assert!(!Outdated.can_transition_to(Enabled));
        assert!(!Unresolved.can_transition_to(Enabled));
        assert!(!Disposed.can_transition_to(Disposed));
        assert!(!Disposed.can_transition_to(Ready));
    }

    #[test]
    fn test_run_guarded_catches_panics() {
        let result = run_guarded(|| panic!("boom"));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!err.is_outdated());

        let formatted = run_guarded(|| panic!("code {}", 7));
        assert!(formatted.unwrap_err().to_string().contains("code 7"));
    }

    #[test]
    fn test_run_guarded_passes_results_through() {
        assert!(run_guarded(|| Ok(())).is_ok());
        let outdated = run_guarded(|| Err(ExtensionError::Outdated("gone".into())));
        assert!(outdated.unwrap_err().is_outdated());
    }

    mod tweaks {
        use super::*;

        pub struct AutoSort;

        impl Extension for AutoSort {}

        pub struct Wrapper<T>(pub T);

        impl<T: Send> Extension for Wrapper<T> {}
    }

    #[test]
    fn test_default_info_uses_type_name() {
        let info = tweaks::AutoSort.info();
        assert_eq!(info.internal_name, "AutoSort");
        assert_eq!(info.name, "AutoSort");
        assert!(info.incompatibility_warnings.is_empty());

        assert_eq!(tweaks::Wrapper(1u8).info().internal_name, "Wrapper");
    }

    #[test]
    fn test_multiple_incompatibility_warnings() {
        let info = ExtensionInfo::new("Chat", "Chat")
            .with_incompatibility_warning("ChatTwo")
            .with_incompatibility_warning("SimpleTweaks");
        assert_eq!(info.incompatibility_warnings, vec!["ChatTwo", "SimpleTweaks"]);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ExtensionState::Outdated).unwrap();
        assert_eq!(json, "\"outdated\"");
    }
}
