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

//! Event dispatcher for delivering host events to enabled extensions.

use crate::extension::{run_guarded, Extension, FailureKind, StageFailure};
use crate::error::ExtensionResult;
use crate::registry::ExtensionEntry;
use std::time::{Duration, Instant};

/// Frame-budget information passed to every tick handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameContext {
    /// Monotonic frame counter
    pub frame: u64,
    /// Time since the previous frame
    pub delta: Duration,
    /// Time since the host started
    pub elapsed: Duration,
}

/// A host notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Tick(FrameContext),
    Login,
    Logout,
    /// The player moved to another zone
    ZoneChanged(u16),
    PanelOpened(String),
    PanelClosed(String),
    LanguageChanged(String),
    InventoryUpdated,
    /// A setting of a single extension changed; only that extension hears it
    ConfigChanged { extension: String, field: String },
}

impl HostEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::Tick(_) => "tick",
            HostEvent::Login => "login",
            HostEvent::Logout => "logout",
            HostEvent::ZoneChanged(_) => "zone_changed",
            HostEvent::PanelOpened(_) => "panel_opened",
            HostEvent::PanelClosed(_) => "panel_closed",
            HostEvent::LanguageChanged(_) => "language_changed",
            HostEvent::InventoryUpdated => "inventory_updated",
            HostEvent::ConfigChanged { .. } => "config_changed",
        }
    }

    /// Whether the extension named `internal_name` is a recipient.
    pub fn targets(&self, internal_name: &str) -> bool {
        match self {
            HostEvent::ConfigChanged { extension, .. } => extension == internal_name,
            _ => true,
        }
    }

    fn deliver(&self, extension: &mut dyn Extension) -> ExtensionResult {
        match self {
            HostEvent::Tick(frame) => extension.on_tick(frame),
            HostEvent::Login => extension.on_login(),
            HostEvent::Logout => extension.on_logout(),
            HostEvent::ZoneChanged(zone) => extension.on_zone_changed(*zone),
            HostEvent::PanelOpened(panel) => extension.on_panel_opened(panel),
            HostEvent::PanelClosed(panel) => extension.on_panel_closed(panel),
            HostEvent::LanguageChanged(language) => extension.on_language_changed(language),
            HostEvent::InventoryUpdated => extension.on_inventory_updated(),
            HostEvent::ConfigChanged { field, .. } => extension.on_config_changed(field),
        }
    }
}

/// A handler that failed during one dispatch.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub extension: String,
    pub failure: StageFailure,
}

/// Result of dispatching one event.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Event that was dispatched.
    pub event: &'static str,
    /// Number of extensions whose handler ran.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failures: Vec<HandlerFailure>,
    /// Total dispatch time.
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn all_successful(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delivers events to enabled extensions in registration order.
///
/// A failing handler is logged against its extension and never stops
/// delivery to the rest.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    slow_handler_threshold: Duration,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_millis(16))
    }
}

impl EventDispatcher {
    pub fn new(slow_handler_threshold: Duration) -> Self {
        Self {
            slow_handler_threshold,
        }
    }

    pub fn slow_handler_threshold(&self) -> Duration {
        self.slow_handler_threshold
    }

    pub fn dispatch(&self, entries: &mut [ExtensionEntry], event: &HostEvent) -> DispatchReport {
        let start = Instant::now();
        let mut delivered = 0;
        let mut failures = Vec::new();

        for entry in entries
            .iter_mut()
            .filter(|e| e.is_enabled() && event.targets(e.internal_name()))
        {
            let handler_start = Instant::now();
            let result = run_guarded(|| event.deliver(entry.extension.as_mut()));
            let took = handler_start.elapsed();
            delivered += 1;

            if took > self.slow_handler_threshold {
                tracing::warn!(
                    extension = %entry.internal_name(),
                    event = event.name(),
                    elapsed_ms = took.as_millis() as u64,
                    "Slow event handler"
                );
            }

            if let Err(e) = result {
                tracing::error!(
                    extension = %entry.internal_name(),
                    event = event.name(),
                    error = %e,
                    "Event handler failed"
                );
                let failure = StageFailure::new(FailureKind::Handler, e.to_string());
                entry.record(failure.clone());
                failures.push(HandlerFailure {
                    extension: entry.internal_name().to_string(),
                    failure,
                });
            }
        }

        if !matches!(event, HostEvent::Tick(_)) {
            tracing::debug!(
                event = event.name(),
                delivered,
                failed = failures.len(),
                "Dispatched host event"
            );
        }

        DispatchReport {
            event: event.name(),
            delivered,
            failures,
            elapsed: start.elapsed(),
        }
    }
}
