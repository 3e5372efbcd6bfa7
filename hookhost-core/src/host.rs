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

//! Extension host - main entry point
//!
//! Owns every piece of host state for one process: configuration, the
//! resolved addresses, the extension registry and the components driving it.
//! Startup resolves and activates; [`ExtensionHost::shutdown`] (or dropping
//! the host) deactivates and disposes everything and persists the enabled set.

use crate::config::{EnabledSet, HostConfig, JsonConfigStore};
use crate::dispatcher::{DispatchReport, EventDispatcher, FrameContext, HostEvent};
use crate::error::{HostError, HostResult};
use crate::extension::Extension;
use crate::hooks::{Interceptor, NativeInterceptor};
use crate::lifecycle::{LifecycleController, StageOutcome};
use crate::registry::{ExtensionEntry, ExtensionRegistry, ExtensionStatus};
use crate::resolver::{AddressResolver, MemoryScanner, Resolution, SearchSpace, SignatureScanner};
use std::sync::Arc;
use std::time::Instant;

/// Collects everything [`ExtensionHost::start`] needs.
pub struct HostBuilder {
    config: HostConfig,
    version: Option<String>,
    space: Option<SearchSpace>,
    scanner: Arc<dyn SignatureScanner>,
    interceptor: Arc<dyn Interceptor>,
    enabled_set: Option<Box<dyn EnabledSet>>,
    registry: ExtensionRegistry,
}

impl HostBuilder {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            version: None,
            space: None,
            scanner: Arc::new(MemoryScanner),
            interceptor: Arc::new(NativeInterceptor),
            enabled_set: None,
            registry: ExtensionRegistry::new(),
        }
    }

    /// Version string of the running host binary; keys the signature cache.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Memory range the signatures are searched in.
    pub fn search_space(mut self, space: SearchSpace) -> Self {
        self.space = Some(space);
        self
    }

    pub fn scanner(mut self, scanner: Arc<dyn SignatureScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// Use `enabled_set` instead of the JSON store under the data directory.
    pub fn enabled_set(mut self, enabled_set: Box<dyn EnabledSet>) -> Self {
        self.enabled_set = Some(enabled_set);
        self
    }

    pub fn register<F, E>(mut self, factory: F) -> Self
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: Extension + 'static,
    {
        self.registry.register(factory);
        self
    }

    pub fn registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub async fn start(self) -> HostResult<ExtensionHost> {
        ExtensionHost::start(self).await
    }
}

/// The running extension host.
pub struct ExtensionHost {
    config: HostConfig,
    version: String,
    registry: ExtensionRegistry,
    controller: LifecycleController,
    dispatcher: EventDispatcher,
    enabled_set: Box<dyn EnabledSet>,
    resolution: Resolution,
    started_at: Instant,
    last_tick: Option<Instant>,
    frame: u64,
    shut_down: bool,
}

impl ExtensionHost {
    pub fn builder(config: HostConfig) -> HostBuilder {
        HostBuilder::new(config)
    }

    /// Instantiate, resolve and activate every registered extension.
    ///
    /// Extension failures are recorded on the extension and never fail
    /// startup; only host-level problems (bad configuration, duplicate
    /// names, unreadable config store) do.
    pub async fn start(builder: HostBuilder) -> HostResult<Self> {
        let HostBuilder {
            config,
            version,
            space,
            scanner,
            interceptor,
            enabled_set,
            mut registry,
        } = builder;

        config.validate()?;
        let version = version.ok_or(HostError::MissingHostVersion)?;
        let space = space
            .ok_or_else(|| HostError::InvalidSearchSpace("no search space supplied".to_string()))?;
        let start = Instant::now();

        registry.instantiate()?;

        let enabled_set = match enabled_set {
            Some(set) => set,
            None => Box::new(JsonConfigStore::load_for(
                config.config_path(),
                &registry.names(),
            )?) as Box<dyn EnabledSet>,
        };

        let controller = LifecycleController::new(interceptor);
        let mut requests = Vec::new();
        for entry in registry.entries_mut() {
            if let Ok(declared) = controller.declare(entry) {
                requests.extend(declared);
            }
        }

        let resolver = Arc::new(AddressResolver::with_scanner(space, version.clone(), &config, scanner)?);
        let resolution = if config.resolve_off_thread {
            resolver.resolve_in_background(requests).await?
        } else {
            resolver.resolve(&requests)
        };

        let ready = controller.resolve_all(registry.entries_mut(), &resolution);
        let enabled = controller.activate_where(registry.entries_mut(), |entry| {
            enabled_set.is_enabled(entry.internal_name())
        });

        tracing::info!(
            version = %version,
            extensions = registry.len(),
            ready,
            enabled,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Extension host started"
        );

        Ok(Self {
            dispatcher: EventDispatcher::new(config.slow_handler_threshold()),
            config,
            version,
            registry,
            controller,
            enabled_set,
            resolution,
            started_at: Instant::now(),
            last_tick: None,
            frame: 0,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn extensions(&self) -> &[ExtensionEntry] {
        self.registry.entries()
    }

    pub fn extension(&self, internal_name: &str) -> Option<&ExtensionEntry> {
        self.registry.get(internal_name)
    }

    pub fn status(&self) -> Vec<ExtensionStatus> {
        self.registry.entries().iter().map(ExtensionEntry::status).collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Deliver `event` to every enabled extension.
    ///
    /// A language change persists the enabled set before delivery.
    pub fn dispatch(&mut self, event: HostEvent) -> DispatchReport {
        if let HostEvent::LanguageChanged(language) = &event {
            tracing::info!(language = %language, "Host language changed");
            if let Err(e) = self.enabled_set.save() {
                tracing::warn!(error = %e, "Failed to save enabled set on language change");
            }
        }
        self.dispatcher.dispatch(self.registry.entries_mut(), &event)
    }

    /// Advance one frame and deliver a tick.
    pub fn tick(&mut self) -> DispatchReport {
        let now = Instant::now();
        let delta = self
            .last_tick
            .map(|last| now.duration_since(last))
            .unwrap_or_default();
        self.last_tick = Some(now);
        self.frame += 1;

        let frame = FrameContext {
            frame: self.frame,
            delta,
            elapsed: now.duration_since(self.started_at),
        };
        self.dispatch(HostEvent::Tick(frame))
    }

    pub fn login(&mut self) -> DispatchReport {
        self.dispatch(HostEvent::Login)
    }

    pub fn logout(&mut self) -> DispatchReport {
        self.dispatch(HostEvent::Logout)
    }

    pub fn zone_changed(&mut self, zone_id: u16) -> DispatchReport {
        self.dispatch(HostEvent::ZoneChanged(zone_id))
    }

    pub fn panel_opened(&mut self, panel: &str) -> DispatchReport {
        self.dispatch(HostEvent::PanelOpened(panel.to_string()))
    }

    pub fn panel_closed(&mut self, panel: &str) -> DispatchReport {
        self.dispatch(HostEvent::PanelClosed(panel.to_string()))
    }

    pub fn language_changed(&mut self, language: &str) -> DispatchReport {
        self.dispatch(HostEvent::LanguageChanged(language.to_string()))
    }

    pub fn inventory_updated(&mut self) -> DispatchReport {
        self.dispatch(HostEvent::InventoryUpdated)
    }

    /// Tell one extension that its setting `field` changed.
    pub fn config_changed(&mut self, internal_name: &str, field: &str) -> HostResult<DispatchReport> {
        if self.registry.get(internal_name).is_none() {
            return Err(HostError::ExtensionNotFound(internal_name.to_string()));
        }
        Ok(self.dispatch(HostEvent::ConfigChanged {
            extension: internal_name.to_string(),
            field: field.to_string(),
        }))
    }

    /// Activate an extension at runtime and remember the choice.
    pub fn enable(&mut self, internal_name: &str) -> HostResult<StageOutcome> {
        let entry = self
            .registry
            .get_mut(internal_name)
            .ok_or_else(|| HostError::ExtensionNotFound(internal_name.to_string()))?;
        let outcome = self.controller.activate(entry);
        if entry.is_enabled() {
            self.enabled_set.set_enabled(internal_name, true);
            self.enabled_set.save()?;
        }
        Ok(outcome)
    }

    /// Deactivate an extension at runtime and remember the choice.
    pub fn disable(&mut self, internal_name: &str) -> HostResult<StageOutcome> {
        let entry = self
            .registry
            .get_mut(internal_name)
            .ok_or_else(|| HostError::ExtensionNotFound(internal_name.to_string()))?;
        let outcome = self.controller.deactivate(entry);
        self.enabled_set.set_enabled(internal_name, false);
        self.enabled_set.save()?;
        Ok(outcome)
    }

    /// Deactivate and dispose every extension, then persist the enabled set.
    ///
    /// Runs once; later calls return `Ok(())` without doing anything.
    pub fn shutdown(&mut self) -> HostResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        tracing::info!(version = %self.version, "Shutting down extension host");
        self.controller.shutdown_all(self.registry.entries_mut());
        self.enabled_set.save()
    }
}

impl Drop for ExtensionHost {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Failed to save enabled set during shutdown");
        }
    }
}

impl std::fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("version", &self.version)
            .field("extensions", &self.registry.len())
            .field("frame", &self.frame)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

/// Install a `tracing-subscriber` fmt subscriber filtered by `RUST_LOG`.
///
/// Returns `false` when the process already has a global subscriber.
#[cfg(feature = "subscriber")]
pub fn init_tracing() -> bool {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hookhost_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::error::ExtensionResult;
    use crate::extension::{ExtensionInfo, ExtensionState};
    use crate::testing::RecordingInterceptor;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Quiet;

    impl Extension for Quiet {
        fn info(&self) -> ExtensionInfo {
            ExtensionInfo::new("Quiet", "Quiet")
        }
    }

    struct Counter {
        ticks: Arc<parking_lot::Mutex<Vec<u64>>>,
    }

    impl Extension for Counter {
        fn info(&self) -> ExtensionInfo {
            ExtensionInfo::new("Counter", "Counter")
        }

        fn on_tick(&mut self, frame: &FrameContext) -> ExtensionResult {
            self.ticks.lock().push(frame.frame);
            Ok(())
        }
    }

    fn space() -> SearchSpace {
        SearchSpace::from_static(&[0x90, 0x90, 0xC3])
    }

    #[tokio::test]
    async fn test_start_requires_version_and_space() {
        let dir = TempDir::new().unwrap();
        let missing_version = ExtensionHost::builder(HostConfig::with_data_dir(dir.path()))
            .search_space(space())
            .start()
            .await;
        assert!(matches!(missing_version, Err(HostError::MissingHostVersion)));

        let missing_space = ExtensionHost::builder(HostConfig::with_data_dir(dir.path()))
            .version("1.0")
            .start()
            .await;
        assert!(matches!(missing_space, Err(HostError::InvalidSearchSpace(_))));
    }

    #[tokio::test]
    async fn test_ticks_carry_frame_numbers() {
        let dir = TempDir::new().unwrap();
        let ticks = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&ticks);

        let mut host = ExtensionHost::builder(HostConfig::with_data_dir(dir.path()))
            .version("1.0")
            .search_space(space())
            .interceptor(Arc::new(RecordingInterceptor::new()))
            .enabled_set(Box::new(MemoryConfigStore::new(["Counter"])))
            .register(move || Counter {
                ticks: Arc::clone(&seen),
            })
            .register(Quiet::default)
            .start()
            .await
            .unwrap();

        host.tick();
        host.tick();
        let report = host.tick();

        assert_eq!(report.delivered, 1);
        assert_eq!(*ticks.lock(), vec![1, 2, 3]);
        assert_eq!(host.extension("Quiet").unwrap().state(), ExtensionState::Ready);
    }

    #[tokio::test]
    async fn test_runtime_toggles_persist() {
        let dir = TempDir::new().unwrap();
        let config = HostConfig::with_data_dir(dir.path());
        let config_path = config.config_path();

        let mut host = ExtensionHost::builder(config)
            .version("1.0")
            .search_space(space())
            .interceptor(Arc::new(RecordingInterceptor::new()))
            .register(Quiet::default)
            .start()
            .await
            .unwrap();

        assert_eq!(host.extension("Quiet").unwrap().state(), ExtensionState::Ready);
        assert!(host.enable("Quiet").unwrap().is_completed());
        assert!(host.extension("Quiet").unwrap().is_enabled());
        assert!(matches!(host.enable("Nope"), Err(HostError::ExtensionNotFound(_))));
        assert_eq!(host.config_changed("Quiet", "Enabled").unwrap().delivered, 1);
        assert!(matches!(
            host.config_changed("Nope", "Enabled"),
            Err(HostError::ExtensionNotFound(_))
        ));

        let stored = JsonConfigStore::load(&config_path).unwrap();
        assert_eq!(stored.enabled().collect::<Vec<_>>(), vec!["Quiet"]);

        host.disable("Quiet").unwrap();
        host.shutdown().unwrap();
        assert!(host.is_shut_down());
        assert_eq!(host.extension("Quiet").unwrap().state(), ExtensionState::Disposed);

        let stored = JsonConfigStore::load(&config_path).unwrap();
        assert_eq!(stored.enabled().count(), 0);
    }
}
