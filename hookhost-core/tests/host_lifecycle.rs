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

//! End-to-end host startup, runtime and shutdown.

use hookhost_core::testing::RecordingInterceptor;
use hookhost_core::{
    EnabledSet, Extension, ExtensionError, ExtensionHost, ExtensionInfo, ExtensionResult,
    ExtensionState, FailureKind, FrameContext, HookDescriptor, HostConfig, HostResult,
    MemoryConfigStore, NativeInterceptor, SearchSpace, Signature, VTableRef,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;

type Log = Arc<Mutex<Vec<String>>>;

/// Fake module: two findable functions, nothing else.
fn search_space() -> SearchSpace {
    let bytes = vec![
        0xCC, 0xCC, 0x48, 0x89, 0x5C, 0x24, 0x08, 0xC3, 0xCC, 0x40, 0x53, 0x48, 0x83, 0xEC, 0x20,
        0xC3,
    ];
    SearchSpace::from_static(Box::leak(bytes.into_boxed_slice()))
}

#[derive(Default, Clone)]
struct Behavior {
    fail_enable: bool,
    panic_disable: bool,
    fail_dispose: bool,
}

struct Tweak {
    name: &'static str,
    signatures: Vec<(&'static str, &'static str)>,
    behavior: Behavior,
    log: Log,
}

impl Tweak {
    fn new(name: &'static str, signatures: Vec<(&'static str, &'static str)>, log: &Log) -> Self {
        Self {
            name,
            signatures,
            behavior: Behavior::default(),
            log: Arc::clone(log),
        }
    }

    fn with(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    fn push(&self, what: &str) {
        self.log.lock().push(format!("{}:{}", self.name, what));
    }
}

impl Extension for Tweak {
    fn info(&self) -> ExtensionInfo {
        ExtensionInfo::new(self.name, self.name)
    }

    fn declare_hooks(&mut self) -> Vec<HookDescriptor> {
        self.signatures
            .iter()
            .map(|(id, pattern)| {
                HookDescriptor::address(*id, Signature::new(*id, pattern).unwrap(), 0xDE70 as *const ())
            })
            .collect()
    }

    fn enable(&mut self) -> ExtensionResult {
        self.push("enable");
        if self.behavior.fail_enable {
            return Err(ExtensionError::msg("enable failed"));
        }
        Ok(())
    }

    fn disable(&mut self) -> ExtensionResult {
        self.push("disable");
        if self.behavior.panic_disable {
            panic!("disable blew up");
        }
        Ok(())
    }

    fn dispose(&mut self) -> ExtensionResult {
        self.push("dispose");
        if self.behavior.fail_dispose {
            return Err(ExtensionError::msg("dispose failed"));
        }
        Ok(())
    }

    fn on_tick(&mut self, frame: &FrameContext) -> ExtensionResult {
        self.push(&format!("tick{}", frame.frame));
        Ok(())
    }

    fn on_logout(&mut self) -> ExtensionResult {
        self.push("logout");
        Ok(())
    }

    fn on_panel_closed(&mut self, panel: &str) -> ExtensionResult {
        self.push(&format!("close:{}", panel));
        Ok(())
    }

    fn on_language_changed(&mut self, language: &str) -> ExtensionResult {
        self.push(&format!("language:{}", language));
        Ok(())
    }
}

/// Enabled set that writes its saves into the shared log.
struct LoggedStore {
    inner: MemoryConfigStore,
    log: Log,
}

impl EnabledSet for LoggedStore {
    fn is_enabled(&self, internal_name: &str) -> bool {
        self.inner.is_enabled(internal_name)
    }

    fn set_enabled(&mut self, internal_name: &str, enabled: bool) {
        self.inner.set_enabled(internal_name, enabled);
    }

    fn save(&mut self) -> HostResult<()> {
        self.log.lock().push("config:save".to_string());
        self.inner.save()
    }
}

fn config(dir: &TempDir) -> HostConfig {
    HostConfig::with_data_dir(dir.path())
}

#[tokio::test]
async fn test_startup_scenario_and_tick_delivery() {
    let dir = TempDir::new().unwrap();
    let log = Log::default();
    let interceptor = RecordingInterceptor::new();
    let (a, b, c) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));

    let mut host = ExtensionHost::builder(config(&dir))
        .version("2024.06.01")
        .search_space(search_space())
        .interceptor(Arc::new(interceptor.clone()))
        .enabled_set(Box::new(MemoryConfigStore::new(["A", "B"])))
        .register(move || Tweak::new("A", vec![("Player.Update", "48 89 5C 24")], &a))
        .register(move || Tweak::new("B", vec![("Gone.Function", "0F 0B 0F 0B")], &b))
        .register(move || Tweak::new("C", vec![("Agent.Receive", "40 53 48 83")], &c))
        .start()
        .await
        .unwrap();

    assert_eq!(host.extension("A").unwrap().state(), ExtensionState::Enabled);
    assert_eq!(host.extension("B").unwrap().state(), ExtensionState::Outdated);
    assert_eq!(
        host.extension("B").unwrap().last_error().unwrap().kind,
        FailureKind::Outdated
    );
    assert_eq!(host.extension("B").unwrap().hooks().installed_count(), 0);

    let ready = host.extension("C").unwrap();
    assert_eq!(ready.state(), ExtensionState::Ready);
    assert_eq!(ready.hooks().resolved_count(), ready.hooks().len());
    assert_eq!(ready.hooks().installed_count(), 0);

    let base = search_space_base(&host);
    assert_eq!(interceptor.enabled_targets(), vec![base + 2]);

    let report = host.tick();
    assert_eq!(report.delivered, 1);
    assert_eq!(*log.lock(), vec!["A:enable", "A:tick1"]);

    let status = host.status();
    assert_eq!(status.len(), 3);
    assert_eq!(status[0].hooks[0].target, Some(base + 2));
}

fn search_space_base(host: &ExtensionHost) -> usize {
    host.resolution().lookup("Player.Update").unwrap() - 2
}

#[tokio::test]
async fn test_enable_failure_after_install_keeps_extension_enabled() {
    let dir = TempDir::new().unwrap();
    let log = Log::default();
    let interceptor = RecordingInterceptor::new();
    let a = Arc::clone(&log);

    let mut host = ExtensionHost::builder(config(&dir))
        .version("1")
        .search_space(search_space())
        .interceptor(Arc::new(interceptor.clone()))
        .enabled_set(Box::new(MemoryConfigStore::new(["A"])))
        .register(move || {
            Tweak::new("A", vec![("Player.Update", "48 89 5C 24")], &a).with(Behavior {
                fail_enable: true,
                ..Behavior::default()
            })
        })
        .start()
        .await
        .unwrap();

    let entry = host.extension("A").unwrap();
    assert_eq!(entry.state(), ExtensionState::Enabled);
    assert_eq!(entry.last_error().unwrap().kind, FailureKind::Activation);
    assert_eq!(interceptor.enabled_count(), 1);

    host.disable("A").unwrap();
    assert_eq!(host.extension("A").unwrap().state(), ExtensionState::Ready);
    assert_eq!(host.extension("A").unwrap().hooks().installed_count(), 0);
    assert_eq!(interceptor.enabled_count(), 0);
}

#[tokio::test]
async fn test_double_enable_installs_once() {
    let dir = TempDir::new().unwrap();
    let log = Log::default();
    let interceptor = RecordingInterceptor::new();
    let c = Arc::clone(&log);

    let mut host = ExtensionHost::builder(config(&dir))
        .version("1")
        .search_space(search_space())
        .interceptor(Arc::new(interceptor.clone()))
        .enabled_set(Box::new(MemoryConfigStore::new(Vec::<String>::new())))
        .register(move || Tweak::new("C", vec![("Agent.Receive", "40 53 48 83")], &c))
        .start()
        .await
        .unwrap();

    assert!(host.enable("C").unwrap().is_completed());
    assert!(host.enable("C").unwrap().is_skipped());
    assert_eq!(interceptor.created(), 1);
    assert_eq!(interceptor.enabled_count(), 1);
    assert_eq!(*log.lock(), vec!["C:enable"]);
}

#[tokio::test]
async fn test_shutdown_disables_then_disposes_everything_once() {
    let dir = TempDir::new().unwrap();
    let log = Log::default();
    let interceptor = RecordingInterceptor::new();
    let (a, b, c, d) = (
        Arc::clone(&log),
        Arc::clone(&log),
        Arc::clone(&log),
        Arc::clone(&log),
    );

    let mut host = ExtensionHost::builder(config(&dir))
        .version("1")
        .search_space(search_space())
        .interceptor(Arc::new(interceptor.clone()))
        .enabled_set(Box::new(LoggedStore {
            inner: MemoryConfigStore::new(["A", "B", "D"]),
            log: Arc::clone(&log),
        }))
        .register(move || {
            Tweak::new("A", vec![("Player.Update", "48 89 5C 24")], &a).with(Behavior {
                panic_disable: true,
                fail_dispose: true,
                ..Behavior::default()
            })
        })
        .register(move || Tweak::new("B", vec![("Gone.Function", "0F 0B 0F 0B")], &b))
        .register(move || Tweak::new("C", vec![], &c))
        .register(move || Tweak::new("D", vec![("Agent.Receive", "40 53 48 83")], &d))
        .start()
        .await
        .unwrap();

    log.lock().clear();
    host.shutdown().unwrap();
    host.shutdown().unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            "D:disable",
            "A:disable",
            "D:dispose",
            "C:dispose",
            "B:dispose",
            "A:dispose",
            "config:save"
        ]
    );
    for entry in host.extensions() {
        assert_eq!(entry.state(), ExtensionState::Disposed);
        assert_eq!(entry.hooks().installed_count(), 0);
    }
    assert_eq!(interceptor.enabled_count(), 0);
    assert_eq!(interceptor.live(), 0);
    assert_eq!(
        host.extension("A").unwrap().last_error().unwrap().kind,
        FailureKind::Disposal
    );

    // Nothing is delivered after shutdown.
    assert_eq!(host.tick().delivered, 0);
}

#[tokio::test]
async fn test_language_change_saves_config_first() {
    let dir = TempDir::new().unwrap();
    let log = Log::default();
    let a = Arc::clone(&log);

    let mut host = ExtensionHost::builder(config(&dir))
        .version("1")
        .search_space(search_space())
        .interceptor(Arc::new(RecordingInterceptor::new()))
        .enabled_set(Box::new(LoggedStore {
            inner: MemoryConfigStore::new(["A"]),
            log: Arc::clone(&log),
        }))
        .register(move || Tweak::new("A", vec![], &a))
        .start()
        .await
        .unwrap();

    log.lock().clear();
    let report = host.language_changed("de");
    assert_eq!(report.delivered, 1);
    assert_eq!(*log.lock(), vec!["config:save", "A:language:de"]);
}

#[tokio::test]
async fn test_dropping_host_tears_down() {
    let dir = TempDir::new().unwrap();
    let log = Log::default();
    let interceptor = RecordingInterceptor::new();
    let a = Arc::clone(&log);

    let host = ExtensionHost::builder(config(&dir))
        .version("1")
        .search_space(search_space())
        .interceptor(Arc::new(interceptor.clone()))
        .enabled_set(Box::new(MemoryConfigStore::new(["A"])))
        .register(move || Tweak::new("A", vec![("Player.Update", "48 89 5C 24")], &a))
        .start()
        .await
        .unwrap();
    assert_eq!(interceptor.enabled_count(), 1);

    drop(host);
    assert_eq!(interceptor.live(), 0);
    assert_eq!(*log.lock(), vec!["A:enable", "A:disable", "A:dispose"]);
}

struct DeclarePanics;

impl Extension for DeclarePanics {
    fn info(&self) -> ExtensionInfo {
        ExtensionInfo::new("DeclarePanics", "Declare Panics")
    }

    fn declare_hooks(&mut self) -> Vec<HookDescriptor> {
        panic!("cannot describe hooks")
    }
}

#[tokio::test]
async fn test_extension_faults_during_startup_are_contained() {
    let dir = TempDir::new().unwrap();
    let log = Log::default();
    let interceptor = RecordingInterceptor::new();
    let a = Arc::clone(&log);

    let mut host = ExtensionHost::builder(config(&dir))
        .version("1")
        .search_space(search_space())
        .interceptor(Arc::new(interceptor.clone()))
        .enabled_set(Box::new(MemoryConfigStore::new(["A", "DeclarePanics"])))
        .register(|| -> Tweak { panic!("factory exploded") })
        .register(|| DeclarePanics)
        .register(move || Tweak::new("A", vec![("Player.Update", "48 89 5C 24")], &a))
        .start()
        .await
        .unwrap();

    assert_eq!(host.extensions().len(), 2);

    let broken = host.extension("DeclarePanics").unwrap();
    assert_eq!(broken.state(), ExtensionState::Unresolved);
    assert_eq!(broken.last_error().unwrap().kind, FailureKind::Resolution);
    assert!(broken.hooks().is_empty());
    assert!(host.enable("DeclarePanics").unwrap().is_skipped());

    assert_eq!(host.extension("A").unwrap().state(), ExtensionState::Enabled);
    assert_eq!(interceptor.enabled_count(), 1);

    host.logout();
    host.panel_closed("Inventory");
    assert_eq!(
        *log.lock(),
        vec!["A:enable", "A:logout", "A:close:Inventory"]
    );
}

struct TablePatcher {
    table: usize,
}

impl Extension for TablePatcher {
    fn info(&self) -> ExtensionInfo {
        ExtensionInfo::new("TablePatcher", "Table Patcher")
    }

    fn declare_hooks(&mut self) -> Vec<HookDescriptor> {
        vec![HookDescriptor::vtable(
            "receive_event",
            VTableRef::fixed("AgentInterface", self.table, 4),
            1,
            0xBEEF as *const (),
        )]
    }
}

#[tokio::test]
async fn test_native_vtable_hook_round_trip() {
    let dir = TempDir::new().unwrap();
    let table: &'static mut [usize; 4] = Box::leak(Box::new([0x100, 0x200, 0x300, 0x400]));
    let base = table.as_ptr() as usize;
    let read = move |slot: usize| unsafe { (base as *const usize).add(slot).read_volatile() };

    let mut host = ExtensionHost::builder(config(&dir))
        .version("1")
        .search_space(search_space())
        .interceptor(Arc::new(NativeInterceptor))
        .enabled_set(Box::new(MemoryConfigStore::new(["TablePatcher"])))
        .register(move || TablePatcher { table: base })
        .start()
        .await
        .unwrap();

    let handle = host.extension("TablePatcher").unwrap().hooks().descriptors()[0].handle();
    assert_eq!(read(1), 0xBEEF);
    assert_eq!(handle.original(), Some(0x200));

    host.disable("TablePatcher").unwrap();
    assert_eq!(read(1), 0x200);
    host.enable("TablePatcher").unwrap();
    assert_eq!(read(1), 0xBEEF);

    host.shutdown().unwrap();
    assert_eq!(read(1), 0x200);
    assert_eq!(read(0), 0x100);
    assert!(!handle.is_installed());
}
