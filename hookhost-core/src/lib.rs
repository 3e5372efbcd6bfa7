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

//! Hookhost Extension Host
//!
//! An in-process host for independently written feature modules
//! ("extensions"). The host finds the entry points each extension needs in
//! the running binary, intercepts them, and forwards host events to the
//! extensions that are switched on.
//!
//! # Architecture
//!
//! - **Resolver**: byte-pattern signatures resolved against a search space,
//!   with a per-binary-version offset cache
//! - **Hooks**: per-extension address, generic and dispatch-table hooks
//! - **Lifecycle**: `Unresolved -> Ready | Outdated`, `Ready <-> Enabled`,
//!   `Disposed` at shutdown
//! - **Dispatcher**: events delivered in registration order to enabled
//!   extensions, with every handler failure contained
//!
//! # Example
//!
//! ```rust,ignore
//! use hookhost_core::{Extension, ExtensionHost, ExtensionInfo, HostConfig, SearchSpace};
//!
//! #[derive(Default)]
//! struct AutoSort;
//!
//! impl Extension for AutoSort {
//!     fn info(&self) -> ExtensionInfo {
//!         ExtensionInfo::new("AutoSort", "Auto Sort")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> hookhost_core::HostResult<()> {
//!     hookhost_core::init_tracing();
//!
//!     let space = unsafe { SearchSpace::new(module_base, module_size)? };
//!     let mut host = ExtensionHost::builder(HostConfig::default())
//!         .version(game_version)
//!         .search_space(space)
//!         .register(AutoSort::default)
//!         .start()
//!         .await?;
//!
//!     host.tick();
//!     host.shutdown()
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod extension;
pub mod hooks;
pub mod host;
pub mod lifecycle;
pub mod registry;
pub mod resolver;
pub mod testing;

// Re-exports
pub use config::{EnabledSet, HostConfig, JsonConfigStore, MemoryConfigStore};
pub use dispatcher::{DispatchReport, EventDispatcher, FrameContext, HandlerFailure, HostEvent};
pub use error::{ExtensionError, ExtensionResult, HostError, HostResult};
pub use extension::{Extension, ExtensionInfo, ExtensionState, FailureKind, StageFailure};
pub use hooks::{
    HookDescriptor, HookFailure, HookFailureReason, HookHandle, HookKind, HookSet, HookSetError,
    HookStatus, Interception, Interceptor, NativeInterceptor, VTableRef,
};
#[cfg(feature = "subscriber")]
pub use host::init_tracing;
pub use host::{ExtensionHost, HostBuilder};
pub use lifecycle::{LifecycleController, StageOutcome};
pub use registry::{ExtensionEntry, ExtensionFactory, ExtensionRegistry, ExtensionStatus};
pub use resolver::{
    AddressResolver, MemoryScanner, Pattern, Resolution, ResolveRequest, SearchSpace, Signature,
    SignatureScanner,
};

/// Prefix of signature cache file names; the host version and `.json` follow.
pub const CACHE_FILE_PREFIX: &str = "SigCache_";

/// Default file name of the enabled-extension store
pub const CONFIG_FILE_NAME: &str = "hookhost.json";
