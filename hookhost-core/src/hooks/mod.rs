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

//! Function interception
//!
//! Each extension declares a fixed list of [`HookDescriptor`]s. The host keeps
//! them in a per-extension [`HookSet`], which resolves their targets and
//! installs or removes the underlying [`Interception`]s.
//!
//! Three hook shapes are supported:
//!
//! - **Address**: entry point found by signature scan
//! - **GenericAddress**: like Address, for one instantiation of a generic host
//!   function, cached under `id<type_key>`
//! - **VTable**: slot of a known dispatch table, no scanning involved
//!
//! # Example
//!
//! ```rust,ignore
//! use hookhost_core::hooks::{HookDescriptor, VTableRef};
//! use hookhost_core::resolver::Signature;
//!
//! let update = HookDescriptor::address(
//!     "framework_update",
//!     Signature::new("Framework.Update", "40 53 48 83 EC 20 48 8B D9")?,
//!     framework_update_detour as *const (),
//! );
//! let original = update.handle();
//! ```

mod descriptor;
mod interceptor;
mod registry;

pub use descriptor::{HookDescriptor, HookHandle, HookKind, TableLocator, VTableRef};
pub use interceptor::{Interception, Interceptor, NativeInterceptor};
pub use registry::{HookFailure, HookFailureReason, HookSet, HookSetError, HookStatus};
