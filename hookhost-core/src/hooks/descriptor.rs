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

//! Hook descriptors declared by extensions.

use super::interceptor::Interception;
use crate::resolver::{ResolveRequest, Signature};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Finds a type's dispatch table when hooks are resolved.
pub type TableLocator = Arc<dyn Fn() -> Option<usize> + Send + Sync>;

/// A virtual-dispatch table of a known host type.
#[derive(Clone)]
pub struct VTableRef {
    type_name: String,
    slot_count: usize,
    locate: TableLocator,
}

impl VTableRef {
    /// Table found by `locate` at resolve time; `None` means the type is unavailable.
    pub fn new(
        type_name: impl Into<String>,
        slot_count: usize,
        locate: impl Fn() -> Option<usize> + Send + Sync + 'static,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            slot_count,
            locate: Arc::new(locate),
        }
    }

    /// Table at a fixed address.
    pub fn fixed(type_name: impl Into<String>, address: usize, slot_count: usize) -> Self {
        Self::new(type_name, slot_count, move || Some(address).filter(|a| *a != 0))
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub(crate) fn locate(&self) -> Option<usize> {
        (self.locate)().filter(|a| *a != 0)
    }
}

impl fmt::Debug for VTableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VTableRef")
            .field("type_name", &self.type_name)
            .field("slot_count", &self.slot_count)
            .finish()
    }
}

/// How a hook's target is found.
#[derive(Debug, Clone)]
pub enum HookKind {
    /// Entry point located by signature.
    Address { signature: Signature },
    /// Instantiation of a generic host function, located by signature and
    /// keyed by its type argument.
    GenericAddress { signature: Signature, type_key: String },
    /// Slot of a known dispatch table; never scanned for.
    VTable { table: VTableRef, slot: usize },
}

impl HookKind {
    pub fn is_vtable(&self) -> bool {
        matches!(self, HookKind::VTable { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            HookKind::Address { .. } => "address",
            HookKind::GenericAddress { .. } => "generic_address",
            HookKind::VTable { .. } => "vtable",
        }
    }

    /// Resolver request for signature-based kinds.
    pub fn resolve_request(&self) -> Option<ResolveRequest> {
        match self {
            HookKind::Address { signature } => Some(ResolveRequest::new(signature.clone(), None)),
            HookKind::GenericAddress {
                signature,
                type_key,
            } => Some(ResolveRequest::new(signature.clone(), Some(type_key))),
            HookKind::VTable { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct HandleState {
    target: AtomicUsize,
    original: AtomicUsize,
    installed: AtomicBool,
}

/// Shared view of a hook, kept by the extension to call the original.
#[derive(Debug, Clone)]
pub struct HookHandle {
    name: Arc<str>,
    state: Arc<HandleState>,
}

impl HookHandle {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(HandleState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_installed(&self) -> bool {
        self.state.installed.load(Ordering::Acquire)
    }

    /// Resolved target address.
    pub fn target(&self) -> Option<usize> {
        non_zero(self.state.target.load(Ordering::Acquire))
    }

    /// Address running the unhooked implementation, while installed.
    pub fn original(&self) -> Option<usize> {
        if !self.is_installed() {
            return None;
        }
        non_zero(self.state.original.load(Ordering::Acquire))
    }

    /// The unhooked function as a function pointer.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the hooked function's
    /// signature and calling convention. Returns `None` for types that are
    /// not pointer sized.
    pub unsafe fn original_as<F: Copy>(&self) -> Option<F> {
        if std::mem::size_of::<F>() != std::mem::size_of::<usize>() {
            return None;
        }
        self.original()
            .map(|address| std::mem::transmute_copy::<usize, F>(&address))
    }

    pub(crate) fn publish_target(&self, target: usize) {
        self.state.target.store(target, Ordering::Release);
    }

    pub(crate) fn publish_installed(&self, original: usize) {
        self.state.original.store(original, Ordering::Release);
        self.state.installed.store(true, Ordering::Release);
    }

    pub(crate) fn publish_uninstalled(&self) {
        self.state.installed.store(false, Ordering::Release);
        self.state.original.store(0, Ordering::Release);
    }
}

fn non_zero(value: usize) -> Option<usize> {
    (value != 0).then_some(value)
}

/// A declared interception point owned by one extension.
pub struct HookDescriptor {
    name: String,
    kind: HookKind,
    detour: usize,
    target: Option<usize>,
    handle: HookHandle,
    pub(crate) interception: Option<Box<dyn Interception>>,
}

impl HookDescriptor {
    fn new(name: impl Into<String>, kind: HookKind, detour: *const ()) -> Self {
        let name = name.into();
        Self {
            handle: HookHandle::new(&name),
            name,
            kind,
            detour: detour as usize,
            target: None,
            interception: None,
        }
    }

    /// Hook on an entry point located by `signature`.
    pub fn address(name: impl Into<String>, signature: Signature, detour: *const ()) -> Self {
        Self::new(name, HookKind::Address { signature }, detour)
    }

    /// Hook on the instantiation of a generic host function for `type_key`.
    pub fn generic_address(
        name: impl Into<String>,
        signature: Signature,
        type_key: impl Into<String>,
        detour: *const (),
    ) -> Self {
        Self::new(
            name,
            HookKind::GenericAddress {
                signature,
                type_key: type_key.into(),
            },
            detour,
        )
    }

    /// Hook on `slot` of `table`.
    pub fn vtable(name: impl Into<String>, table: VTableRef, slot: usize, detour: *const ()) -> Self {
        Self::new(name, HookKind::VTable { table, slot }, detour)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &HookKind {
        &self.kind
    }

    pub fn detour(&self) -> usize {
        self.detour
    }

    pub fn target(&self) -> Option<usize> {
        self.target
    }

    pub fn is_resolved(&self) -> bool {
        self.target.is_some()
    }

    pub fn is_installed(&self) -> bool {
        self.interception
            .as_ref()
            .map_or(false, |interception| interception.is_enabled())
    }

    /// Handle shared with the extension; clone it before handing the
    /// descriptor to the host.
    pub fn handle(&self) -> HookHandle {
        self.handle.clone()
    }

    pub(crate) fn set_target(&mut self, target: usize) {
        self.target = Some(target);
        self.handle.publish_target(target);
    }

    pub(crate) fn handle_ref(&self) -> &HookHandle {
        &self.handle
    }
}

impl fmt::Debug for HookDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("target", &self.target.map(|t| format!("{:#x}", t)))
            .field("installed", &self.is_installed())
            .finish()
    }
}
