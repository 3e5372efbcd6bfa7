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

//! Interceptor backends.
//!
//! An [`Interception`] is created disabled; enabling redirects calls to the
//! detour, disabling restores the original dispatch. Either can be repeated.

use crate::error::{HostError, HostResult};

/// One redirection of a function, owned by a hook descriptor.
pub trait Interception: Send {
    fn enable(&mut self) -> HostResult<()>;

    fn disable(&mut self) -> HostResult<()>;

    fn is_enabled(&self) -> bool;

    /// Address that runs the unhooked implementation.
    fn original(&self) -> usize;
}

/// Creates interceptions in the host process.
pub trait Interceptor: Send + Sync {
    /// Prepare an inline detour of the function at `target`.
    ///
    /// # Safety
    ///
    /// `target` must be the entry of a function in executable memory and
    /// `detour` a function with the same signature and calling convention.
    unsafe fn inline(&self, target: usize, detour: usize) -> HostResult<Box<dyn Interception>>;

    /// Prepare a redirection of the dispatch-table entry at `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must point to a pointer-sized, aligned dispatch-table entry
    /// that outlives the interception.
    unsafe fn table_slot(&self, slot: usize, detour: usize) -> HostResult<Box<dyn Interception>>;
}

/// Interceptor patching the running process.
///
/// Inline detours use `retour` and are only available on x86 and x86_64;
/// table slots are rewritten in place after lifting page protection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeInterceptor;

impl Interceptor for NativeInterceptor {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    unsafe fn inline(&self, target: usize, detour: usize) -> HostResult<Box<dyn Interception>> {
        let detour = retour::RawDetour::new(target as *const (), detour as *const ())
            .map_err(|e| HostError::Interceptor(format!("detour at {:#x}: {}", target, e)))?;
        Ok(Box::new(InlineDetour { detour }))
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    unsafe fn inline(&self, target: usize, _detour: usize) -> HostResult<Box<dyn Interception>> {
        Err(HostError::Interceptor(format!(
            "inline hooks are not supported on this architecture (target {:#x})",
            target
        )))
    }

    unsafe fn table_slot(&self, slot: usize, detour: usize) -> HostResult<Box<dyn Interception>> {
        if slot == 0 || slot % std::mem::align_of::<usize>() != 0 {
            return Err(HostError::Interceptor(format!(
                "table slot {:#x} is not a valid pointer slot",
                slot
            )));
        }
        let original = (slot as *const usize).read_volatile();
        Ok(Box::new(SlotPatch {
            slot,
            detour,
            original,
            enabled: false,
        }))
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
struct InlineDetour {
    detour: retour::RawDetour,
}

// SAFETY: the detour only holds addresses and its trampoline allocation;
// enabling and disabling are serialized by the owning descriptor.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
unsafe impl Send for InlineDetour {}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl Interception for InlineDetour {
    fn enable(&mut self) -> HostResult<()> {
        // SAFETY: target and detour were validated when the detour was created.
        unsafe { self.detour.enable() }.map_err(|e| HostError::Interceptor(e.to_string()))
    }

    fn disable(&mut self) -> HostResult<()> {
        // SAFETY: see `enable`.
        unsafe { self.detour.disable() }.map_err(|e| HostError::Interceptor(e.to_string()))
    }

    fn is_enabled(&self) -> bool {
        self.detour.is_enabled()
    }

    fn original(&self) -> usize {
        self.detour.trampoline() as *const () as usize
    }
}

struct SlotPatch {
    slot: usize,
    detour: usize,
    original: usize,
    enabled: bool,
}

impl SlotPatch {
    fn write(&self, value: usize) -> HostResult<()> {
        let ptr = self.slot as *mut usize;
        // Keep whatever else the page allows; tables can share pages with code.
        let current = region::query(ptr as *const usize)
            .map_err(|e| HostError::Interceptor(format!("query slot {:#x}: {}", self.slot, e)))?
            .protection();
        // SAFETY: `table_slot` checked the slot is a live, aligned pointer entry.
        unsafe {
            let _guard = region::protect_with_handle(
                ptr as *const usize,
                std::mem::size_of::<usize>(),
                current | region::Protection::WRITE,
            )
            .map_err(|e| HostError::Interceptor(format!("unprotect slot {:#x}: {}", self.slot, e)))?;
            ptr.write_volatile(value);
        }
        Ok(())
    }
}

impl Interception for SlotPatch {
    fn enable(&mut self) -> HostResult<()> {
        if !self.enabled {
            self.write(self.detour)?;
            self.enabled = true;
        }
        Ok(())
    }

    fn disable(&mut self) -> HostResult<()> {
        if self.enabled {
            self.write(self.original)?;
            self.enabled = false;
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn original(&self) -> usize {
        self.original
    }
}

impl Drop for SlotPatch {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            tracing::error!(slot = %format!("{:#x}", self.slot), error = %e, "Failed to restore table slot");
        }
    }
}
