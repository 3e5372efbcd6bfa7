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

//! Search space and the pattern scanning contract.

use super::pattern::{Pattern, Signature};
use crate::error::{HostError, HostResult};

/// A readable region of the host binary: base address plus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchSpace {
    base: usize,
    size: usize,
}

impl SearchSpace {
    /// Describe the region `[base, base + size)`.
    ///
    /// # Safety
    ///
    /// The whole region must stay mapped and readable for as long as any
    /// scanner may read it, i.e. for the lifetime of the host.
    pub unsafe fn new(base: usize, size: usize) -> HostResult<Self> {
        if base == 0 {
            return Err(HostError::InvalidSearchSpace("base address is null".to_string()));
        }
        if size == 0 {
            return Err(HostError::InvalidSearchSpace("size is zero".to_string()));
        }
        if base.checked_add(size).is_none() {
            return Err(HostError::InvalidSearchSpace(format!(
                "{:#x} + {:#x} overflows the address space",
                base, size
            )));
        }
        Ok(Self { base, size })
    }

    /// Search space over memory that lives for the rest of the process.
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self {
            base: bytes.as_ptr() as usize,
            size: bytes.len(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base < self.size
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: readability of the region is the contract of `new` and
        // guaranteed by the `'static` borrow in `from_static`.
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.size) }
    }
}

/// The pattern engine as seen by the resolver.
pub trait SignatureScanner: Send + Sync {
    /// Offset from `space.base()` of the first match, if any.
    fn scan(&self, space: &SearchSpace, pattern: &Pattern) -> Option<usize>;

    /// Read the little-endian `i32` at `offset`, if it lies inside `space`.
    fn read_i32(&self, space: &SearchSpace, offset: usize) -> Option<i32>;
}

/// Scans the search space directly in process memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryScanner;

impl SignatureScanner for MemoryScanner {
    fn scan(&self, space: &SearchSpace, pattern: &Pattern) -> Option<usize> {
        pattern.find_in(space.as_bytes())
    }

    fn read_i32(&self, space: &SearchSpace, offset: usize) -> Option<i32> {
        let bytes = space.as_bytes().get(offset..offset.checked_add(4)?)?;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Locate `signature` in `space`, returning the offset of the entry point.
///
/// For rel32 branch signatures the offset is that of the branch target.
pub(crate) fn locate(
    scanner: &dyn SignatureScanner,
    space: &SearchSpace,
    signature: &Signature,
) -> Option<u64> {
    let hit = scanner.scan(space, signature.pattern())?;
    if !signature.follow_relative() {
        return Some(hit as u64);
    }

    // Operand sits right after the opcode; the target is relative to the
    // end of the 5-byte instruction.
    let displacement = scanner.read_i32(space, hit + 1)?;
    let next_instruction = (hit + 5) as i64;
    Some((next_instruction + displacement as i64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak(bytes: Vec<u8>) -> SearchSpace {
        SearchSpace::from_static(Box::leak(bytes.into_boxed_slice()))
    }

    #[test]
    fn test_new_validates_range() {
        unsafe {
            assert!(SearchSpace::new(0, 16).is_err());
            assert!(SearchSpace::new(0x1000, 0).is_err());
            assert!(SearchSpace::new(usize::MAX, 2).is_err());
            assert!(SearchSpace::new(0x1000, 0x10).is_ok());
        }
    }

    #[test]
    fn test_contains() {
        let space = leak(vec![0u8; 8]);
        assert!(space.contains(space.base()));
        assert!(space.contains(space.base() + 7));
        assert!(!space.contains(space.base() + 8));
    }

    #[test]
    fn test_memory_scanner_finds_offset() {
        let space = leak(vec![0x00, 0x00, 0x48, 0x8B, 0x0D, 0xC3]);
        let pattern = Pattern::parse("48 8B ?? C3").unwrap();
        assert_eq!(MemoryScanner.scan(&space, &pattern), Some(2));
    }

    #[test]
    fn test_locate_follows_call_target() {
        // call +0x10 at offset 1; target = 1 + 5 + 0x10 = 0x16
        let mut bytes = vec![0x90, 0xE8, 0x10, 0x00, 0x00, 0x00, 0x8B, 0x83];
        bytes.resize(0x20, 0xCC);
        let space = leak(bytes);

        let sig = Signature::new("Call", "E8 ?? ?? ?? ?? 8B 83").unwrap();
        assert_eq!(locate(&MemoryScanner, &space, &sig), Some(0x16));

        let direct = sig.clone().with_follow_relative(false);
        assert_eq!(locate(&MemoryScanner, &space, &direct), Some(1));
    }

    #[test]
    fn test_locate_negative_displacement() {
        // jmp -0x8 at offset 0x10; target = 0x10 + 5 - 8 = 0x0D
        let mut bytes = vec![0xCC; 0x10];
        bytes.extend_from_slice(&[0xE9, 0xF8, 0xFF, 0xFF, 0xFF, 0x90]);
        let space = leak(bytes);

        let sig = Signature::new("Jmp", "E9 ?? ?? ?? ?? 90").unwrap();
        assert_eq!(locate(&MemoryScanner, &space, &sig), Some(0x0D));
    }
}
