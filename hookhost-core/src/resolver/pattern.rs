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

//! Byte patterns and named signatures.

use crate::error::{HostError, HostResult};
use std::fmt;
use std::str::FromStr;

/// Opcode of a rel32 `call`.
const CALL_REL32: u8 = 0xE8;
/// Opcode of a rel32 `jmp`.
const JMP_REL32: u8 = 0xE9;

/// A byte sequence with wildcards, written as `"E8 ?? ?? ?? ?? 48 8B"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<Option<u8>>,
}

impl Pattern {
    /// Parse space-separated hex bytes; `?` and `??` are wildcards.
    pub fn parse(source: &str) -> HostResult<Self> {
        let invalid = |reason: String| HostError::InvalidPattern {
            pattern: source.to_string(),
            reason,
        };

        let mut bytes = Vec::new();
        for token in source.split_whitespace() {
            match token {
                "?" | "??" => bytes.push(None),
                _ if token.len() == 2 => {
                    let byte = u8::from_str_radix(token, 16)
                        .map_err(|_| invalid(format!("'{}' is not a hex byte", token)))?;
                    bytes.push(Some(byte));
                }
                _ => return Err(invalid(format!("'{}' is not a hex byte", token))),
            }
        }

        if bytes.is_empty() {
            return Err(invalid("pattern is empty".to_string()));
        }
        if bytes.iter().all(Option::is_none) {
            return Err(invalid("pattern has no fixed bytes".to_string()));
        }

        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether `window` (exactly `len()` bytes) matches.
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() == self.bytes.len()
            && self
                .bytes
                .iter()
                .zip(window)
                .all(|(expected, actual)| expected.map_or(true, |b| b == *actual))
    }

    /// Offset of the first match in `haystack`.
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        if haystack.len() < self.bytes.len() {
            return None;
        }

        // Anchor on the first fixed byte so most windows are rejected cheaply.
        let (anchor_idx, anchor) = self
            .bytes
            .iter()
            .enumerate()
            .find_map(|(i, b)| b.map(|b| (i, b)))?;

        let last_start = haystack.len() - self.bytes.len();
        (0..=last_start).find(|&start| {
            haystack[start + anchor_idx] == anchor
                && self.matches(&haystack[start..start + self.bytes.len()])
        })
    }

    /// Whether the pattern begins with a rel32 `call` or `jmp`.
    pub fn is_relative_branch(&self) -> bool {
        matches!(self.bytes.first(), Some(Some(CALL_REL32 | JMP_REL32)))
    }
}

impl FromStr for Pattern {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pattern::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match byte {
                Some(b) => write!(f, "{:02X}", b)?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

/// A named pattern locating one entry point in the host binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    id: String,
    pattern: Pattern,
    follow_relative: bool,
}

impl Signature {
    /// Create a signature. Patterns starting with a rel32 `call`/`jmp`
    /// resolve to the branch target rather than the match site.
    pub fn new(id: impl Into<String>, pattern: &str) -> HostResult<Self> {
        let pattern = Pattern::parse(pattern)?;
        Ok(Self {
            id: id.into(),
            follow_relative: pattern.is_relative_branch(),
            pattern,
        })
    }

    /// Override whether the rel32 operand after the first byte is followed.
    pub fn with_follow_relative(mut self, follow: bool) -> Self {
        self.follow_relative = follow;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn follow_relative(&self) -> bool {
        self.follow_relative
    }

    /// Key under which this signature is resolved and cached.
    pub fn cache_key(&self, type_key: Option<&str>) -> String {
        match type_key {
            Some(type_key) => format!("{}<{}>", self.id, type_key),
            None => self.id.clone(),
        }
    }
}
