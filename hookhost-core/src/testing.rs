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

//! Test doubles for hosts and extension authors.

use crate::error::{HostError, HostResult};
use crate::hooks::{Interception, Interceptor};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Recorded {
    created: usize,
    live: usize,
    enabled: Vec<usize>,
    log: Vec<String>,
    failing: Vec<usize>,
}

/// Interceptor that patches nothing and records what it was asked to do.
#[derive(Debug, Clone, Default)]
pub struct RecordingInterceptor {
    state: Arc<Mutex<Recorded>>,
}

impl RecordingInterceptor {
    /// Offset added to a target to form its fake trampoline address.
    pub const TRAMPOLINE_OFFSET: usize = 0x10;

    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to create interceptions for `target`.
    pub fn failing_at(self, target: usize) -> Self {
        self.state.lock().failing.push(target);
        self
    }

    /// Number of interceptions created.
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    /// Number of interceptions not yet dropped.
    pub fn live(&self) -> usize {
        self.state.lock().live
    }

    /// Number of currently enabled interceptions.
    pub fn enabled_count(&self) -> usize {
        self.state.lock().enabled.len()
    }

    /// Targets currently redirected.
    pub fn enabled_targets(&self) -> Vec<usize> {
        self.state.lock().enabled.clone()
    }

    /// `"enable:0x..."` / `"disable:0x..."` entries in call order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    fn create(&self, target: usize) -> HostResult<Box<dyn Interception>> {
        let mut state = self.state.lock();
        if state.failing.contains(&target) {
            return Err(HostError::Interceptor(format!("refusing {:#x}", target)));
        }
        state.created += 1;
        state.live += 1;
        Ok(Box::new(RecordedInterception {
            state: Arc::clone(&self.state),
            target,
            enabled: false,
        }))
    }
}

impl Interceptor for RecordingInterceptor {
    unsafe fn inline(&self, target: usize, _detour: usize) -> HostResult<Box<dyn Interception>> {
        self.create(target)
    }

    unsafe fn table_slot(&self, slot: usize, _detour: usize) -> HostResult<Box<dyn Interception>> {
        self.create(slot)
    }
}

struct RecordedInterception {
    state: Arc<Mutex<Recorded>>,
    target: usize,
    enabled: bool,
}

impl Interception for RecordedInterception {
    fn enable(&mut self) -> HostResult<()> {
        if !self.enabled {
            let mut state = self.state.lock();
            state.enabled.push(self.target);
            state.log.push(format!("enable:{:#x}", self.target));
            self.enabled = true;
        }
        Ok(())
    }

    fn disable(&mut self) -> HostResult<()> {
        if self.enabled {
            let mut state = self.state.lock();
            state.enabled.retain(|t| *t != self.target);
            state.log.push(format!("disable:{:#x}", self.target));
            self.enabled = false;
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn original(&self) -> usize {
        self.target + RecordingInterceptor::TRAMPOLINE_OFFSET
    }
}

impl Drop for RecordedInterception {
    fn drop(&mut self) {
        let _ = self.disable();
        self.state.lock().live -= 1;
    }
}
