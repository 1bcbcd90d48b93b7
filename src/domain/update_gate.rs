//! Debounce and lock discipline for configuration pushes.
//!
//! At most one push is in flight. After it completes the gate stays locked
//! for a cooldown; any resolve request seen while locked is folded into a
//! single follow-up pass when the cooldown ends.

use std::time::{Duration, Instant};
use tracing::trace;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Unlocked,
    /// A resolve pass is running right now.
    Applying,
    /// A push was sent and has not been answered.
    AwaitingCompletion,
    Cooldown { until: Instant },
}

#[derive(Debug)]
pub struct UpdateGate {
    cooldown: Duration,
    state: GateState,
    pending: bool,
}

impl UpdateGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state: GateState::Unlocked,
            pending: false,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state != GateState::Unlocked
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Ask for a resolve pass. Returns true when the caller should resolve
    /// and push now; otherwise the request is remembered.
    pub fn request(&mut self) -> bool {
        match self.state {
            GateState::Unlocked => {
                self.state = GateState::Applying;
                true
            }
            _ => {
                trace!(state = ?self.state, "resolve deferred");
                self.pending = true;
                false
            }
        }
    }

    /// The resolve pass finished. `pushed` says whether it sent anything
    /// to the transport.
    pub fn finish_apply(&mut self, pushed: bool, now: Instant) {
        if self.state != GateState::Applying {
            return;
        }
        self.state = if pushed {
            GateState::AwaitingCompletion
        } else if self.pending {
            GateState::Cooldown { until: now }
        } else {
            GateState::Unlocked
        };
    }

    /// The transport answered the push, successfully or not.
    pub fn push_completed(&mut self, now: Instant) {
        if self.state == GateState::AwaitingCompletion {
            self.state = GateState::Cooldown {
                until: now + self.cooldown,
            };
        }
    }

    /// Advance the cooldown. Returns true when a deferred pass must run now,
    /// in which case the gate is already locked for it.
    pub fn poll(&mut self, now: Instant) -> bool {
        let GateState::Cooldown { until } = self.state else {
            return false;
        };
        if now < until {
            return false;
        }
        if std::mem::take(&mut self.pending) {
            self.state = GateState::Applying;
            true
        } else {
            self.state = GateState::Unlocked;
            false
        }
    }

    /// Forget everything, e.g. when the device goes away mid-push.
    pub fn reset(&mut self) {
        self.state = GateState::Unlocked;
        self.pending = false;
    }
}

impl Default for UpdateGate {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
