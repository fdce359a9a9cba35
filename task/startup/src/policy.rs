// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Restart escalation policy.
//!
//! Each time startup runs out of time we restart, and each restart is a
//! little more drastic than the last: processor resets until those are used
//! up, then a power-on reset, and once power-on resets are used up too, a
//! switch to the other boot partition. Everything here is pure so the policy
//! can be checked without any I/O.

use psp_userlib::ResetType;

/// Failed startups so far, as persisted across restarts.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Counters {
    /// Processor resets since the last power-on escalation.
    pub failed_attempts: u32,
    /// Power-on resets since the last partition toggle.
    pub failed_reset_attempts: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Limits {
    pub max_processor_resets: u32,
    pub max_poweron_resets: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_processor_resets: psp_config::STARTUP_MAX_PROCESSOR_RESETS,
            max_poweron_resets: psp_config::STARTUP_MAX_POWERON_RESETS,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Escalation {
    Processor,
    PowerOn,
    Toggle,
}

impl From<ResetType> for Escalation {
    fn from(t: ResetType) -> Self {
        match t {
            ResetType::Processor => Escalation::Processor,
            ResetType::PowerOn => Escalation::PowerOn,
            ResetType::CfsToggle => Escalation::Toggle,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SupervisorState {
    /// No startup timer.
    Quiescent,
    /// Timer running; waiting for startup to be cleared.
    Armed,
    /// Timer fired; a restart is committed.
    Escalating(Escalation),
    /// Startup finished in time.
    Cleared,
}

/// Picks the reset to issue for one more failed startup, and the counters
/// to persist across it.
pub fn next_state(c: Counters, limits: &Limits) -> (Counters, ResetType) {
    let attempts = c.failed_attempts.saturating_add(1);
    if attempts < limits.max_processor_resets {
        return (
            Counters {
                failed_attempts: attempts,
                ..c
            },
            ResetType::Processor,
        );
    }
    let resets = c.failed_reset_attempts.saturating_add(1);
    if resets < limits.max_poweron_resets {
        (
            Counters {
                failed_attempts: 0,
                failed_reset_attempts: resets,
            },
            ResetType::PowerOn,
        )
    } else {
        (Counters::default(), ResetType::CfsToggle)
    }
}
