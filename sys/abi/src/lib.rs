// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PSP ABI definitions, shared between the platform support package and the
//! flight-software middleware that sits on top of it.
//!
//! Everything in here crosses the PSP boundary as a plain integer at some
//! point (a status code, a reset type recorded in reserved memory, a run mode
//! stored in a configuration record), so every enum carries an explicit
//! discriminant and can be decoded with `FromPrimitive`.

#![no_std]

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use zerocopy::{Immutable, IntoBytes, KnownLayout};

pub use num_traits::FromPrimitive as FromRaw;

/// Failure kinds reported by PSP operations.
///
/// The discriminants are the flat status codes handed to the middleware;
/// success is `Ok(_)` and is reported as `0` by [`status_code`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(i32)]
pub enum PspError {
    /// The operation failed; the requested change was not applied.
    Error = -1,
    /// A required input or output buffer was missing or empty.
    InvalidPointer = -2,
    ErrorAddressMisaligned = -3,
    ErrorTimeout = -4,
    InvalidMemAddr = -21,
    /// The memory type (reserved block id) is not one we know.
    InvalidMemType = -22,
    /// Address or offset range is inverted or outside the block.
    InvalidMemRange = -23,
    InvalidMemWordSize = -24,
    /// A size argument does not match what the operation requires.
    InvalidMemSize = -25,
    /// Feature is not present on this board build.
    ErrorNotImplemented = -27,
}

pub type PspResult<T> = Result<T, PspError>;

impl From<PspError> for i32 {
    fn from(e: PspError) -> Self {
        e as i32
    }
}

/// Flattens a result into the status code the middleware expects.
pub fn status_code<T>(r: &PspResult<T>) -> i32 {
    match r {
        Ok(_) => 0,
        Err(e) => *e as i32,
    }
}

/// Restart severities, from a warm restart up to switching the boot image.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(u32)]
pub enum ResetType {
    Processor = 1,
    PowerOn = 2,
    /// Power-on reset that also switches the active boot partition.
    CfsToggle = 3,
}

/// Finer-grained cause of the last reset, as reported by the board.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, Serialize, Deserialize,
)]
#[repr(u32)]
pub enum ResetSubtype {
    PowerCycle = 1,
    PushButton = 2,
    HwSpecialCommand = 3,
    HwWatchdog = 4,
    ResetCommand = 5,
    Exception = 6,
    Undefined = 7,
    HwDebugReset = 8,
    BankSwitch = 9,
}

/// How the memory scrubber spends its time.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[serde(rename_all = "kebab-case")]
#[repr(u32)]
pub enum ScrubRunMode {
    /// Task exists but does no work.
    Idle = 0,
    /// Blocks are scrubbed back to back, yielding between them.
    Automatic = 1,
    /// A full-range pass is run each time the scrubber is triggered.
    Manual = 2,
    /// One block is scrubbed per task period.
    Timed = 3,
}

/// RTOS task priority. Lower numbers are more urgent.
pub type Priority = u8;
