// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time PSP configuration.
//!
//! The constants in here are generated by `build.rs` from
//! `app/<board>/psp.toml`, where `<board>` comes from the `PSP_BOARD`
//! environment variable (default `sp0`). The build script rejects nonsense
//! values; the assertions below hold the generated file to the same bounds.

#![no_std]

use psp_abi::{Priority, ScrubRunMode};
use static_assertions::const_assert;

include!(concat!(env!("OUT_DIR"), "/psp_config.rs"));

/// Shortest watchdog timeout the FPGA accepts.
pub const WATCHDOG_MIN_TIMEOUT_MS: u32 = 1;
/// Longest watchdog timeout the FPGA accepts.
pub const WATCHDOG_MAX_TIMEOUT_MS: u32 = 60_000;

/// Longest path we will build for any PSP-owned file.
pub const MAX_PATH_LEN: usize = 128;

/// Alignment of every reserved-memory block.
pub const RESERVED_MEM_ALIGN: usize = 4;

const_assert!(
    RESET_AREA_SIZE + CDS_SIZE + VOLATILE_DISK_SIZE + USER_RESERVED_SIZE
        <= RESERVED_MEM_BUDGET
);

const_assert!(MEMSYNC_DEFAULT_FREQUENCY_MS > 0);
const_assert!(MEMSYNC_PRIORITY_LOW <= MEMSYNC_DEFAULT_PRIORITY);
const_assert!(MEMSYNC_DEFAULT_PRIORITY <= MEMSYNC_PRIORITY_HIGH);
const_assert!(MEMSYNC_CHUNK_SIZE > 0);
const_assert!(RESET_BACKING_FILE.len() <= MAX_PATH_LEN);
const_assert!(CDS_BACKING_FILE.len() <= MAX_PATH_LEN);
const_assert!(VOLATILE_DISK_BACKING_FILE.len() <= MAX_PATH_LEN);
const_assert!(USER_RESERVED_BACKING_FILE.len() <= MAX_PATH_LEN);

const_assert!(MEMSCRUB_PRIORITY_LOW <= MEMSCRUB_DEFAULT_PRIORITY);
const_assert!(MEMSCRUB_DEFAULT_PRIORITY <= MEMSCRUB_PRIORITY_HIGH);
const_assert!(MEMSCRUB_DEFAULT_START_ADDR < MEMSCRUB_DEFAULT_END_ADDR);
const_assert!(MEMSCRUB_BLOCK_SIZE > 0);
const_assert!(MEMSCRUB_BLOCK_SIZE % 4 == 0);
const_assert!(MEMSCRUB_DEFAULT_START_ADDR % 4 == 0);
const_assert!(MEMSCRUB_DEFAULT_END_ADDR % 4 == 0);
const_assert!(MEMSCRUB_TASK_DELAY_MS > 0);

const_assert!(WATCHDOG_DEFAULT_TIMEOUT_MS >= WATCHDOG_MIN_TIMEOUT_MS);
const_assert!(WATCHDOG_DEFAULT_TIMEOUT_MS <= WATCHDOG_MAX_TIMEOUT_MS);

const_assert!(STARTUP_MAX_PROCESSOR_RESETS >= 1);
const_assert!(STARTUP_MAX_POWERON_RESETS >= 1);
const_assert!(STARTUP_MAX_WAIT_SEC > 0);
const_assert!(FAILED_STARTUP_FILENAME.len() <= FAILED_STARTUP_FILENAME_MAX_LEN);
const_assert!(
    DEFAULT_CFS_PARTITION.len() + 1 + FAILED_STARTUP_FILENAME_MAX_LEN
        <= MAX_PATH_LEN
);
