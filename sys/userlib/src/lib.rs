// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Platform services consumed by the PSP.
//!
//! The PSP sits between the flight-software middleware and the board, and
//! leans on a handful of services it does not implement itself: RTOS tasks,
//! timers and semaphores; a filesystem; memory-mapped registers; and a few
//! board primitives (restart, RAM discovery, boot partition lookup). Each of
//! those is a trait here, so the PSP logic can be driven by the real RTOS on
//! target and by the fakes in [`fakes`] on a development host.
//!
//! This also re-exports the contents of the `psp-abi` crate.

#![cfg_attr(not(any(test, feature = "fakes", feature = "log-std")), no_std)]

#[macro_use]
pub mod macros;

pub mod hl;
pub mod mmio;

#[cfg(any(test, feature = "fakes"))]
pub mod fakes;

pub use psp_abi::*;

/// Handle to an RTOS task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct TaskId(pub u32);

/// Handle to a binary semaphore.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct SemId(pub u32);

/// Handle to a timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct TimerId(pub u32);

/// Open file descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Fd(pub i32);

/// Failures reported by the RTOS primitives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OsError {
    Error,
    InvalidId,
    NameTaken,
    NoFreeIds,
    Timeout,
    InvalidPriority,
}

/// Failures reported by the filesystem.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    NoSpace,
    BadDescriptor,
    InvalidPath,
    Io,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    ReadOnly,
    /// Write-only; creates the file if missing and truncates it otherwise.
    CreateTruncate,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FileStat {
    pub size: u32,
}

/// Body of a long-lived RTOS task.
///
/// `run` is called once, on the new task, and the task ends when it returns.
pub trait TaskBody: Sync {
    fn run(&self);
}

/// Callback invoked in timer-service context when a timer expires.
pub trait TimerHook: Sync {
    fn expired(&self, timer: TimerId);
}

/// RTOS task, semaphore and timer primitives.
pub trait Os: Sync {
    fn task_create(
        &self,
        name: &str,
        priority: Priority,
        body: &'static dyn TaskBody,
    ) -> Result<TaskId, OsError>;

    fn task_set_priority(
        &self,
        task: TaskId,
        priority: Priority,
    ) -> Result<(), OsError>;

    /// Blocks the calling task for at least `ms` milliseconds.
    fn task_delay(&self, ms: u32);

    fn bin_sem_create(
        &self,
        name: &str,
        initially_full: bool,
    ) -> Result<SemId, OsError>;

    fn bin_sem_give(&self, sem: SemId) -> Result<(), OsError>;

    /// Takes `sem`, waiting forever if `timeout_ms` is `None`.
    fn bin_sem_take(
        &self,
        sem: SemId,
        timeout_ms: Option<u32>,
    ) -> Result<(), OsError>;

    fn timer_create(
        &self,
        name: &str,
        hook: &'static dyn TimerHook,
    ) -> Result<TimerId, OsError>;

    /// Arms `timer` to fire after `start_ms`, then every `interval_ms`
    /// (zero for one-shot).
    fn timer_set(
        &self,
        timer: TimerId,
        start_ms: u32,
        interval_ms: u32,
    ) -> Result<(), OsError>;

    /// Deletes `timer`. Once this returns the hook will not be called again.
    fn timer_delete(&self, timer: TimerId) -> Result<(), OsError>;
}

/// POSIX-flavored filesystem access.
pub trait Filesystem: Sync {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Fd, FsError>;
    fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize, FsError>;
    fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize, FsError>;
    /// Moves the file offset to `offset` bytes from the start.
    fn lseek(&self, fd: Fd, offset: u32) -> Result<u32, FsError>;
    fn close(&self, fd: Fd) -> Result<(), FsError>;
    fn remove(&self, path: &str) -> Result<(), FsError>;
    fn stat(&self, path: &str) -> Result<FileStat, FsError>;
    fn mkdir(&self, path: &str) -> Result<(), FsError>;
}

/// 32-bit register (and raw memory word) access.
pub trait RegisterIo: Sync {
    fn read_u32(&self, addr: u32) -> u32;
    fn write_u32(&self, addr: u32, value: u32);
}

/// Board-level primitives.
pub trait Board: Sync {
    /// Restarts the board. Does not return.
    fn restart(&self, reset_type: ResetType) -> !;

    /// Address one past the top of installed physical RAM.
    fn physical_ram_top(&self) -> u32;

    /// Name of the active boot partition, if the kernel exposes it.
    fn active_boot_partition(&self) -> Option<&str>;

    /// Cause of the most recent reset.
    fn reset_subtype(&self) -> ResetSubtype;
}
