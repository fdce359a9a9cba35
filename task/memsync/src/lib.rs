// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reserved memory sync task.
//!
//! Reserved memory survives a processor reset, but not a power cycle. To
//! make its contents survive those too, this task periodically mirrors each
//! block of the [`ReservedMemoryMap`] to a backing file in flash, and on a
//! power-on reset [`MemSync::restore_from_backing`] loads them back.
//!
//! Flash has a bounded number of write cycles, so a block is only written
//! when its bytes actually differ from the file. Blocks that nobody wrote to
//! since the last pass are not even compared. When a block does differ it
//! is rewritten whole, so each file is always a complete image of its block.
//!
//! A failure on one block is logged and leaves that block dirty; the rest of
//! the pass carries on, and the block is tried again next period.
//!
//! A block whose file exists but could not be read back at restore time is
//! never synced from RAM: the file is the only good copy. Each pass tries the
//! restore again instead, and the block syncs normally once that works.

#![cfg_attr(not(test), no_std)]

use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use enum_map::EnumMap;
use psp_config::MEMSYNC_CHUNK_SIZE as CHUNK;
use psp_reserved_mem::{MemBlockKind, MemoryBlock, ReservedMemoryMap};
use psp_userlib::{
    hl, psp_log, Fd, Filesystem, FsError, OpenMode, Os, Priority, PspError,
    PspResult, SemId, TaskBody, TaskId,
};
use ringbuf::{ringbuf, ringbuf_entry};
use spin::Mutex;

const LOG_TAG: &str = "PSP MEMSYNC";

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Init { frequency_ms: u32, start: bool },
    Running(bool),
    Frequency(u32),
    Priority(Priority),
    PassStart,
    Written(MemBlockKind),
    Unchanged(MemBlockKind),
    Failed(MemBlockKind, FsError),
    Restored(MemBlockKind, usize),
    BackingMissing(MemBlockKind),
    RestoreRetryFailed(MemBlockKind, FsError),
    Shutdown,
}

ringbuf!(Trace, 32, Trace::None);

#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub task_name: &'static str,
    pub sem_name: &'static str,
    pub default_priority: Priority,
    /// Lowest and highest priority the sync task may be given.
    pub priority_range: (Priority, Priority),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_name: psp_config::MEMSYNC_TASK_NAME,
            sem_name: psp_config::MEMSYNC_SEM_NAME,
            default_priority: psp_config::MEMSYNC_DEFAULT_PRIORITY,
            priority_range: (
                psp_config::MEMSYNC_PRIORITY_LOW,
                psp_config::MEMSYNC_PRIORITY_HIGH,
            ),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemSyncStatus {
    pub running: bool,
    pub frequency_ms: u32,
    pub priority: Priority,
}

/// Outcome of one pass over the blocks.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncReport {
    pub written: u8,
    /// Clean, or dirty but identical to the file.
    pub skipped: u8,
    pub failed: u8,
}

/// Outcome of reloading the blocks from flash.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RestoreReport {
    pub restored: u8,
    /// No file, or a file shorter than the block.
    pub incomplete: u8,
    pub failed: u8,
}

pub struct MemSync {
    os: &'static dyn Os,
    fs: &'static dyn Filesystem,
    map: &'static ReservedMemoryMap,
    config: Config,
    running: AtomicBool,
    frequency_ms: AtomicU32,
    priority: AtomicU8,
    task: Mutex<Option<TaskId>>,
    /// Held for the duration of a pass.
    sem: Mutex<Option<SemId>>,
    shutdown: AtomicBool,
    /// Blocks whose backing file could not be read at restore time.
    unrestored: EnumMap<MemBlockKind, AtomicBool>,
}

impl MemSync {
    pub fn new(
        os: &'static dyn Os,
        fs: &'static dyn Filesystem,
        map: &'static ReservedMemoryMap,
        config: Config,
    ) -> Self {
        Self {
            os,
            fs,
            map,
            running: AtomicBool::new(false),
            frequency_ms: AtomicU32::new(
                psp_config::MEMSYNC_DEFAULT_FREQUENCY_MS,
            ),
            priority: AtomicU8::new(config.default_priority),
            config,
            task: Mutex::new(None),
            sem: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            unrestored: EnumMap::default(),
        }
    }

    /// Creates the sync task, which only starts syncing once started (or
    /// right away, with `start_on_startup`).
    ///
    /// Failure leaves syncing unavailable for this boot; the rest of the
    /// PSP carries on.
    pub fn init(
        &'static self,
        default_frequency_ms: u32,
        start_on_startup: bool,
    ) -> PspResult<()> {
        if default_frequency_ms == 0 {
            psp_log!(LOG_TAG, "sync frequency must be nonzero");
            return Err(PspError::Error);
        }
        if self.task.lock().is_some() {
            psp_log!(LOG_TAG, "already initialized");
            return Err(PspError::Error);
        }
        ringbuf_entry!(Trace::Init {
            frequency_ms: default_frequency_ms,
            start: start_on_startup
        });
        self.frequency_ms
            .store(default_frequency_ms, Ordering::Relaxed);

        for block in self.map.blocks() {
            if let Some((dir, _)) = block.backing_file.rsplit_once('/') {
                if dir.is_empty() {
                    continue;
                }
                if let Err(e) = hl::create_directory(self.fs, dir) {
                    psp_log!(LOG_TAG, "mkdir {} failed: {:?}", dir, e);
                }
            }
        }

        // Kept from an earlier attempt whose task create failed.
        let mut sem = self.sem.lock();
        if sem.is_none() {
            let s = self
                .os
                .bin_sem_create(self.config.sem_name, true)
                .map_err(|e| {
                    psp_log!(LOG_TAG, "semaphore create failed: {:?}", e);
                    PspError::Error
                })?;
            *sem = Some(s);
        }
        drop(sem);

        let prio = self.priority.load(Ordering::Relaxed);
        let task = self
            .os
            .task_create(self.config.task_name, prio, self)
            .map_err(|e| {
                psp_log!(LOG_TAG, "task create failed: {:?}", e);
                PspError::Error
            })?;
        *self.task.lock() = Some(task);

        self.running.store(start_on_startup, Ordering::Relaxed);
        Ok(())
    }

    /// Starts periodic syncing. Starting while already running is fine.
    pub fn start(&self) -> PspResult<()> {
        if self.task.lock().is_none() || self.shutdown.load(Ordering::Relaxed)
        {
            psp_log!(LOG_TAG, "start without a sync task");
            return Err(PspError::Error);
        }
        self.running.store(true, Ordering::Relaxed);
        ringbuf_entry!(Trace::Running(true));
        Ok(())
    }

    /// Stops periodic syncing. Stopping while stopped is fine.
    pub fn stop(&self) -> PspResult<()> {
        self.running.store(false, Ordering::Relaxed);
        ringbuf_entry!(Trace::Running(false));
        Ok(())
    }

    /// Sets the period between passes. Takes effect after the current wait.
    pub fn set_frequency(&self, ms: u32) -> PspResult<()> {
        if ms == 0 {
            return Err(PspError::Error);
        }
        self.frequency_ms.store(ms, Ordering::Relaxed);
        ringbuf_entry!(Trace::Frequency(ms));
        Ok(())
    }

    pub fn set_priority(&self, priority: Priority) -> PspResult<()> {
        let (lo, hi) = self.config.priority_range;
        if !(lo..=hi).contains(&priority) {
            psp_log!(
                LOG_TAG,
                "priority {} outside {}..={}",
                priority,
                lo,
                hi
            );
            return Err(PspError::Error);
        }
        if let Some(task) = *self.task.lock() {
            self.os.task_set_priority(task, priority).map_err(|e| {
                psp_log!(LOG_TAG, "priority change failed: {:?}", e);
                PspError::Error
            })?;
        }
        self.priority.store(priority, Ordering::Relaxed);
        ringbuf_entry!(Trace::Priority(priority));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn get_status(&self) -> MemSyncStatus {
        MemSyncStatus {
            running: self.is_running(),
            frequency_ms: self.frequency_ms.load(Ordering::Relaxed),
            priority: self.priority.load(Ordering::Relaxed),
        }
    }

    /// Ends the sync task after its current wait. There is no restarting it.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.running.store(false, Ordering::Relaxed);
        ringbuf_entry!(Trace::Shutdown);
    }

    /// Runs one pass now, waiting for any pass already under way. Used
    /// before a commanded restart so the latest contents reach flash.
    pub fn flush(&self) -> PspResult<SyncReport> {
        let sem = *self.sem.lock();
        if let Some(sem) = sem {
            self.os
                .bin_sem_take(sem, None)
                .map_err(|_| PspError::Error)?;
        }
        let report = self.sync_pass();
        if let Some(sem) = sem {
            let _ = self.os.bin_sem_give(sem);
        }
        Ok(report)
    }

    /// Compares each dirty block with its file, rewriting the ones that
    /// differ.
    pub fn sync_pass(&self) -> SyncReport {
        ringbuf_entry!(Trace::PassStart);
        let mut report = SyncReport::default();
        for block in self.map.blocks() {
            if self.unrestored[block.kind].load(Ordering::Relaxed) {
                match self.retry_restore(block) {
                    Ok(true) => {
                        report.skipped += 1;
                        continue;
                    }
                    Ok(false) => (),
                    Err(()) => {
                        report.failed += 1;
                        continue;
                    }
                }
            }
            let Some(dirty) = self.map.take_dirty(block.kind) else {
                report.skipped += 1;
                continue;
            };
            match self.sync_block(block, dirty.clone()) {
                Ok(true) => {
                    ringbuf_entry!(Trace::Written(block.kind));
                    report.written += 1;
                }
                Ok(false) => {
                    ringbuf_entry!(Trace::Unchanged(block.kind));
                    report.skipped += 1;
                }
                Err(e) => {
                    ringbuf_entry!(Trace::Failed(block.kind, e));
                    psp_log!(
                        LOG_TAG,
                        "sync of {:?} to {} failed: {:?}",
                        block.kind,
                        block.backing_file,
                        e
                    );
                    self.map.restore_dirty(block.kind, dirty);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Makes another attempt at loading a block that failed to restore.
    /// `Ok(true)` means RAM now matches the file; `Ok(false)` means the
    /// block can be synced normally.
    ///
    /// This overwrites anything written to the block since boot.
    fn retry_restore(&self, block: &MemoryBlock) -> Result<bool, ()> {
        match self.restore_block(block) {
            Ok(n) => {
                self.unrestored[block.kind].store(false, Ordering::Relaxed);
                ringbuf_entry!(Trace::Restored(block.kind, n));
                psp_log!(LOG_TAG, "late restore of {}", block.backing_file);
                if n == block.size {
                    self.map.take_dirty(block.kind);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(FsError::NotFound) => {
                self.unrestored[block.kind].store(false, Ordering::Relaxed);
                ringbuf_entry!(Trace::BackingMissing(block.kind));
                Ok(false)
            }
            Err(e) => {
                ringbuf_entry!(Trace::RestoreRetryFailed(block.kind, e));
                Err(())
            }
        }
    }

    /// Returns whether the block had to be written.
    fn sync_block(
        &self,
        block: &MemoryBlock,
        dirty: Range<usize>,
    ) -> Result<bool, FsError> {
        if !self.differs(block, dirty)? {
            return Ok(false);
        }
        self.write_block(block)?;
        Ok(true)
    }

    fn differs(
        &self,
        block: &MemoryBlock,
        range: Range<usize>,
    ) -> Result<bool, FsError> {
        match hl::stat_if_present(self.fs, block.backing_file)? {
            Some(st) if st.size as usize == block.size => (),
            _ => return Ok(true),
        }
        let fd = self.fs.open(block.backing_file, OpenMode::ReadOnly)?;
        let r = self.compare(fd, block.kind, range);
        let c = self.fs.close(fd);
        let differs = r?;
        c?;
        Ok(differs)
    }

    fn compare(
        &self,
        fd: Fd,
        kind: MemBlockKind,
        range: Range<usize>,
    ) -> Result<bool, FsError> {
        let start = u32::try_from(range.start).map_err(|_| FsError::Io)?;
        self.fs.lseek(fd, start)?;
        let mut buf = [0u8; CHUNK];
        let mut off = range.start;
        while off < range.end {
            let n = CHUNK.min(range.end - off);
            if hl::read_exact(self.fs, fd, &mut buf[..n])? != n {
                return Ok(true);
            }
            let same = self
                .map
                .with_block(kind, |ram| ram[off..off + n] == buf[..n]);
            if !same {
                return Ok(true);
            }
            off += n;
        }
        Ok(false)
    }

    fn write_block(&self, block: &MemoryBlock) -> Result<(), FsError> {
        let fd = self.fs.open(block.backing_file, OpenMode::CreateTruncate)?;
        let r = self.copy_out(fd, block);
        let c = self.fs.close(fd);
        r?;
        c
    }

    fn copy_out(&self, fd: Fd, block: &MemoryBlock) -> Result<(), FsError> {
        let mut buf = [0u8; CHUNK];
        let mut off = 0;
        while off < block.size {
            let n = CHUNK.min(block.size - off);
            self.map.with_block(block.kind, |ram| {
                buf[..n].copy_from_slice(&ram[off..off + n])
            });
            hl::write_all(self.fs, fd, &buf[..n])?;
            off += n;
        }
        Ok(())
    }

    /// Reloads every block from its backing file, after a power-on reset.
    /// Must run before the sync task is started.
    ///
    /// A block whose file is missing or short keeps its (zeroed) contents
    /// beyond what could be read, and stays dirty so the next pass writes a
    /// complete image. A block whose file could not be read is held back
    /// from syncing until a later pass manages to load it.
    pub fn restore_from_backing(&self) -> RestoreReport {
        let mut report = RestoreReport::default();
        for block in self.map.blocks() {
            let unreadable = &self.unrestored[block.kind];
            unreadable.store(false, Ordering::Relaxed);
            match self.restore_block(block) {
                Ok(n) if n == block.size => {
                    self.map.take_dirty(block.kind);
                    ringbuf_entry!(Trace::Restored(block.kind, n));
                    report.restored += 1;
                }
                Ok(n) => {
                    ringbuf_entry!(Trace::Restored(block.kind, n));
                    psp_log!(
                        LOG_TAG,
                        "{} holds {} of {} bytes",
                        block.backing_file,
                        n,
                        block.size
                    );
                    report.incomplete += 1;
                }
                Err(FsError::NotFound) => {
                    ringbuf_entry!(Trace::BackingMissing(block.kind));
                    psp_log!(LOG_TAG, "no {}", block.backing_file);
                    report.incomplete += 1;
                }
                Err(e) => {
                    ringbuf_entry!(Trace::Failed(block.kind, e));
                    psp_log!(
                        LOG_TAG,
                        "restore from {} failed: {:?}",
                        block.backing_file,
                        e
                    );
                    unreadable.store(true, Ordering::Relaxed);
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn restore_block(&self, block: &MemoryBlock) -> Result<usize, FsError> {
        let fd = self.fs.open(block.backing_file, OpenMode::ReadOnly)?;
        let r = self
            .map
            .with_block_mut(block.kind, |ram| hl::read_exact(self.fs, fd, ram));
        let c = self.fs.close(fd);
        let n = r?;
        c?;
        Ok(n)
    }
}

impl TaskBody for MemSync {
    fn run(&self) {
        let sem = *self.sem.lock();
        loop {
            self.os.task_delay(self.frequency_ms.load(Ordering::Relaxed));
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            if !self.is_running() {
                continue;
            }
            let Some(sem) = sem else {
                continue;
            };
            if let Err(e) = self.os.bin_sem_take(sem, None) {
                psp_log!(LOG_TAG, "semaphore take failed: {:?}", e);
                continue;
            }
            let report = self.sync_pass();
            if report.failed != 0 {
                psp_log!(LOG_TAG, "{} block(s) left for retry", report.failed);
            }
            let _ = self.os.bin_sem_give(sem);
        }
    }
}
