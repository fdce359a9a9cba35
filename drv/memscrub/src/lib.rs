// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory scrubber.
//!
//! With ECC enabled in the memory controller, every read of a word gives the
//! hardware a chance to notice (and for single-bit errors, fix) a flipped
//! bit. Left alone, errors in rarely-read memory accumulate until two land in
//! the same word and it can no longer be corrected. The scrub task walks a
//! configured range of RAM one block at a time, reading every word, and
//! harvests the controller's error flags into statistics afterwards.
//!
//! How the task spends its time depends on the run mode:
//!
//! - `Idle`: nothing is scrubbed.
//! - `Timed`: one block per task period.
//! - `Automatic`: blocks back to back, yielding in between.
//! - `Manual`: one pass over the whole range per [`MemScrub::trigger`].
//!
//! In every mode, blocks are only read while the controller's ENABLE bit is
//! set, so [`MemScrub::disable`] pauses scrubbing without touching the mode.
//!
//! The configuration is replaced as a whole by [`MemScrub::set`], which
//! pauses the hardware around the swap. Each replacement bumps a generation
//! counter, and a block that was started against an older configuration
//! finishes without writing back its position.

#![cfg_attr(not(test), no_std)]

mod hw;

pub use hw::{EccHarvest, EccStatus, ScrubCtrl, ScrubRegs};

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use psp_userlib::{
    psp_log, Board, FromRaw, Os, Priority, PspError, PspResult, RegisterIo,
    ScrubRunMode, SemId, TaskBody, TaskId,
};
use ringbuf::{ringbuf, ringbuf_entry};
use spin::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const LOG_TAG: &str = "PSP MEMSCRUB";

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Init,
    InvalidRange { start: u32, end: u32 },
    BeyondRam { end: u32, ram_top: u32 },
    Misaligned { start: u32, end: u32 },
    BadBlockSize(u32),
    ZeroDelay,
    BadPriority(u32),
    RamTop(u32),
    Set { start: u32, end: u32, mode: ScrubRunMode },
    SetRolledBack,
    CtrlNotLatched(bool),
    Block { start: u32, end: u32 },
    Wrapped(u32),
    StalePosition { generation: u32 },
    Ecc(EccHarvest),
    Deleted,
}

ringbuf!(Trace, 32, Trace::None);

/// A scrub configuration as requested by a caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ScrubConfig {
    pub run_mode: ScrubRunMode,
    pub start_addr: u32,
    pub end_addr: u32,
    /// Bytes read per block; a multiple of the word size.
    pub block_size: u32,
    pub task_delay_ms: u32,
    pub priority: Priority,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            run_mode: psp_config::MEMSCRUB_DEFAULT_RUN_MODE,
            start_addr: psp_config::MEMSCRUB_DEFAULT_START_ADDR,
            end_addr: psp_config::MEMSCRUB_DEFAULT_END_ADDR,
            block_size: psp_config::MEMSCRUB_BLOCK_SIZE,
            task_delay_ms: psp_config::MEMSCRUB_TASK_DELAY_MS,
            priority: psp_config::MEMSCRUB_DEFAULT_PRIORITY,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub task_name: &'static str,
    pub sem_name: &'static str,
    /// Lowest and highest priority the scrub task may be given.
    pub priority_range: (Priority, Priority),
    pub regs: ScrubRegs,
    pub scrub: ScrubConfig,
    pub start_on_startup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_name: psp_config::MEMSCRUB_TASK_NAME,
            sem_name: psp_config::MEMSCRUB_SEM_NAME,
            priority_range: (
                psp_config::MEMSCRUB_PRIORITY_LOW,
                psp_config::MEMSCRUB_PRIORITY_HIGH,
            ),
            regs: ScrubRegs {
                ctrl: psp_config::MEMSCRUB_CTRL_REGISTER,
                ecc_status: psp_config::MEMSCRUB_ECC_STATUS_REGISTER,
                ecc_count: psp_config::MEMSCRUB_ECC_COUNT_REGISTER,
            },
            scrub: ScrubConfig::default(),
            start_on_startup: psp_config::MEMSCRUB_START_ON_STARTUP,
        }
    }
}

/// Live scrubber state, as copied out by [`MemScrub::get`].
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct MemScrubStatus {
    /// Raw [`ScrubRunMode`].
    pub run_mode: u32,
    pub start_addr: u32,
    pub end_addr: u32,
    /// Next address to be scrubbed.
    pub current_position: u32,
    pub block_size: u32,
    pub task_delay_ms: u32,
    pub priority: u32,
}

impl MemScrubStatus {
    fn from_config(c: &ScrubConfig) -> Self {
        Self {
            run_mode: c.run_mode as u32,
            start_addr: c.start_addr,
            end_addr: c.end_addr,
            current_position: c.start_addr,
            block_size: c.block_size,
            task_delay_ms: c.task_delay_ms,
            priority: u32::from(c.priority),
        }
    }

    pub fn mode(&self) -> ScrubRunMode {
        ScrubRunMode::from_u32(self.run_mode).unwrap_or(ScrubRunMode::Idle)
    }
}

/// Error statistics, as copied out by [`MemScrub::err_stats`].
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct MemScrubErrStats {
    /// Completed passes over the whole range.
    pub run_count: u32,
    pub block_count: u32,
    pub correctable_error_count: u32,
    pub uncorrectable_error_count: u32,
}

#[derive(Default)]
struct Stats {
    run_count: AtomicU32,
    block_count: AtomicU32,
    correctable: AtomicU32,
    uncorrectable: AtomicU32,
}

/// One block's worth of work, cut from the configuration of the moment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockJob {
    pub start: u32,
    pub end: u32,
    /// The block ends at (or past) the end of the range.
    pub wraps: bool,
    generation: u32,
}

pub struct MemScrub {
    os: &'static dyn Os,
    board: &'static dyn Board,
    regs: &'static dyn RegisterIo,
    config: Config,
    status: Mutex<MemScrubStatus>,
    generation: AtomicU32,
    stats: Stats,
    /// Cached top of physical RAM; 0 until first needed.
    end_of_ram: AtomicU32,
    task: Mutex<Option<TaskId>>,
    trigger_sem: Mutex<Option<SemId>>,
    deleted: AtomicBool,
}

impl MemScrub {
    pub fn new(
        os: &'static dyn Os,
        board: &'static dyn Board,
        regs: &'static dyn RegisterIo,
        config: Config,
    ) -> Self {
        let mut idle = MemScrubStatus::from_config(&config.scrub);
        idle.run_mode = ScrubRunMode::Idle as u32;
        Self {
            os,
            board,
            regs,
            config,
            status: Mutex::new(idle),
            generation: AtomicU32::new(0),
            stats: Stats::default(),
            end_of_ram: AtomicU32::new(0),
            task: Mutex::new(None),
            trigger_sem: Mutex::new(None),
            deleted: AtomicBool::new(false),
        }
    }

    /// Validates the configured range, installs it, and creates the scrub
    /// task. The hardware is enabled right away if so configured.
    ///
    /// A bad range fails the whole subsystem: scrubbing outside installed
    /// RAM could touch memory-mapped I/O.
    pub fn init(&'static self) -> PspResult<()> {
        ringbuf_entry!(Trace::Init);
        let scrub = self.config.scrub;
        if let Err(e) = self.validate(&scrub) {
            psp_log!(
                LOG_TAG,
                "configured range {:#x}..{:#x} rejected: {:?}",
                scrub.start_addr,
                scrub.end_addr,
                e
            );
            return Err(PspError::Error);
        }
        self.install(&scrub);

        let sem = self.os.bin_sem_create(self.config.sem_name, false).map_err(
            |e| {
                psp_log!(LOG_TAG, "semaphore create failed: {:?}", e);
                PspError::Error
            },
        )?;
        *self.trigger_sem.lock() = Some(sem);

        let task = self
            .os
            .task_create(self.config.task_name, scrub.priority, self)
            .map_err(|e| {
                psp_log!(LOG_TAG, "task create failed: {:?}", e);
                PspError::Error
            })?;
        *self.task.lock() = Some(task);

        if self.config.start_on_startup {
            self.enable()?;
        }
        Ok(())
    }

    fn ram_top(&self) -> u32 {
        match self.end_of_ram.load(Ordering::Relaxed) {
            0 => {
                let top = self.board.physical_ram_top();
                self.end_of_ram.store(top, Ordering::Relaxed);
                ringbuf_entry!(Trace::RamTop(top));
                top
            }
            top => top,
        }
    }

    /// Checks a candidate configuration without applying it.
    pub fn validate(&self, c: &ScrubConfig) -> PspResult<()> {
        if c.start_addr >= c.end_addr {
            ringbuf_entry!(Trace::InvalidRange {
                start: c.start_addr,
                end: c.end_addr
            });
            return Err(PspError::Error);
        }
        if c.start_addr % 4 != 0 || c.end_addr % 4 != 0 {
            ringbuf_entry!(Trace::Misaligned {
                start: c.start_addr,
                end: c.end_addr
            });
            return Err(PspError::ErrorAddressMisaligned);
        }
        let ram_top = self.ram_top();
        if c.end_addr > ram_top {
            ringbuf_entry!(Trace::BeyondRam {
                end: c.end_addr,
                ram_top
            });
            return Err(PspError::InvalidMemRange);
        }
        if c.block_size == 0 || c.block_size % 4 != 0 {
            ringbuf_entry!(Trace::BadBlockSize(c.block_size));
            return Err(PspError::InvalidMemWordSize);
        }
        if c.task_delay_ms == 0 {
            ringbuf_entry!(Trace::ZeroDelay);
            return Err(PspError::Error);
        }
        let (lo, hi) = self.config.priority_range;
        if !(lo..=hi).contains(&c.priority) {
            ringbuf_entry!(Trace::BadPriority(u32::from(c.priority)));
            return Err(PspError::Error);
        }
        Ok(())
    }

    fn install(&self, c: &ScrubConfig) {
        self.install_status(MemScrubStatus::from_config(c));
    }

    fn install_status(&self, status: MemScrubStatus) {
        let mut s = self.status.lock();
        *s = status;
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    fn apply_priority(&self, priority: Priority) {
        if let Some(task) = *self.task.lock() {
            if let Err(e) = self.os.task_set_priority(task, priority) {
                psp_log!(LOG_TAG, "priority change failed: {:?}", e);
            }
        }
    }

    /// Validates and then replaces the whole configuration. Scrubbing is
    /// paused around the swap if it was running. On any failure the live
    /// configuration is left as it was.
    ///
    /// If the scrubber will not come back on after the swap, the previous
    /// configuration is put back and one more enable is tried; the result
    /// is `Err(Error)` either way.
    pub fn set(&self, c: &ScrubConfig) -> PspResult<()> {
        self.validate(c)?;

        let was_enabled = self.hw_enabled();
        if was_enabled {
            self.disable()?;
        }
        let prev = self.status();
        self.install(c);
        ringbuf_entry!(Trace::Set {
            start: c.start_addr,
            end: c.end_addr,
            mode: c.run_mode
        });
        self.apply_priority(c.priority);
        if was_enabled && self.enable().is_err() {
            ringbuf_entry!(Trace::SetRolledBack);
            psp_log!(LOG_TAG, "scrubber did not resume, restoring old range");
            self.install_status(prev);
            // Widened from a validated Priority in from_config.
            self.apply_priority(prev.priority as Priority);
            if self.enable().is_err() {
                psp_log!(LOG_TAG, "scrubber left disabled");
            }
            return Err(PspError::Error);
        }
        Ok(())
    }

    pub fn status(&self) -> MemScrubStatus {
        *self.status.lock()
    }

    pub fn stats(&self) -> MemScrubErrStats {
        MemScrubErrStats {
            run_count: self.stats.run_count.load(Ordering::Relaxed),
            block_count: self.stats.block_count.load(Ordering::Relaxed),
            correctable_error_count: self
                .stats
                .correctable
                .load(Ordering::Relaxed),
            uncorrectable_error_count: self
                .stats
                .uncorrectable
                .load(Ordering::Relaxed),
        }
    }

    /// Copies the live status into `out`, which must be exactly the size of
    /// [`MemScrubStatus`]. Nothing is written on a size mismatch.
    pub fn get(&self, out: &mut [u8], talkative: bool) -> PspResult<()> {
        let s = self.status();
        if s.write_to(out).is_err() {
            psp_log!(
                LOG_TAG,
                "status buffer is {} bytes, expected {}",
                out.len(),
                core::mem::size_of::<MemScrubStatus>()
            );
            return Err(PspError::Error);
        }
        if talkative {
            psp_log!(
                LOG_TAG,
                "mode {:?}, range {:#x}..{:#x}, position {:#x}, block {:#x}",
                s.mode(),
                s.start_addr,
                s.end_addr,
                s.current_position,
                s.block_size
            );
        }
        Ok(())
    }

    /// Copies the error statistics into `out`, with the same size rule as
    /// [`Self::get`]. Counters are not reset.
    pub fn err_stats(&self, out: &mut [u8], talkative: bool) -> PspResult<()> {
        let st = self.stats();
        if st.write_to(out).is_err() {
            psp_log!(
                LOG_TAG,
                "stats buffer is {} bytes, expected {}",
                out.len(),
                core::mem::size_of::<MemScrubErrStats>()
            );
            return Err(PspError::Error);
        }
        if talkative {
            psp_log!(
                LOG_TAG,
                "runs {}, blocks {}, correctable {}, uncorrectable {}",
                st.run_count,
                st.block_count,
                st.correctable_error_count,
                st.uncorrectable_error_count
            );
        }
        Ok(())
    }

    fn hw_enabled(&self) -> bool {
        self.config.regs.ctrl(self.regs).contains(ScrubCtrl::ENABLE)
    }

    /// True while the scrub task exists and the hardware is enabled.
    pub fn is_running(&self) -> bool {
        !self.deleted.load(Ordering::Relaxed)
            && self.task.lock().is_some()
            && self.hw_enabled()
    }

    fn toggle(&self, on: bool) -> PspResult<()> {
        if self.config.regs.set_enable(self.regs, on) {
            Ok(())
        } else {
            ringbuf_entry!(Trace::CtrlNotLatched(on));
            psp_log!(
                LOG_TAG,
                "control register did not {}",
                if on { "enable" } else { "disable" }
            );
            Err(PspError::Error)
        }
    }

    pub fn enable(&self) -> PspResult<()> {
        self.toggle(true)
    }

    pub fn disable(&self) -> PspResult<()> {
        self.toggle(false)
    }

    /// Starts a full pass in `Manual` mode.
    pub fn trigger(&self) -> PspResult<()> {
        if self.status().mode() != ScrubRunMode::Manual {
            return Err(PspError::Error);
        }
        let sem = (*self.trigger_sem.lock()).ok_or(PspError::Error)?;
        self.os.bin_sem_give(sem).map_err(|_| PspError::Error)
    }

    /// Disables the hardware, drops to `Idle`, and ends the scrub task for
    /// the rest of this boot. The mode change and shutdown happen even if
    /// the hardware refuses to disable.
    pub fn delete(&self) -> PspResult<()> {
        let r = self.disable();
        {
            let mut s = self.status.lock();
            s.run_mode = ScrubRunMode::Idle as u32;
            self.generation.fetch_add(1, Ordering::Relaxed);
        }
        self.deleted.store(true, Ordering::Relaxed);
        if let Some(sem) = *self.trigger_sem.lock() {
            let _ = self.os.bin_sem_give(sem);
        }
        ringbuf_entry!(Trace::Deleted);
        r
    }

    /// Cuts the next block from the current configuration.
    pub fn next_job(&self) -> BlockJob {
        let s = self.status.lock();
        let generation = self.generation.load(Ordering::Relaxed);
        // Word alignment of both ends was checked in `validate`.
        let start = if s.current_position < s.start_addr
            || s.current_position >= s.end_addr
        {
            s.start_addr
        } else {
            s.current_position
        };
        let end = start.saturating_add(s.block_size).min(s.end_addr);
        BlockJob {
            start,
            end,
            wraps: end >= s.end_addr,
            generation,
        }
    }

    /// Reads every word of the block and collects what the ECC logic saw.
    fn read_block(&self, job: &BlockJob) -> EccHarvest {
        ringbuf_entry!(Trace::Block {
            start: job.start,
            end: job.end
        });
        let mut addr = job.start;
        while addr < job.end {
            let _ = self.regs.read_u32(addr);
            addr = match addr.checked_add(4) {
                Some(a) => a,
                None => break,
            };
        }
        self.config.regs.harvest(self.regs)
    }

    /// Accounts for a finished block. The position only moves if the
    /// configuration was not replaced while the block was being read.
    pub fn finish_job(&self, job: &BlockJob, ecc: EccHarvest) {
        if ecc != EccHarvest::default() {
            ringbuf_entry!(Trace::Ecc(ecc));
            self.stats
                .correctable
                .fetch_add(ecc.correctable, Ordering::Relaxed);
            self.stats
                .uncorrectable
                .fetch_add(ecc.uncorrectable, Ordering::Relaxed);
            if ecc.uncorrectable != 0 {
                psp_log!(
                    LOG_TAG,
                    "uncorrectable error in {:#x}..{:#x}",
                    job.start,
                    job.end
                );
            }
        }
        self.stats.block_count.fetch_add(1, Ordering::Relaxed);

        let mut s = self.status.lock();
        if self.generation.load(Ordering::Relaxed) != job.generation {
            ringbuf_entry!(Trace::StalePosition {
                generation: job.generation
            });
            return;
        }
        if job.wraps {
            s.current_position = s.start_addr;
            let runs = self.stats.run_count.fetch_add(1, Ordering::Relaxed);
            ringbuf_entry!(Trace::Wrapped(runs.wrapping_add(1)));
        } else {
            s.current_position = job.end;
        }
    }

    /// Scrubs one block at the current position.
    pub fn scrub_block(&self) -> BlockJob {
        let job = self.next_job();
        let ecc = self.read_block(&job);
        self.finish_job(&job, ecc);
        job
    }

    /// Scrubs from the current position to the end of the range, stopping
    /// early if the configuration changes or the hardware is disabled.
    fn scrub_pass(&self) {
        loop {
            if self.deleted.load(Ordering::Relaxed) || !self.hw_enabled() {
                return;
            }
            let job = self.scrub_block();
            if job.wraps
                || self.generation.load(Ordering::Relaxed) != job.generation
            {
                return;
            }
        }
    }
}

impl TaskBody for MemScrub {
    fn run(&self) {
        let sem = *self.trigger_sem.lock();
        while !self.deleted.load(Ordering::Relaxed) {
            let s = self.status();
            let delay = s.task_delay_ms;
            match s.mode() {
                ScrubRunMode::Idle => self.os.task_delay(delay),
                ScrubRunMode::Timed => {
                    if self.hw_enabled() {
                        self.scrub_block();
                    }
                    self.os.task_delay(delay);
                }
                ScrubRunMode::Automatic => {
                    if self.hw_enabled() {
                        self.scrub_block();
                        self.os.task_delay(0);
                    } else {
                        self.os.task_delay(delay);
                    }
                }
                ScrubRunMode::Manual => {
                    let Some(sem) = sem else {
                        self.os.task_delay(delay);
                        continue;
                    };
                    // Wake up now and then to notice deletion.
                    if self.os.bin_sem_take(sem, Some(delay)).is_ok()
                        && !self.deleted.load(Ordering::Relaxed)
                    {
                        self.scrub_pass();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use psp_userlib::fakes::{leak, FakeBoard, FakeOs, FakeRegisters};
    use std::time::{Duration, Instant};

    const CTRL: u32 = 0xffe0_2e40;
    const ECC_STATUS: u32 = 0xffe0_2e44;
    const ECC_COUNT: u32 = 0xffe0_2e48;
    const RAM_TOP: u32 = 0x1000_0000;

    struct Rig {
        os: &'static FakeOs,
        board: &'static FakeBoard,
        regs: &'static FakeRegisters,
        scrub: &'static MemScrub,
    }

    fn scrub_config() -> ScrubConfig {
        ScrubConfig {
            run_mode: ScrubRunMode::Timed,
            start_addr: 0x1000,
            end_addr: 0x1100,
            block_size: 0x40,
            task_delay_ms: 1,
            priority: 250,
        }
    }

    fn config() -> Config {
        Config {
            task_name: "PSPMemScrub",
            sem_name: "PSPMemScrubSem",
            priority_range: (200, 255),
            regs: ScrubRegs {
                ctrl: CTRL,
                ecc_status: ECC_STATUS,
                ecc_count: ECC_COUNT,
            },
            scrub: scrub_config(),
            start_on_startup: false,
        }
    }

    fn rig_with(os: FakeOs, config: Config) -> Rig {
        let os = leak(os);
        let board = leak(FakeBoard::new(RAM_TOP));
        let regs = leak(FakeRegisters::new());
        regs.write_one_to_clear(ECC_STATUS);
        let scrub = leak(MemScrub::new(os, board, regs, config));
        Rig {
            os,
            board,
            regs,
            scrub,
        }
    }

    fn rig() -> Rig {
        rig_with(FakeOs::new(), config())
    }

    const STATUS_LEN: usize = core::mem::size_of::<MemScrubStatus>();

    fn status_bytes(s: &MemScrub) -> [u8; STATUS_LEN] {
        let mut out = [0u8; STATUS_LEN];
        s.get(&mut out, false).unwrap();
        out
    }

    #[test]
    fn init_installs_and_creates_task() {
        let r = rig();
        r.scrub.init().unwrap();
        let s = r.scrub.status();
        assert_eq!(s.mode(), ScrubRunMode::Timed);
        assert_eq!(s.current_position, 0x1000);
        assert_eq!(r.os.task("PSPMemScrub").unwrap().priority, 250);
        // Not started on startup.
        assert!(!r.scrub.is_running());
    }

    #[test]
    fn init_starts_when_configured() {
        let mut c = config();
        c.start_on_startup = true;
        let r = rig_with(FakeOs::new(), c);
        r.scrub.init().unwrap();
        assert!(r.scrub.is_running());
    }

    #[test]
    fn init_rejects_inverted_range() {
        let mut c = config();
        c.scrub.start_addr = 0x2000;
        let r = rig_with(FakeOs::new(), c);
        assert_eq!(r.scrub.init(), Err(PspError::Error));
        assert!(r.os.task("PSPMemScrub").is_none());
    }

    #[test]
    fn end_of_ram_discovered_once() {
        let r = rig();
        r.scrub.validate(&scrub_config()).unwrap();
        r.scrub.validate(&scrub_config()).unwrap();
        assert_eq!(r.board.ram_queries(), 1);

        let mut c = scrub_config();
        c.end_addr = RAM_TOP + 4;
        assert_eq!(r.scrub.validate(&c), Err(PspError::InvalidMemRange));
        c.end_addr = RAM_TOP;
        assert_eq!(r.scrub.validate(&c), Ok(()));
    }

    #[test]
    fn validate_other_fields() {
        let r = rig();
        let mut c = scrub_config();
        c.block_size = 6;
        assert_eq!(r.scrub.validate(&c), Err(PspError::InvalidMemWordSize));
        c.block_size = 0;
        assert_eq!(r.scrub.validate(&c), Err(PspError::InvalidMemWordSize));
        let mut c = scrub_config();
        c.priority = 100;
        assert_eq!(r.scrub.validate(&c), Err(PspError::Error));
    }

    #[test]
    fn validate_rejects_unaligned_ends() {
        let r = rig();
        let mut c = scrub_config();
        c.start_addr = 0x1001;
        assert_eq!(
            r.scrub.validate(&c),
            Err(PspError::ErrorAddressMisaligned)
        );

        // An end that would have the last word straddle the top of RAM.
        r.board.set_ram_top(0x1002);
        let mut c = scrub_config();
        c.end_addr = 0x1002;
        assert_eq!(
            r.scrub.validate(&c),
            Err(PspError::ErrorAddressMisaligned)
        );
        assert_eq!(r.board.ram_queries(), 0);
    }

    #[test]
    fn validate_rejects_zero_delay() {
        let r = rig();
        r.scrub.init().unwrap();
        let before = r.scrub.status();
        let mut c = scrub_config();
        c.run_mode = ScrubRunMode::Manual;
        c.task_delay_ms = 0;
        assert_eq!(r.scrub.validate(&c), Err(PspError::Error));
        assert_eq!(r.scrub.set(&c), Err(PspError::Error));
        assert_eq!(r.scrub.status(), before);
    }

    #[test]
    fn init_rejects_zero_delay() {
        let mut c = config();
        c.scrub.task_delay_ms = 0;
        let r = rig_with(FakeOs::new(), c);
        assert_eq!(r.scrub.init(), Err(PspError::Error));
        assert!(r.os.task("PSPMemScrub").is_none());
    }

    proptest! {
        #[test]
        fn ordered_ranges_within_ram_validate(
            start_word in 0u32..RAM_TOP / 4,
            len_words in 1u32..=RAM_TOP / 4,
        ) {
            let r = rig();
            let start = start_word * 4;
            let end = start.saturating_add(len_words * 4).min(RAM_TOP);
            prop_assume!(start < end);
            let c = ScrubConfig {
                start_addr: start,
                end_addr: end,
                ..scrub_config()
            };
            prop_assert_eq!(r.scrub.validate(&c), Ok(()));
        }

        #[test]
        fn unordered_ranges_fail_without_side_effects(
            start in any::<u32>(),
            back in 0u32..0x1000,
        ) {
            let r = rig();
            r.scrub.init().unwrap();
            let before = r.scrub.status();
            let queries = r.board.ram_queries();

            let end = start.saturating_sub(back);
            let c = ScrubConfig {
                start_addr: start,
                end_addr: end,
                ..scrub_config()
            };
            prop_assert_eq!(r.scrub.validate(&c), Err(PspError::Error));
            prop_assert_eq!(r.scrub.set(&c), Err(PspError::Error));
            prop_assert_eq!(r.scrub.status(), before);
            prop_assert_eq!(r.board.ram_queries(), queries);
        }
    }

    #[test]
    fn failed_set_is_bit_identical() {
        let r = rig();
        r.scrub.init().unwrap();
        r.scrub.scrub_block();
        let before = status_bytes(r.scrub);

        let mut c = scrub_config();
        c.end_addr = RAM_TOP + 0x100;
        assert!(r.scrub.set(&c).is_err());
        assert_eq!(status_bytes(r.scrub), before);
    }

    #[test]
    fn set_pauses_running_scrubber() {
        let r = rig();
        r.scrub.init().unwrap();
        r.scrub.enable().unwrap();
        r.scrub.scrub_block();

        let mut c = scrub_config();
        c.start_addr = 0x4000;
        c.end_addr = 0x8000;
        c.priority = 210;
        r.scrub.set(&c).unwrap();
        assert!(r.scrub.is_running());
        let s = r.scrub.status();
        assert_eq!((s.start_addr, s.end_addr), (0x4000, 0x8000));
        assert_eq!(s.current_position, 0x4000);
        assert_eq!(r.os.task("PSPMemScrub").unwrap().priority, 210);
    }

    #[test]
    fn set_fails_if_scrubber_cannot_be_paused() {
        let r = rig();
        r.scrub.init().unwrap();
        r.scrub.enable().unwrap();
        let before = r.scrub.status();
        r.regs.stick(CTRL);

        let mut c = scrub_config();
        c.start_addr = 0x4000;
        c.end_addr = 0x8000;
        assert_eq!(r.scrub.set(&c), Err(PspError::Error));
        assert_eq!(r.scrub.status(), before);
    }

    /// Control register that drops the first `refusals` attempts to set
    /// ENABLE but always lets it be cleared.
    struct BalkyCtrl {
        inner: FakeRegisters,
        refusals: AtomicU32,
    }

    impl RegisterIo for BalkyCtrl {
        fn read_u32(&self, addr: u32) -> u32 {
            self.inner.read_u32(addr)
        }

        fn write_u32(&self, addr: u32, value: u32) {
            let mut value = value;
            let enabling = ScrubCtrl::from_bits_retain(value)
                .contains(ScrubCtrl::ENABLE);
            if addr == CTRL
                && enabling
                && self
                    .refusals
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                        n.checked_sub(1)
                    })
                    .is_ok()
            {
                value &= !ScrubCtrl::ENABLE.bits();
            }
            self.inner.write_u32(addr, value);
        }
    }

    fn balky_rig(refusals: u32) -> (&'static FakeOs, &'static MemScrub) {
        let os = leak(FakeOs::new());
        let board = leak(FakeBoard::new(RAM_TOP));
        let regs = leak(BalkyCtrl {
            inner: FakeRegisters::new(),
            refusals: AtomicU32::new(0),
        });
        let scrub = leak(MemScrub::new(os, board, regs, config()));
        scrub.init().unwrap();
        scrub.enable().unwrap();
        scrub.scrub_block();
        regs.refusals.store(refusals, Ordering::Relaxed);
        (os, scrub)
    }

    fn moved_range() -> ScrubConfig {
        ScrubConfig {
            start_addr: 0x4000,
            end_addr: 0x8000,
            priority: 210,
            ..scrub_config()
        }
    }

    #[test]
    fn set_restores_old_range_if_scrubber_will_not_resume() {
        let (os, scrub) = balky_rig(1);
        let before = status_bytes(scrub);

        assert_eq!(scrub.set(&moved_range()), Err(PspError::Error));
        assert_eq!(status_bytes(scrub), before);
        assert_eq!(os.task("PSPMemScrub").unwrap().priority, 250);
        // The second enable, against the old range, went through.
        assert!(scrub.is_running());
    }

    #[test]
    fn set_restores_old_range_even_if_left_disabled() {
        let (_, scrub) = balky_rig(2);
        let before = status_bytes(scrub);

        assert_eq!(scrub.set(&moved_range()), Err(PspError::Error));
        assert_eq!(status_bytes(scrub), before);
        assert!(!scrub.is_running());
    }

    #[test]
    fn enable_is_verified() {
        let r = rig();
        r.scrub.init().unwrap();
        r.regs.stick(CTRL);
        assert_eq!(r.scrub.enable(), Err(PspError::Error));
        assert!(!r.scrub.is_running());
        assert_eq!(r.scrub.status().mode(), ScrubRunMode::Timed);
    }

    #[test]
    fn get_rejects_wrong_size_without_writing() {
        let r = rig();
        r.scrub.init().unwrap();
        let n = core::mem::size_of::<MemScrubStatus>();
        let mut short = vec![0xee; n - 1];
        assert_eq!(r.scrub.get(&mut short, true), Err(PspError::Error));
        assert!(short.iter().all(|&b| b == 0xee));
        let mut long = vec![0xee; n + 1];
        assert_eq!(r.scrub.get(&mut long, false), Err(PspError::Error));
        assert!(long.iter().all(|&b| b == 0xee));

        let mut exact = vec![0u8; n];
        r.scrub.get(&mut exact, true).unwrap();
        let s = MemScrubStatus::read_from_bytes(&exact[..]).unwrap();
        assert_eq!(s, r.scrub.status());
    }

    #[test]
    fn err_stats_copy_out() {
        let r = rig();
        r.scrub.init().unwrap();
        r.scrub.scrub_block();
        let n = core::mem::size_of::<MemScrubErrStats>();
        let mut short = vec![0xee; n - 1];
        assert_eq!(r.scrub.err_stats(&mut short, false), Err(PspError::Error));
        assert!(short.iter().all(|&b| b == 0xee));

        let mut out = vec![0u8; n];
        r.scrub.err_stats(&mut out, true).unwrap();
        let st = MemScrubErrStats::read_from_bytes(&out[..]).unwrap();
        assert_eq!(st.block_count, 1);
        // Reading doesn't reset anything.
        r.scrub.err_stats(&mut out, false).unwrap();
        assert_eq!(r.scrub.stats().block_count, 1);
    }

    #[test]
    fn blocks_walk_range_and_wrap() {
        let r = rig();
        r.scrub.init().unwrap();
        r.regs.reset_reads();
        let mut starts = vec![];
        for _ in 0..4 {
            let job = r.scrub.scrub_block();
            starts.push(job.start);
        }
        assert_eq!(starts, [0x1000, 0x1040, 0x1080, 0x10c0]);
        // Every word once, plus the ECC status after each block.
        assert_eq!(r.regs.read_count(), 0x100 / 4 + 4);
        let st = r.scrub.stats();
        assert_eq!(st.run_count, 1);
        assert_eq!(st.block_count, 4);
        assert_eq!(r.scrub.status().current_position, 0x1000);
    }

    #[test]
    fn short_last_block() {
        let mut c = config();
        c.scrub.end_addr = 0x1050;
        let r = rig_with(FakeOs::new(), c);
        r.scrub.init().unwrap();
        assert_eq!(r.scrub.scrub_block().end, 0x1040);
        let last = r.scrub.scrub_block();
        assert_eq!((last.start, last.end, last.wraps), (0x1040, 0x1050, true));
        assert_eq!(r.scrub.stats().run_count, 1);
    }

    #[test]
    fn ecc_errors_are_counted_and_cleared() {
        let r = rig();
        r.scrub.init().unwrap();
        r.regs.set(ECC_STATUS, (EccStatus::SBE | EccStatus::MBE).bits());
        r.regs.set(ECC_COUNT, 3);
        r.scrub.scrub_block();
        let st = r.scrub.stats();
        assert_eq!(st.correctable_error_count, 3);
        assert_eq!(st.uncorrectable_error_count, 1);
        assert_eq!(r.regs.get(ECC_STATUS), 0);
        assert_eq!(r.regs.get(ECC_COUNT), 0);

        // Nothing new, nothing counted.
        r.scrub.scrub_block();
        assert_eq!(r.scrub.stats().correctable_error_count, 3);
    }

    #[test]
    fn block_from_replaced_config_keeps_new_position() {
        let r = rig();
        r.scrub.init().unwrap();
        let job = r.scrub.next_job();

        let mut c = scrub_config();
        c.start_addr = 0x4000;
        c.end_addr = 0x8000;
        r.scrub.set(&c).unwrap();

        r.scrub.finish_job(&job, EccHarvest::default());
        assert_eq!(r.scrub.status().current_position, 0x4000);
        assert_eq!(r.scrub.stats().block_count, 1);
    }

    #[test]
    fn delete_is_terminal() {
        let r = rig();
        r.scrub.init().unwrap();
        r.scrub.enable().unwrap();
        r.scrub.delete().unwrap();
        assert!(!r.scrub.is_running());
        assert_eq!(r.scrub.status().mode(), ScrubRunMode::Idle);
        assert_eq!(r.scrub.trigger(), Err(PspError::Error));
    }

    fn wait_for(what: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !what() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn timed_task_scrubs_until_deleted() {
        let mut c = config();
        c.start_on_startup = true;
        let r = rig_with(FakeOs::spawning(), c);
        r.scrub.init().unwrap();
        wait_for(|| r.scrub.stats().run_count >= 1);
        r.scrub.delete().unwrap();
        r.os.join_all();
    }

    #[test]
    fn manual_pass_per_trigger() {
        let mut c = config();
        c.scrub.run_mode = ScrubRunMode::Manual;
        c.start_on_startup = true;
        let r = rig_with(FakeOs::spawning(), c);
        r.scrub.init().unwrap();

        r.scrub.trigger().unwrap();
        wait_for(|| r.scrub.stats().run_count == 1);
        assert_eq!(r.scrub.stats().block_count, 4);

        r.scrub.trigger().unwrap();
        wait_for(|| r.scrub.stats().run_count == 2);
        assert_eq!(r.scrub.stats().block_count, 8);

        r.scrub.delete().unwrap();
        r.os.join_all();
    }
}
