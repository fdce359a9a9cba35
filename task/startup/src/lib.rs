// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Startup supervision.
//!
//! Flight software gets a bounded amount of time to come up. When startup
//! begins, [`StartupSupervisor::startup_timer`] arms a one-shot timer and
//! the hardware watchdog; when flight software reaches its ready point it
//! calls [`StartupSupervisor::startup_clear`], which disarms both. If the
//! timer fires first, the board is restarted, escalating as described in
//! [`policy`].
//!
//! The escalation counters have to outlive the restart, so they are kept in
//! a small tracking file on the active boot partition. A missing file means
//! no failures yet; a garbled one is deleted and counting starts over, so
//! that corruption can never look like a high attempt count.
//!
//! All file I/O for a restart happens in
//! [`StartupSupervisor::prepare_restart`]; the timer hook only adds the call
//! to [`Board::restart`] on top.

#![cfg_attr(not(test), no_std)]

pub mod policy;
mod record;

pub use policy::{
    next_state, Counters, Escalation, Limits, SupervisorState,
};
pub use record::{StartupRecord, STARTUP_RECORD_MAGIC, STARTUP_RECORD_VERSION};

use drv_psp_watchdog::Watchdog;
use heapless::String;
use psp_config::MAX_PATH_LEN;
use psp_reserved_mem::ReservedMemoryMap;
use psp_userlib::{
    hl, psp_log, Board, Filesystem, FsError, OpenMode, Os, OsError, PspError,
    PspResult, ResetSubtype, ResetType, TimerHook, TimerId,
};
use ringbuf::{ringbuf, ringbuf_entry};
use spin::Mutex;
use zerocopy::IntoBytes;

const LOG_TAG: &str = "PSP STARTUP";

/// Longest boot partition name we will use.
pub const MAX_PARTITION_NAME_LEN: usize = 32;

pub type PartitionName = String<MAX_PARTITION_NAME_LEN>;
pub type TrackingPath = String<MAX_PATH_LEN>;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Armed { timer: TimerId, ms: u32 },
    TimerCreateFailed(OsError),
    TimerSetFailed(OsError),
    WatchdogEnableFailed,
    WrongTimer { expected: Option<TimerId>, fired: TimerId },
    NotArmed(SupervisorState),
    TrackingUnreadable(FsError),
    TrackingCorrupt(usize),
    TrackingWriteFailed(FsError),
    Restarting(ResetType, Counters),
    Cleared { ok: bool },
    PartitionFallback,
}

ringbuf!(Trace, 16, Trace::None);

#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub limits: Limits,
    pub max_wait_sec: u32,
    pub failed_startup_filename: &'static str,
    pub filename_max_len: usize,
    pub default_partition: &'static str,
    pub timer_name: &'static str,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            max_wait_sec: psp_config::STARTUP_MAX_WAIT_SEC,
            failed_startup_filename: psp_config::FAILED_STARTUP_FILENAME,
            filename_max_len: psp_config::FAILED_STARTUP_FILENAME_MAX_LEN,
            default_partition: psp_config::DEFAULT_CFS_PARTITION,
            timer_name: psp_config::STARTUP_TIMER_NAME,
        }
    }
}

/// Where the active partition name came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionSource {
    Kernel,
    Fallback,
}

/// What the supervisor knows about this boot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartupInfo {
    pub reset_type: ResetType,
    pub reset_subtype: ResetSubtype,
    pub active_cfs_partition: PartitionName,
    pub counters: Counters,
    pub timer: Option<TimerId>,
    pub max_wait_sec: u32,
    pub failed_startup_path: TrackingPath,
}

pub struct StartupSupervisor {
    os: &'static dyn Os,
    fs: &'static dyn Filesystem,
    board: &'static dyn Board,
    watchdog: &'static Watchdog,
    map: &'static ReservedMemoryMap,
    config: Config,
    state: Mutex<SupervisorState>,
    info: Mutex<StartupInfo>,
}

impl StartupSupervisor {
    pub fn new(
        os: &'static dyn Os,
        fs: &'static dyn Filesystem,
        board: &'static dyn Board,
        watchdog: &'static Watchdog,
        map: &'static ReservedMemoryMap,
        config: Config,
    ) -> Self {
        let reset_type = map
            .boot_record()
            .and_then(|r| r.last_reset())
            .unwrap_or(ResetType::PowerOn);
        Self {
            os,
            fs,
            board,
            watchdog,
            map,
            config,
            state: Mutex::new(SupervisorState::Quiescent),
            info: Mutex::new(StartupInfo {
                reset_type,
                reset_subtype: board.reset_subtype(),
                active_cfs_partition: PartitionName::new(),
                counters: Counters::default(),
                timer: None,
                max_wait_sec: config.max_wait_sec,
                failed_startup_path: TrackingPath::new(),
            }),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    pub fn startup_info(&self) -> StartupInfo {
        self.info.lock().clone()
    }

    /// Works out the active boot partition, falling back to the configured
    /// default if the kernel doesn't say or says something unusable.
    pub fn active_cfs_partition(&self) -> (PartitionName, PartitionSource) {
        if let Some(name) = self.board.active_boot_partition() {
            let mut p = PartitionName::new();
            if !name.is_empty() && p.push_str(name).is_ok() {
                return (p, PartitionSource::Kernel);
            }
        }
        ringbuf_entry!(Trace::PartitionFallback);
        let mut p = PartitionName::new();
        // Bounded by the build-time checks on the default.
        let _ = p.push_str(self.config.default_partition);
        (p, PartitionSource::Fallback)
    }

    /// Copies the active partition name, NUL terminated, into `buf`.
    ///
    /// If the default had to be used, `buf` is still filled in but the
    /// result is `Err(Error)`. Callers are expected to carry on with it.
    pub fn get_active_cfs_partition(&self, buf: &mut [u8]) -> PspResult<()> {
        let (name, source) = self.active_cfs_partition();
        let n = name.len();
        if buf.len() < n + 1 {
            return Err(PspError::InvalidMemSize);
        }
        buf[..n].copy_from_slice(name.as_bytes());
        buf[n] = 0;
        match source {
            PartitionSource::Kernel => Ok(()),
            PartitionSource::Fallback => {
                psp_log!(LOG_TAG, "using default partition {}", name.as_str());
                Err(PspError::Error)
            }
        }
    }

    fn tracking_path(&self) -> PspResult<TrackingPath> {
        let name = self.config.failed_startup_filename;
        if name.is_empty() || name.len() > self.config.filename_max_len {
            psp_log!(LOG_TAG, "bad tracking filename {}", name);
            return Err(PspError::Error);
        }
        let (part, _) = self.active_cfs_partition();
        let path = hl::join_path(&part, name).map_err(|_| {
            psp_log!(LOG_TAG, "tracking path too long");
            PspError::Error
        })?;
        let mut info = self.info.lock();
        info.active_cfs_partition = part;
        info.failed_startup_path = path.clone();
        Ok(path)
    }

    /// Arms the startup timer and the hardware watchdog.
    ///
    /// Fails if the timer cannot be created or set. A watchdog that won't
    /// enable is only logged; the timer alone still bounds startup.
    ///
    /// The counters left by earlier failed startups are loaded into
    /// [`StartupInfo`] here. Nothing is written until the timer expires.
    pub fn startup_timer(&'static self) -> PspResult<()> {
        let path = self.tracking_path()?;
        let counters = self.read_counters(&path);
        self.info.lock().counters = counters;

        let timer = self
            .os
            .timer_create(self.config.timer_name, self)
            .map_err(|e| {
                ringbuf_entry!(Trace::TimerCreateFailed(e));
                psp_log!(LOG_TAG, "timer_create failed: {:?}", e);
                PspError::Error
            })?;
        // Recorded before arming, so an expiry can always be matched.
        self.info.lock().timer = Some(timer);

        let ms = self.config.max_wait_sec.saturating_mul(1000);
        if let Err(e) = self.os.timer_set(timer, ms, 0) {
            ringbuf_entry!(Trace::TimerSetFailed(e));
            psp_log!(LOG_TAG, "timer_set failed: {:?}", e);
            self.info.lock().timer = None;
            let _ = self.os.timer_delete(timer);
            return Err(PspError::Error);
        }
        *self.state.lock() = SupervisorState::Armed;

        if self.watchdog.enable().is_err() {
            ringbuf_entry!(Trace::WatchdogEnableFailed);
            psp_log!(LOG_TAG, "watchdog did not enable");
        }
        ringbuf_entry!(Trace::Armed { timer, ms });
        Ok(())
    }

    fn read_counters(&self, path: &str) -> Counters {
        match self.read_record(path) {
            Ok(Some(c)) => c,
            Ok(None) => Counters::default(),
            Err(e) => {
                ringbuf_entry!(Trace::TrackingUnreadable(e));
                psp_log!(LOG_TAG, "cannot read {}: {:?}", path, e);
                if let Err(e) = hl::remove_if_present(self.fs, path) {
                    psp_log!(LOG_TAG, "cannot remove {}: {:?}", path, e);
                }
                Counters::default()
            }
        }
    }

    /// `Ok(None)` if there is no file. A garbled file is deleted, and also
    /// comes back as `Ok(None)`.
    fn read_record(&self, path: &str) -> Result<Option<Counters>, FsError> {
        if hl::stat_if_present(self.fs, path)?.is_none() {
            return Ok(None);
        }
        let mut buf = [0u8; core::mem::size_of::<StartupRecord>() + 1];
        let fd = self.fs.open(path, OpenMode::ReadOnly)?;
        let r = hl::read_exact(self.fs, fd, &mut buf);
        let c = self.fs.close(fd);
        let n = r?;
        c?;

        match StartupRecord::parse(&buf[..n]) {
            Some(counters) => Ok(Some(counters)),
            None => {
                ringbuf_entry!(Trace::TrackingCorrupt(n));
                psp_log!(LOG_TAG, "{} is corrupt, starting over", path);
                hl::remove_if_present(self.fs, path)?;
                Ok(None)
            }
        }
    }

    fn write_counters(&self, path: &str, c: Counters) -> Result<(), FsError> {
        let rec = StartupRecord::new(c);
        let fd = self.fs.open(path, OpenMode::CreateTruncate)?;
        let r = hl::write_all(self.fs, fd, rec.as_bytes());
        let cl = self.fs.close(fd);
        r?;
        cl
    }

    /// Does everything a startup timeout calls for short of restarting:
    /// checks that `timer` is ours, advances and persists the counters, and
    /// notes the chosen reset in the boot record.
    ///
    /// Returns the reset to issue, or `None` (having touched nothing) if the
    /// expiry is not one we should act on.
    pub fn prepare_restart(&self, timer: TimerId) -> Option<ResetType> {
        let expected = self.info.lock().timer;
        if expected != Some(timer) {
            ringbuf_entry!(Trace::WrongTimer {
                expected,
                fired: timer
            });
            psp_log!(
                LOG_TAG,
                "expiry of {:?}, expected {:?}; ignoring",
                timer,
                expected
            );
            return None;
        }
        let state = self.state();
        if state != SupervisorState::Armed {
            ringbuf_entry!(Trace::NotArmed(state));
            psp_log!(LOG_TAG, "expiry in state {:?}; ignoring", state);
            return None;
        }

        let path = self.info.lock().failed_startup_path.clone();
        let counters = self.read_counters(&path);
        let (next, reset) = next_state(counters, &self.config.limits);
        if let Err(e) = self.write_counters(&path, next) {
            // Restart anyway; the next boot starts counting over.
            ringbuf_entry!(Trace::TrackingWriteFailed(e));
            psp_log!(LOG_TAG, "cannot write {}: {:?}", path.as_str(), e);
        }
        self.info.lock().counters = next;
        *self.state.lock() = SupervisorState::Escalating(reset.into());
        self.map.record_reset(reset);

        ringbuf_entry!(Trace::Restarting(reset, next));
        psp_log!(
            LOG_TAG,
            "startup timed out after {} s, {:?} reset ({} / {})",
            self.config.max_wait_sec,
            reset,
            next.failed_attempts,
            next.failed_reset_attempts
        );
        Some(reset)
    }

    /// Marks startup as complete: deletes the timer and the tracking file,
    /// and disables the watchdog.
    ///
    /// A deletion that fails (other than for something already gone) makes
    /// this return `Err(Error)`, but the watchdog is disabled regardless.
    pub fn startup_clear(&self) -> PspResult<()> {
        let mut ok = true;

        let timer = self.info.lock().timer.take();
        if let Some(timer) = timer {
            match self.os.timer_delete(timer) {
                Ok(()) | Err(OsError::InvalidId) => (),
                Err(e) => {
                    psp_log!(LOG_TAG, "timer_delete failed: {:?}", e);
                    ok = false;
                }
            }
        }

        let stored = self.info.lock().failed_startup_path.clone();
        let path = if stored.is_empty() {
            self.tracking_path().ok()
        } else {
            Some(stored)
        };
        match path {
            Some(path) => {
                if let Err(e) = hl::remove_if_present(self.fs, &path) {
                    psp_log!(
                        LOG_TAG,
                        "cannot remove {}: {:?}",
                        path.as_str(),
                        e
                    );
                    ok = false;
                }
            }
            None => ok = false,
        }

        if self.watchdog.disable().is_err() {
            psp_log!(LOG_TAG, "watchdog did not disable");
            ok = false;
        }

        *self.state.lock() = SupervisorState::Cleared;
        ringbuf_entry!(Trace::Cleared { ok });
        if ok {
            Ok(())
        } else {
            Err(PspError::Error)
        }
    }
}

impl TimerHook for StartupSupervisor {
    fn expired(&self, timer: TimerId) {
        if let Some(reset) = self.prepare_restart(timer) {
            self.board.restart(reset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_psp_watchdog::{Config as WatchdogConfig, Ctrl};
    use enum_map::enum_map;
    use psp_reserved_mem::Layout;
    use psp_userlib::fakes::{
        catch_restart, leak, FakeBoard, FakeFs, FakeOs, FakeRegisters,
        FsCall, OsCall,
    };

    const WD_CTRL: u32 = 0x100;
    const TRACKING: &str = "/ffx0/startup_failed.bin";

    struct Rig {
        os: &'static FakeOs,
        fs: &'static FakeFs,
        board: &'static FakeBoard,
        regs: &'static FakeRegisters,
        map: &'static ReservedMemoryMap,
        sup: &'static StartupSupervisor,
    }

    fn config() -> Config {
        Config {
            limits: Limits {
                max_processor_resets: 3,
                max_poweron_resets: 2,
            },
            max_wait_sec: 180,
            failed_startup_filename: "startup_failed.bin",
            filename_max_len: 64,
            default_partition: "/ffx0",
            timer_name: "PSPStartupTmr",
        }
    }

    fn map() -> &'static ReservedMemoryMap {
        let layout = Layout {
            budget: 64,
            sizes: enum_map! { _ => 16 },
            backing_files: enum_map! { _ => "/ram/x.bin" },
        };
        let region = Box::leak(vec![0u8; 128].into_boxed_slice());
        leak(ReservedMemoryMap::setup(region, 0x1000, &layout).unwrap())
    }

    /// A fresh boot sharing `fs` with earlier ones.
    fn boot(fs: &'static FakeFs, board: FakeBoard, config: Config) -> Rig {
        let os = leak(FakeOs::new());
        let board = leak(board);
        let regs = leak(FakeRegisters::new());
        let wd = leak(Watchdog::new(
            regs,
            WatchdogConfig {
                ctrl_register: WD_CTRL,
                timeout_register: 0x104,
                service_register: 0x108,
                default_timeout_ms: 20_000,
            },
        ));
        wd.init();
        let map = map();
        let sup =
            leak(StartupSupervisor::new(os, fs, board, wd, map, config));
        Rig {
            os,
            fs,
            board,
            regs,
            map,
            sup,
        }
    }

    fn rig() -> Rig {
        boot(leak(FakeFs::new()), FakeBoard::new(0x1000_0000), config())
    }

    fn timer(r: &Rig) -> TimerId {
        r.sup.startup_info().timer.unwrap()
    }

    fn wd_on(r: &Rig) -> bool {
        Ctrl::from_bits_retain(r.regs.get(WD_CTRL)).contains(Ctrl::ENABLE)
    }

    fn tracked(fs: &FakeFs) -> Option<Counters> {
        fs.file(TRACKING).and_then(|b| StartupRecord::parse(&b))
    }

    #[test]
    fn timer_arms_one_shot_and_watchdog() {
        let r = rig();
        r.sup.startup_timer().unwrap();
        assert_eq!(r.os.timer_armed(timer(&r)), Some((180_000, 0)));
        assert!(wd_on(&r));
        assert_eq!(r.sup.state(), SupervisorState::Armed);
        let info = r.sup.startup_info();
        assert_eq!(info.failed_startup_path.as_str(), TRACKING);
        assert_eq!(info.active_cfs_partition.as_str(), "/ffx0");
        assert_eq!(info.max_wait_sec, 180);
    }

    #[test]
    fn timer_reports_counters_from_earlier_boots() {
        let r = rig();
        let before = Counters {
            failed_attempts: 2,
            failed_reset_attempts: 1,
        };
        r.fs.put_file(TRACKING, StartupRecord::new(before).as_bytes());
        assert_eq!(r.sup.startup_info().counters, Counters::default());

        r.sup.startup_timer().unwrap();
        assert_eq!(r.sup.startup_info().counters, before);
        // Read only; the file is untouched until expiry.
        assert_eq!(r.fs.write_opens(TRACKING), 0);
        assert_eq!(tracked(r.fs), Some(before));
    }

    #[test]
    fn timer_create_failure() {
        let r = rig();
        r.os.fail(OsCall::TimerCreate);
        assert_eq!(r.sup.startup_timer(), Err(PspError::Error));
        assert_eq!(r.sup.state(), SupervisorState::Quiescent);
        assert!(!wd_on(&r));
    }

    #[test]
    fn timer_set_failure_cleans_up_timer() {
        let r = rig();
        r.os.fail(OsCall::TimerSet);
        assert_eq!(r.sup.startup_timer(), Err(PspError::Error));
        assert_eq!(r.sup.startup_info().timer, None);
        assert_eq!(r.sup.state(), SupervisorState::Quiescent);
    }

    #[test]
    fn stuck_watchdog_does_not_fail_timer() {
        let r = rig();
        r.regs.stick(WD_CTRL);
        r.sup.startup_timer().unwrap();
        assert_eq!(r.sup.state(), SupervisorState::Armed);
    }

    #[test]
    fn expiry_restarts_with_processor_reset() {
        let r = rig();
        r.sup.startup_timer().unwrap();
        let t = timer(&r);
        let reset = catch_restart(|| {
            r.os.fire_timer(t);
        });
        assert_eq!(reset, Some(ResetType::Processor));
        assert_eq!(r.board.restarts(), [ResetType::Processor]);
        assert_eq!(
            tracked(r.fs),
            Some(Counters {
                failed_attempts: 1,
                failed_reset_attempts: 0
            })
        );
        assert_eq!(
            r.map.boot_record().unwrap().next_reset(),
            Some(ResetType::Processor)
        );
        assert_eq!(
            r.sup.state(),
            SupervisorState::Escalating(Escalation::Processor)
        );
    }

    #[test]
    fn mismatched_timer_is_ignored() {
        let r = rig();
        r.sup.startup_timer().unwrap();
        let t = timer(&r);
        let bogus = TimerId(t.0 + 100);
        let reset = catch_restart(|| r.os.fire_timer_as(t, bogus));
        assert_eq!(reset, None);
        assert!(r.board.restarts().is_empty());
        assert!(r.fs.file(TRACKING).is_none());
        assert_eq!(r.fs.write_opens(TRACKING), 0);
        assert_eq!(r.sup.state(), SupervisorState::Armed);
    }

    #[test]
    fn escalation_survives_restarts() {
        let fs = leak(FakeFs::new());
        let mut seen = vec![];
        for _ in 0..6 {
            let r = boot(fs, FakeBoard::new(0x1000_0000), config());
            r.sup.startup_timer().unwrap();
            let t = timer(&r);
            seen.push(catch_restart(|| {
                r.os.fire_timer(t);
            }));
        }
        assert_eq!(
            seen,
            [
                Some(ResetType::Processor),
                Some(ResetType::Processor),
                Some(ResetType::PowerOn),
                Some(ResetType::Processor),
                Some(ResetType::Processor),
                Some(ResetType::CfsToggle),
            ]
        );
        assert_eq!(tracked(fs), Some(Counters::default()));
    }

    #[test]
    fn corrupt_tracking_file_starts_over() {
        let r = rig();
        r.fs.put_file(TRACKING, &[0xff; 20]);
        r.sup.startup_timer().unwrap();
        let t = timer(&r);
        let reset = catch_restart(|| {
            r.os.fire_timer(t);
        });
        assert_eq!(reset, Some(ResetType::Processor));
        assert_eq!(
            tracked(r.fs),
            Some(Counters {
                failed_attempts: 1,
                failed_reset_attempts: 0
            })
        );
    }

    #[test]
    fn short_tracking_file_starts_over() {
        let r = rig();
        let full = StartupRecord::new(Counters {
            failed_attempts: 2,
            failed_reset_attempts: 1,
        });
        r.fs.put_file(TRACKING, &full.as_bytes()[..10]);
        r.sup.startup_timer().unwrap();
        let t = timer(&r);
        assert_eq!(
            catch_restart(|| {
                r.os.fire_timer(t);
            }),
            Some(ResetType::Processor)
        );
        assert_eq!(tracked(r.fs).unwrap().failed_attempts, 1);
    }

    #[test]
    fn unwritable_tracking_file_still_restarts() {
        let r = rig();
        r.fs.fail(FsCall::Open, TRACKING, FsError::NoSpace);
        r.sup.startup_timer().unwrap();
        let t = timer(&r);
        assert_eq!(
            catch_restart(|| {
                r.os.fire_timer(t);
            }),
            Some(ResetType::Processor)
        );
    }

    #[test]
    fn clear_undoes_everything() {
        let r = rig();
        r.fs.put_file(
            TRACKING,
            StartupRecord::new(Counters {
                failed_attempts: 1,
                failed_reset_attempts: 0,
            })
            .as_bytes(),
        );
        r.sup.startup_timer().unwrap();
        let t = timer(&r);

        r.sup.startup_clear().unwrap();
        assert!(!r.os.timer_exists(t));
        assert!(r.fs.file(TRACKING).is_none());
        assert!(!wd_on(&r));
        assert_eq!(r.sup.state(), SupervisorState::Cleared);

        // Nothing left to fire.
        assert!(!r.os.fire_timer(t));
        // A stale expiry that raced the delete is ignored too.
        assert_eq!(r.sup.prepare_restart(t), None);
    }

    #[test]
    fn clear_with_nothing_to_delete_succeeds() {
        let r = rig();
        r.sup.startup_clear().unwrap();
        assert_eq!(r.sup.state(), SupervisorState::Cleared);
    }

    #[test]
    fn clear_disables_watchdog_even_when_deletes_fail() {
        let r = rig();
        r.fs.put_file(TRACKING, &[0; 20]);
        r.sup.startup_timer().unwrap();
        assert!(wd_on(&r));
        r.fs.fail(FsCall::Remove, TRACKING, FsError::PermissionDenied);
        r.os.fail(OsCall::TimerDelete);

        assert_eq!(r.sup.startup_clear(), Err(PspError::Error));
        assert!(!wd_on(&r));
        assert_eq!(r.sup.startup_info().timer, None);
    }

    #[test]
    fn partition_from_kernel() {
        let r = boot(
            leak(FakeFs::new()),
            FakeBoard::new(0x1000_0000).with_partition("/ffx1"),
            config(),
        );
        let mut buf = [0xffu8; 16];
        r.sup.get_active_cfs_partition(&mut buf).unwrap();
        assert_eq!(&buf[..6], b"/ffx1\0");

        r.sup.startup_timer().unwrap();
        assert_eq!(
            r.sup.startup_info().failed_startup_path.as_str(),
            "/ffx1/startup_failed.bin"
        );
    }

    #[test]
    fn partition_fallback_reports_error_but_fills_buffer() {
        let r = rig();
        let mut buf = [0xffu8; 16];
        assert_eq!(
            r.sup.get_active_cfs_partition(&mut buf),
            Err(PspError::Error)
        );
        assert_eq!(&buf[..6], b"/ffx0\0");

        let mut tiny = [0xffu8; 5];
        assert_eq!(
            r.sup.get_active_cfs_partition(&mut tiny),
            Err(PspError::InvalidMemSize)
        );
        assert_eq!(tiny, [0xff; 5]);
    }

    #[test]
    fn oversized_kernel_partition_falls_back() {
        let long = "/".repeat(MAX_PARTITION_NAME_LEN + 1);
        let r = boot(
            leak(FakeFs::new()),
            FakeBoard::new(0x1000_0000).with_partition(&long),
            config(),
        );
        let (name, source) = r.sup.active_cfs_partition();
        assert_eq!(name.as_str(), "/ffx0");
        assert_eq!(source, PartitionSource::Fallback);
    }

    #[test]
    fn info_reflects_boot() {
        let fs = leak(FakeFs::new());
        let r = boot(
            fs,
            FakeBoard::new(0x1000_0000)
                .with_subtype(ResetSubtype::HwWatchdog),
            config(),
        );
        r.map.record_reset(ResetType::Processor);
        r.map.detect_reset_type();
        let sup = StartupSupervisor::new(
            r.os,
            fs,
            r.board,
            r.sup.watchdog,
            r.map,
            config(),
        );
        let info = sup.startup_info();
        assert_eq!(info.reset_type, ResetType::Processor);
        assert_eq!(info.reset_subtype, ResetSubtype::HwWatchdog);
    }

    #[test]
    fn bad_filename_is_rejected() {
        let mut c = config();
        c.filename_max_len = 4;
        let r = boot(leak(FakeFs::new()), FakeBoard::new(0x1000_0000), c);
        assert_eq!(r.sup.startup_timer(), Err(PspError::Error));
        assert_eq!(r.sup.state(), SupervisorState::Quiescent);
    }
}
