// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the platform services, for host tests.
//!
//! Each fake records what was asked of it and can be told to fail specific
//! calls, so tests can walk the PSP through failure paths that are awkward to
//! provoke on a real board.

use crate::{
    Board, Fd, FileStat, Filesystem, FsError, OpenMode, Os, OsError,
    Priority, RegisterIo, ResetSubtype, ResetType, SemId, TaskBody, TaskId,
    TimerHook, TimerId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::string::{String, ToString};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use std::vec::Vec;

/// Gives a fake (or anything else) the `'static` lifetime the PSP engines
/// expect of their collaborators.
pub fn leak<T>(t: T) -> &'static T {
    Box::leak(Box::new(t))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum OsCall {
    TaskCreate,
    TaskSetPriority,
    BinSemCreate,
    BinSemGive,
    BinSemTake,
    TimerCreate,
    TimerSet,
    TimerDelete,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FakeTask {
    pub id: TaskId,
    pub name: String,
    pub priority: Priority,
}

struct FakeTimer {
    hook: &'static dyn TimerHook,
    armed: Option<(u32, u32)>,
}

type Sem = Arc<(Mutex<bool>, Condvar)>;

#[derive(Default)]
struct OsState {
    next_id: u32,
    tasks: Vec<FakeTask>,
    timers: BTreeMap<u32, FakeTimer>,
    sems: BTreeMap<u32, Sem>,
    delayed_ms: u64,
    failing: BTreeSet<OsCall>,
}

/// Fake RTOS.
///
/// Tasks are only recorded unless the fake was built with
/// [`FakeOs::spawning`], in which case each task body runs on its own thread.
/// Timers never fire on their own; tests call [`FakeOs::fire_timer`].
pub struct FakeOs {
    state: Mutex<OsState>,
    spawn: bool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for FakeOs {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeOs {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OsState {
                next_id: 1,
                ..Default::default()
            }),
            spawn: false,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn spawning() -> Self {
        Self {
            spawn: true,
            ..Self::new()
        }
    }

    pub fn fail(&self, call: OsCall) {
        self.state.lock().unwrap().failing.insert(call);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    pub fn task(&self, name: &str) -> Option<FakeTask> {
        let s = self.state.lock().unwrap();
        s.tasks.iter().find(|t| t.name == name).cloned()
    }

    pub fn timer_exists(&self, timer: TimerId) -> bool {
        self.state.lock().unwrap().timers.contains_key(&timer.0)
    }

    /// Returns `(start_ms, interval_ms)` if the timer is armed.
    pub fn timer_armed(&self, timer: TimerId) -> Option<(u32, u32)> {
        let s = self.state.lock().unwrap();
        s.timers.get(&timer.0).and_then(|t| t.armed)
    }

    /// Runs the hook for `timer` as if it expired, whether or not it exists.
    /// Returns false if there is no such timer.
    pub fn fire_timer(&self, timer: TimerId) -> bool {
        let hook = {
            let mut s = self.state.lock().unwrap();
            match s.timers.get_mut(&timer.0) {
                Some(t) => {
                    t.armed = None;
                    t.hook
                }
                None => return false,
            }
        };
        hook.expired(timer);
        true
    }

    /// Runs the hook registered for `registered`, but reports `reported` as
    /// the expiring timer.
    pub fn fire_timer_as(&self, registered: TimerId, reported: TimerId) {
        let hook = {
            let s = self.state.lock().unwrap();
            s.timers.get(&registered.0).map(|t| t.hook)
        };
        if let Some(hook) = hook {
            hook.expired(reported);
        }
    }

    pub fn delayed_ms(&self) -> u64 {
        self.state.lock().unwrap().delayed_ms
    }

    /// Whether `sem` is currently available.
    pub fn sem_full(&self, sem: SemId) -> bool {
        let s = self.state.lock().unwrap();
        s.sems.get(&sem.0).map(|p| *p.0.lock().unwrap()).unwrap_or(false)
    }

    /// Number of semaphores created so far.
    pub fn sem_count(&self) -> usize {
        self.state.lock().unwrap().sems.len()
    }

    /// Waits for every spawned task to return.
    pub fn join_all(&self) {
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for t in threads {
            t.join().unwrap();
        }
    }

    fn check(&self, call: OsCall) -> Result<(), OsError> {
        if self.state.lock().unwrap().failing.contains(&call) {
            Err(OsError::Error)
        } else {
            Ok(())
        }
    }

    fn sem(&self, sem: SemId) -> Result<Sem, OsError> {
        let s = self.state.lock().unwrap();
        s.sems.get(&sem.0).cloned().ok_or(OsError::InvalidId)
    }
}

impl Os for FakeOs {
    fn task_create(
        &self,
        name: &str,
        priority: Priority,
        body: &'static dyn TaskBody,
    ) -> Result<TaskId, OsError> {
        self.check(OsCall::TaskCreate)?;
        let id = {
            let mut s = self.state.lock().unwrap();
            if s.tasks.iter().any(|t| t.name == name) {
                return Err(OsError::NameTaken);
            }
            let id = TaskId(s.next_id);
            s.next_id += 1;
            s.tasks.push(FakeTask {
                id,
                name: name.to_string(),
                priority,
            });
            id
        };
        if self.spawn {
            let handle = std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || body.run())
                .map_err(|_| OsError::Error)?;
            self.threads.lock().unwrap().push(handle);
        }
        Ok(id)
    }

    fn task_set_priority(
        &self,
        task: TaskId,
        priority: Priority,
    ) -> Result<(), OsError> {
        self.check(OsCall::TaskSetPriority)?;
        let mut s = self.state.lock().unwrap();
        let t = s
            .tasks
            .iter_mut()
            .find(|t| t.id == task)
            .ok_or(OsError::InvalidId)?;
        t.priority = priority;
        Ok(())
    }

    fn task_delay(&self, ms: u32) {
        self.state.lock().unwrap().delayed_ms += u64::from(ms);
        if self.spawn {
            std::thread::sleep(Duration::from_millis(u64::from(ms.min(1))));
        } else {
            std::thread::yield_now();
        }
    }

    fn bin_sem_create(
        &self,
        _name: &str,
        initially_full: bool,
    ) -> Result<SemId, OsError> {
        self.check(OsCall::BinSemCreate)?;
        let mut s = self.state.lock().unwrap();
        let id = s.next_id;
        s.next_id += 1;
        s.sems
            .insert(id, Arc::new((Mutex::new(initially_full), Condvar::new())));
        Ok(SemId(id))
    }

    fn bin_sem_give(&self, sem: SemId) -> Result<(), OsError> {
        self.check(OsCall::BinSemGive)?;
        let sem = self.sem(sem)?;
        let (lock, cv) = &*sem;
        *lock.lock().unwrap() = true;
        cv.notify_one();
        Ok(())
    }

    fn bin_sem_take(
        &self,
        sem: SemId,
        timeout_ms: Option<u32>,
    ) -> Result<(), OsError> {
        self.check(OsCall::BinSemTake)?;
        let sem = self.sem(sem)?;
        let (lock, cv) = &*sem;
        let mut full = lock.lock().unwrap();
        match timeout_ms {
            None => {
                while !*full {
                    full = cv.wait(full).unwrap();
                }
            }
            Some(ms) => {
                let wait = Duration::from_millis(u64::from(ms));
                let (guard, _) =
                    cv.wait_timeout_while(full, wait, |f| !*f).unwrap();
                full = guard;
                if !*full {
                    return Err(OsError::Timeout);
                }
            }
        }
        *full = false;
        Ok(())
    }

    fn timer_create(
        &self,
        _name: &str,
        hook: &'static dyn TimerHook,
    ) -> Result<TimerId, OsError> {
        self.check(OsCall::TimerCreate)?;
        let mut s = self.state.lock().unwrap();
        let id = s.next_id;
        s.next_id += 1;
        s.timers.insert(id, FakeTimer { hook, armed: None });
        Ok(TimerId(id))
    }

    fn timer_set(
        &self,
        timer: TimerId,
        start_ms: u32,
        interval_ms: u32,
    ) -> Result<(), OsError> {
        self.check(OsCall::TimerSet)?;
        let mut s = self.state.lock().unwrap();
        let t = s.timers.get_mut(&timer.0).ok_or(OsError::InvalidId)?;
        t.armed = Some((start_ms, interval_ms));
        Ok(())
    }

    fn timer_delete(&self, timer: TimerId) -> Result<(), OsError> {
        self.check(OsCall::TimerDelete)?;
        let mut s = self.state.lock().unwrap();
        s.timers
            .remove(&timer.0)
            .map(|_| ())
            .ok_or(OsError::InvalidId)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum FsCall {
    Open,
    Read,
    Write,
    Lseek,
    Close,
    Remove,
    Stat,
    Mkdir,
}

struct OpenFile {
    path: String,
    pos: usize,
    mode: OpenMode,
}

#[derive(Default)]
struct FsState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    open: BTreeMap<i32, OpenFile>,
    next_fd: i32,
    faults: BTreeMap<(FsCall, String), FsError>,
    write_opens: BTreeMap<String, usize>,
}

/// Fake flat filesystem. Directories are tracked only so `mkdir` can report
/// `AlreadyExists`; files may be created anywhere.
#[derive(Default)]
pub struct FakeFs {
    state: Mutex<FsState>,
}

impl FakeFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `call` on `path` fail with `err` until cleared.
    pub fn fail(&self, call: FsCall, path: &str, err: FsError) {
        let mut s = self.state.lock().unwrap();
        s.faults.insert((call, path.to_string()), err);
    }

    pub fn fail_mkdir(&self, path: &str, err: FsError) {
        self.fail(FsCall::Mkdir, path, err);
    }

    pub fn clear_faults(&self) {
        self.state.lock().unwrap().faults.clear();
    }

    pub fn put_file(&self, path: &str, contents: &[u8]) {
        let mut s = self.state.lock().unwrap();
        s.files.insert(path.to_string(), contents.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    /// Number of times `path` has been opened for writing.
    pub fn write_opens(&self, path: &str) -> usize {
        let s = self.state.lock().unwrap();
        s.write_opens.get(path).copied().unwrap_or(0)
    }

    pub fn open_descriptors(&self) -> usize {
        self.state.lock().unwrap().open.len()
    }

    fn check(
        s: &FsState,
        call: FsCall,
        path: &str,
    ) -> Result<(), FsError> {
        match s.faults.get(&(call, path.to_string())) {
            Some(e) => Err(*e),
            None => Ok(()),
        }
    }

    fn path_of(s: &FsState, fd: Fd) -> Result<String, FsError> {
        s.open
            .get(&fd.0)
            .map(|f| f.path.clone())
            .ok_or(FsError::BadDescriptor)
    }
}

impl Filesystem for FakeFs {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Fd, FsError> {
        let mut s = self.state.lock().unwrap();
        Self::check(&s, FsCall::Open, path)?;
        match mode {
            OpenMode::ReadOnly => {
                if !s.files.contains_key(path) {
                    return Err(FsError::NotFound);
                }
            }
            OpenMode::CreateTruncate => {
                s.files.insert(path.to_string(), Vec::new());
                *s.write_opens.entry(path.to_string()).or_default() += 1;
            }
        }
        s.next_fd += 1;
        let fd = s.next_fd;
        s.open.insert(
            fd,
            OpenFile {
                path: path.to_string(),
                pos: 0,
                mode,
            },
        );
        Ok(Fd(fd))
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut s = self.state.lock().unwrap();
        let path = Self::path_of(&s, fd)?;
        Self::check(&s, FsCall::Read, &path)?;
        let pos = s.open[&fd.0].pos;
        let data = s.files.get(&path).ok_or(FsError::Io)?;
        let n = data.len().saturating_sub(pos).min(buf.len());
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        if let Some(f) = s.open.get_mut(&fd.0) {
            f.pos += n;
        }
        Ok(n)
    }

    fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize, FsError> {
        let mut s = self.state.lock().unwrap();
        let path = Self::path_of(&s, fd)?;
        Self::check(&s, FsCall::Write, &path)?;
        let (pos, mode) = {
            let f = &s.open[&fd.0];
            (f.pos, f.mode)
        };
        if mode == OpenMode::ReadOnly {
            return Err(FsError::BadDescriptor);
        }
        let data = s.files.entry(path).or_default();
        if data.len() < pos + buf.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        if let Some(f) = s.open.get_mut(&fd.0) {
            f.pos += buf.len();
        }
        Ok(buf.len())
    }

    fn lseek(&self, fd: Fd, offset: u32) -> Result<u32, FsError> {
        let mut s = self.state.lock().unwrap();
        let path = Self::path_of(&s, fd)?;
        Self::check(&s, FsCall::Lseek, &path)?;
        if let Some(f) = s.open.get_mut(&fd.0) {
            f.pos = offset as usize;
        }
        Ok(offset)
    }

    fn close(&self, fd: Fd) -> Result<(), FsError> {
        let mut s = self.state.lock().unwrap();
        let path = Self::path_of(&s, fd)?;
        s.open.remove(&fd.0);
        Self::check(&s, FsCall::Close, &path)
    }

    fn remove(&self, path: &str) -> Result<(), FsError> {
        let mut s = self.state.lock().unwrap();
        Self::check(&s, FsCall::Remove, path)?;
        s.files.remove(path).map(|_| ()).ok_or(FsError::NotFound)
    }

    fn stat(&self, path: &str) -> Result<FileStat, FsError> {
        let s = self.state.lock().unwrap();
        Self::check(&s, FsCall::Stat, path)?;
        s.files
            .get(path)
            .map(|d| FileStat {
                size: d.len() as u32,
            })
            .ok_or(FsError::NotFound)
    }

    fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let mut s = self.state.lock().unwrap();
        Self::check(&s, FsCall::Mkdir, path)?;
        if s.dirs.contains(path) || s.files.contains_key(path) {
            return Err(FsError::AlreadyExists);
        }
        s.dirs.insert(path.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RegState {
    regs: BTreeMap<u32, u32>,
    w1c: BTreeSet<u32>,
    stuck: BTreeSet<u32>,
    reads: u64,
}

/// Fake register file and RAM. Unwritten addresses read as zero.
#[derive(Default)]
pub struct FakeRegisters {
    state: Mutex<RegState>,
}

impl FakeRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a register directly, bypassing write semantics.
    pub fn set(&self, addr: u32, value: u32) {
        self.state.lock().unwrap().regs.insert(addr, value);
    }

    pub fn get(&self, addr: u32) -> u32 {
        let s = self.state.lock().unwrap();
        s.regs.get(&addr).copied().unwrap_or(0)
    }

    /// Makes writes to `addr` clear the bits written, as status registers do.
    pub fn write_one_to_clear(&self, addr: u32) {
        self.state.lock().unwrap().w1c.insert(addr);
    }

    /// Makes writes to `addr` vanish, as if the hardware refused them.
    pub fn stick(&self, addr: u32) {
        self.state.lock().unwrap().stuck.insert(addr);
    }

    pub fn unstick(&self, addr: u32) {
        self.state.lock().unwrap().stuck.remove(&addr);
    }

    pub fn read_count(&self) -> u64 {
        self.state.lock().unwrap().reads
    }

    pub fn reset_reads(&self) {
        self.state.lock().unwrap().reads = 0;
    }
}

impl RegisterIo for FakeRegisters {
    fn read_u32(&self, addr: u32) -> u32 {
        let mut s = self.state.lock().unwrap();
        s.reads += 1;
        s.regs.get(&addr).copied().unwrap_or(0)
    }

    fn write_u32(&self, addr: u32, value: u32) {
        let mut s = self.state.lock().unwrap();
        if s.stuck.contains(&addr) {
            return;
        }
        if s.w1c.contains(&addr) {
            let cur = s.regs.get(&addr).copied().unwrap_or(0);
            s.regs.insert(addr, cur & !value);
        } else {
            s.regs.insert(addr, value);
        }
    }
}

/// Panic payload carried out of [`FakeBoard::restart`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Restarted(pub ResetType);

/// Fake board. `restart` records the request and unwinds with a
/// [`Restarted`] payload; see [`catch_restart`].
pub struct FakeBoard {
    ram_top: AtomicU32,
    ram_queries: AtomicU32,
    partition: Option<String>,
    subtype: ResetSubtype,
    restarts: Mutex<Vec<ResetType>>,
}

impl FakeBoard {
    pub fn new(ram_top: u32) -> Self {
        Self {
            ram_top: AtomicU32::new(ram_top),
            ram_queries: AtomicU32::new(0),
            partition: None,
            subtype: ResetSubtype::PowerCycle,
            restarts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_partition(mut self, name: &str) -> Self {
        self.partition = Some(name.to_string());
        self
    }

    pub fn with_subtype(mut self, subtype: ResetSubtype) -> Self {
        self.subtype = subtype;
        self
    }

    pub fn set_ram_top(&self, top: u32) {
        self.ram_top.store(top, Ordering::Relaxed);
    }

    /// Number of times `physical_ram_top` has been called.
    pub fn ram_queries(&self) -> u32 {
        self.ram_queries.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> Vec<ResetType> {
        self.restarts.lock().unwrap().clone()
    }
}

impl Board for FakeBoard {
    fn restart(&self, reset_type: ResetType) -> ! {
        self.restarts.lock().unwrap().push(reset_type);
        std::panic::panic_any(Restarted(reset_type))
    }

    fn physical_ram_top(&self) -> u32 {
        self.ram_queries.fetch_add(1, Ordering::Relaxed);
        self.ram_top.load(Ordering::Relaxed)
    }

    fn active_boot_partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    fn reset_subtype(&self) -> ResetSubtype {
        self.subtype
    }
}

/// Runs `f`, returning the reset type if it ended in [`FakeBoard::restart`].
/// Any other panic is propagated.
pub fn catch_restart<F: FnOnce()>(f: F) -> Option<ResetType> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(()) => None,
        Err(payload) => match payload.downcast::<Restarted>() {
            Ok(r) => Some(r.0),
            Err(other) => std::panic::resume_unwind(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl TimerHook for Noop {
        fn expired(&self, _timer: TimerId) {}
    }

    #[test]
    fn timers_disarm_on_delete() {
        let os = FakeOs::new();
        let t = os.timer_create("t", &Noop).unwrap();
        os.timer_set(t, 100, 0).unwrap();
        assert_eq!(os.timer_armed(t), Some((100, 0)));
        os.timer_delete(t).unwrap();
        assert!(!os.fire_timer(t));
        assert_eq!(os.timer_delete(t), Err(OsError::InvalidId));
    }

    #[test]
    fn semaphore_times_out_when_empty() {
        let os = FakeOs::new();
        let sem = os.bin_sem_create("s", false).unwrap();
        assert_eq!(os.bin_sem_take(sem, Some(1)), Err(OsError::Timeout));
        os.bin_sem_give(sem).unwrap();
        assert_eq!(os.bin_sem_take(sem, Some(1)), Ok(()));
        assert!(!os.sem_full(sem));
    }

    #[test]
    fn w1c_and_stuck_registers() {
        let regs = FakeRegisters::new();
        regs.write_one_to_clear(0x10);
        regs.set(0x10, 0b111);
        regs.write_u32(0x10, 0b010);
        assert_eq!(regs.get(0x10), 0b101);

        regs.stick(0x20);
        regs.write_u32(0x20, 1);
        assert_eq!(regs.read_u32(0x20), 0);
    }

    #[test]
    fn restart_unwinds_with_reset_type() {
        let board = FakeBoard::new(0x1000);
        let r = catch_restart(|| board.restart(ResetType::PowerOn));
        assert_eq!(r, Some(ResetType::PowerOn));
        assert_eq!(board.restarts(), vec![ResetType::PowerOn]);
    }
}
