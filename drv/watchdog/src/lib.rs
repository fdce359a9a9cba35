// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the board's FPGA watchdog.
//!
//! The FPGA exposes three registers: a control register whose low bit turns
//! the watchdog on, a timeout register holding the expiry period in
//! milliseconds, and a service register that restarts the countdown when the
//! magic key is written to it.
//!
//! Enabling and disabling are verified by reading the control register back;
//! the cached state used by [`Watchdog::status`] only changes once the
//! hardware agrees. The same goes for the timeout: a value the FPGA does not
//! latch is dropped and the previous timeout stays in force.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use psp_config::{WATCHDOG_MAX_TIMEOUT_MS, WATCHDOG_MIN_TIMEOUT_MS};
use psp_userlib::{psp_log, PspError, PspResult, RegisterIo};
use ringbuf::{ringbuf, ringbuf_entry};

const LOG_TAG: &str = "PSP WATCHDOG";

/// Value written to the service register to restart the countdown.
pub const SERVICE_KEY: u32 = 0x0000_a5a5;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Ctrl: u32 {
        /// Watchdog counting down
        const ENABLE = 1 << 0;
        /// Reset the board, rather than raise an interrupt, on expiry
        const RESET_ON_EXPIRY = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Enabled,
    Disabled,
    CtrlNotLatched { wanted: u32, got: u32 },
    TimeoutSet(u32),
    TimeoutOutOfRange(u32),
    TimeoutNotLatched { wanted: u32, got: u32 },
}

ringbuf!(Trace, 16, Trace::None);

#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub ctrl_register: u32,
    pub timeout_register: u32,
    pub service_register: u32,
    pub default_timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ctrl_register: psp_config::WATCHDOG_CTRL_REGISTER,
            timeout_register: psp_config::WATCHDOG_TIMEOUT_REGISTER,
            service_register: psp_config::WATCHDOG_SERVICE_REGISTER,
            default_timeout_ms: psp_config::WATCHDOG_DEFAULT_TIMEOUT_MS,
        }
    }
}

pub struct Watchdog {
    regs: &'static dyn RegisterIo,
    config: Config,
    enabled: AtomicBool,
    timeout_ms: AtomicU32,
}

impl Watchdog {
    pub fn new(regs: &'static dyn RegisterIo, config: Config) -> Self {
        Self {
            regs,
            config,
            enabled: AtomicBool::new(false),
            timeout_ms: AtomicU32::new(0),
        }
    }

    fn ctrl(&self) -> Ctrl {
        Ctrl::from_bits_retain(self.regs.read_u32(self.config.ctrl_register))
    }

    /// Programs the default timeout and picks up whether the watchdog is
    /// already running (it may have been left on by the boot loader).
    pub fn init(&self) {
        self.set(self.config.default_timeout_ms);
        let on = self.ctrl().contains(Ctrl::ENABLE);
        self.enabled.store(on, Ordering::Relaxed);
    }

    fn toggle(&self, on: bool) -> PspResult<()> {
        let mut want = self.ctrl() | Ctrl::RESET_ON_EXPIRY;
        want.set(Ctrl::ENABLE, on);
        self.regs.write_u32(self.config.ctrl_register, want.bits());

        let got = self.ctrl();
        if got.contains(Ctrl::ENABLE) != on {
            ringbuf_entry!(Trace::CtrlNotLatched {
                wanted: want.bits(),
                got: got.bits()
            });
            psp_log!(
                LOG_TAG,
                "control register reads {:#x} after writing {:#x}",
                got.bits(),
                want.bits()
            );
            return Err(PspError::Error);
        }
        self.enabled.store(on, Ordering::Relaxed);
        ringbuf_entry!(if on { Trace::Enabled } else { Trace::Disabled });
        Ok(())
    }

    pub fn enable(&self) -> PspResult<()> {
        self.toggle(true)
    }

    pub fn disable(&self) -> PspResult<()> {
        self.toggle(false)
    }

    /// Restarts the countdown. Every supervised task must call this more
    /// often than the configured timeout.
    pub fn service(&self) {
        self.regs.write_u32(self.config.service_register, SERVICE_KEY);
    }

    /// Timeout currently in force, in milliseconds.
    pub fn get(&self) -> u32 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    /// Sets the timeout. Values outside the range the FPGA supports, or
    /// that it fails to latch, are dropped.
    pub fn set(&self, timeout_ms: u32) {
        if !(WATCHDOG_MIN_TIMEOUT_MS..=WATCHDOG_MAX_TIMEOUT_MS)
            .contains(&timeout_ms)
        {
            ringbuf_entry!(Trace::TimeoutOutOfRange(timeout_ms));
            psp_log!(LOG_TAG, "timeout {} ms out of range", timeout_ms);
            return;
        }
        self.regs.write_u32(self.config.timeout_register, timeout_ms);
        let got = self.regs.read_u32(self.config.timeout_register);
        if got != timeout_ms {
            ringbuf_entry!(Trace::TimeoutNotLatched {
                wanted: timeout_ms,
                got
            });
            // Put back whatever was in force, if anything was.
            let prev = self.get();
            if prev != 0 {
                self.regs.write_u32(self.config.timeout_register, prev);
            }
            return;
        }
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
        ringbuf_entry!(Trace::TimeoutSet(timeout_ms));
    }

    /// Cached enable state; not a fresh read of the hardware.
    pub fn status(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psp_userlib::fakes::{leak, FakeRegisters};

    const CTRL: u32 = 0x100;
    const TIMEOUT: u32 = 0x104;
    const SERVICE: u32 = 0x108;

    fn setup() -> (&'static FakeRegisters, Watchdog) {
        let regs = leak(FakeRegisters::new());
        let wd = Watchdog::new(
            regs,
            Config {
                ctrl_register: CTRL,
                timeout_register: TIMEOUT,
                service_register: SERVICE,
                default_timeout_ms: 20_000,
            },
        );
        wd.init();
        (regs, wd)
    }

    #[test]
    fn init_programs_default() {
        let (regs, wd) = setup();
        assert_eq!(wd.get(), 20_000);
        assert_eq!(regs.get(TIMEOUT), 20_000);
        assert!(!wd.status());
    }

    #[test]
    fn init_picks_up_running_watchdog() {
        let regs = leak(FakeRegisters::new());
        regs.set(CTRL, Ctrl::ENABLE.bits());
        let wd = Watchdog::new(
            regs,
            Config {
                ctrl_register: CTRL,
                timeout_register: TIMEOUT,
                service_register: SERVICE,
                default_timeout_ms: 1000,
            },
        );
        wd.init();
        assert!(wd.status());
    }

    #[test]
    fn enable_disable_confirmed() {
        let (regs, wd) = setup();
        wd.enable().unwrap();
        assert!(wd.status());
        assert!(Ctrl::from_bits_retain(regs.get(CTRL)).contains(Ctrl::ENABLE));
        wd.disable().unwrap();
        assert!(!wd.status());
        assert!(!Ctrl::from_bits_retain(regs.get(CTRL)).contains(Ctrl::ENABLE));
    }

    #[test]
    fn unlatched_enable_leaves_status() {
        let (regs, wd) = setup();
        regs.stick(CTRL);
        assert_eq!(wd.enable(), Err(PspError::Error));
        assert!(!wd.status());

        regs.unstick(CTRL);
        wd.enable().unwrap();
        regs.stick(CTRL);
        assert_eq!(wd.disable(), Err(PspError::Error));
        assert!(wd.status());
    }

    #[test]
    fn set_bounds() {
        let (_, wd) = setup();
        wd.set(0);
        assert_eq!(wd.get(), 20_000);
        wd.set(60_001);
        assert_eq!(wd.get(), 20_000);
        wd.set(1);
        assert_eq!(wd.get(), 1);
        wd.set(60_000);
        assert_eq!(wd.get(), 60_000);
    }

    #[test]
    fn set_rejected_by_hardware_keeps_old_value() {
        let (regs, wd) = setup();
        regs.stick(TIMEOUT);
        wd.set(5000);
        assert_eq!(wd.get(), 20_000);
        assert_eq!(regs.get(TIMEOUT), 20_000);
    }

    #[test]
    fn service_writes_key() {
        let (regs, wd) = setup();
        wd.service();
        assert_eq!(regs.get(SERVICE), SERVICE_KEY);
    }
}
