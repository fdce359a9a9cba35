// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use psp_abi::ScrubRunMode;
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;

const DEFAULT_BOARD: &str = "sp0";

fn main() -> Result<()> {
    let board =
        std::env::var("PSP_BOARD").unwrap_or_else(|_| DEFAULT_BOARD.into());
    println!("cargo:rerun-if-env-changed=PSP_BOARD");

    let manifest = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR")?);
    let path = manifest
        .join("../../app")
        .join(&board)
        .join("psp.toml");
    println!("cargo:rerun-if-changed={}", path.display());

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let cfg: Config = toml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    cfg.check()?;

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    let dest_path = out_dir.join("psp_config.rs");
    let mut out = std::fs::File::create(&dest_path)
        .context("creating psp_config.rs")?;
    cfg.emit(&mut out)?;

    Ok(())
}

/// Board-level PSP configuration, one file per board under `app/`.
#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Config {
    name: String,
    reserved_memory: ReservedMemory,
    memsync: MemSync,
    memscrub: MemScrub,
    watchdog: Watchdog,
    startup: Startup,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ReservedMemory {
    budget: u32,
    reset_size: u32,
    cds_size: u32,
    volatile_disk_size: u32,
    user_reserved_size: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct MemSync {
    task_name: String,
    sem_name: String,
    default_frequency_ms: u32,
    default_priority: u8,
    priority_range: [u8; 2],
    start_on_startup: bool,
    chunk_size: u32,
    backing_files: BackingFiles,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct BackingFiles {
    reset: String,
    cds: String,
    volatile_disk: String,
    user_reserved: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct MemScrub {
    task_name: String,
    sem_name: String,
    default_priority: u8,
    priority_range: [u8; 2],
    block_size: u32,
    task_delay_ms: u32,
    start_addr: u32,
    end_addr: u32,
    run_mode: ScrubRunMode,
    start_on_startup: bool,
    ctrl_register: u32,
    ecc_status_register: u32,
    ecc_count_register: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Watchdog {
    default_timeout_ms: u32,
    ctrl_register: u32,
    timeout_register: u32,
    service_register: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Startup {
    max_processor_resets: u32,
    max_poweron_resets: u32,
    max_wait_sec: u32,
    failed_startup_filename: String,
    filename_max_len: usize,
    default_partition: String,
    timer_name: String,
}

impl Config {
    /// Rejects configurations the PSP can't run with. The same bounds are
    /// asserted again in `lib.rs` so a hand-edited `psp_config.rs` can't
    /// sneak past.
    fn check(&self) -> Result<()> {
        let r = &self.reserved_memory;
        let total = [
            r.reset_size,
            r.cds_size,
            r.volatile_disk_size,
            r.user_reserved_size,
        ]
        .iter()
        .try_fold(0u32, |acc, s| acc.checked_add(*s));
        match total {
            Some(t) if t <= r.budget => (),
            _ => bail!("{}: reserved blocks exceed budget", self.name),
        }

        let [lo, hi] = self.memsync.priority_range;
        if !(lo..=hi).contains(&self.memsync.default_priority) {
            bail!("memsync default priority outside {}..={}", lo, hi);
        }
        if self.memsync.default_frequency_ms == 0 {
            bail!("memsync frequency must be nonzero");
        }

        let s = &self.memscrub;
        let [lo, hi] = s.priority_range;
        if !(lo..=hi).contains(&s.default_priority) {
            bail!("memscrub default priority outside {}..={}", lo, hi);
        }
        if s.start_addr >= s.end_addr {
            bail!(
                "memscrub range {:#x}..{:#x} is empty",
                s.start_addr,
                s.end_addr
            );
        }
        if s.start_addr % 4 != 0 || s.end_addr % 4 != 0 {
            bail!(
                "memscrub range {:#x}..{:#x} is not word aligned",
                s.start_addr,
                s.end_addr
            );
        }
        if s.block_size == 0 || s.block_size % 4 != 0 {
            bail!("memscrub block size must be a nonzero word multiple");
        }
        if s.task_delay_ms == 0 {
            bail!("memscrub task delay must be nonzero");
        }

        let w = &self.watchdog;
        if !(1..=60_000).contains(&w.default_timeout_ms) {
            bail!("watchdog timeout {} ms out of range", w.default_timeout_ms);
        }

        let st = &self.startup;
        if st.max_processor_resets < 1 || st.max_poweron_resets < 1 {
            bail!("startup reset caps must be at least 1");
        }
        if st.failed_startup_filename.len() > st.filename_max_len {
            bail!("failed-startup filename too long");
        }
        Ok(())
    }

    fn emit(&self, out: &mut impl Write) -> Result<()> {
        writeln!(out, "pub const BOARD_NAME: &str = {:?};", self.name)?;

        let r = &self.reserved_memory;
        writeln!(
            out,
            "pub const RESERVED_MEM_BUDGET: usize = {:#x};",
            r.budget
        )?;
        writeln!(
            out,
            "pub const RESET_AREA_SIZE: usize = {:#x};",
            r.reset_size
        )?;
        writeln!(out, "pub const CDS_SIZE: usize = {:#x};", r.cds_size)?;
        writeln!(
            out,
            "pub const VOLATILE_DISK_SIZE: usize = {:#x};",
            r.volatile_disk_size
        )?;
        writeln!(
            out,
            "pub const USER_RESERVED_SIZE: usize = {:#x};",
            r.user_reserved_size
        )?;

        let m = &self.memsync;
        writeln!(
            out,
            "pub const MEMSYNC_TASK_NAME: &str = {:?};",
            m.task_name
        )?;
        writeln!(out, "pub const MEMSYNC_SEM_NAME: &str = {:?};", m.sem_name)?;
        writeln!(
            out,
            "pub const MEMSYNC_DEFAULT_FREQUENCY_MS: u32 = {};",
            m.default_frequency_ms
        )?;
        writeln!(
            out,
            "pub const MEMSYNC_DEFAULT_PRIORITY: Priority = {};",
            m.default_priority
        )?;
        writeln!(
            out,
            "pub const MEMSYNC_PRIORITY_LOW: Priority = {};",
            m.priority_range[0]
        )?;
        writeln!(
            out,
            "pub const MEMSYNC_PRIORITY_HIGH: Priority = {};",
            m.priority_range[1]
        )?;
        writeln!(
            out,
            "pub const MEMSYNC_START_ON_STARTUP: bool = {};",
            m.start_on_startup
        )?;
        writeln!(
            out,
            "pub const MEMSYNC_CHUNK_SIZE: usize = {};",
            m.chunk_size
        )?;
        let f = &m.backing_files;
        writeln!(out, "pub const RESET_BACKING_FILE: &str = {:?};", f.reset)?;
        writeln!(out, "pub const CDS_BACKING_FILE: &str = {:?};", f.cds)?;
        writeln!(
            out,
            "pub const VOLATILE_DISK_BACKING_FILE: &str = {:?};",
            f.volatile_disk
        )?;
        writeln!(
            out,
            "pub const USER_RESERVED_BACKING_FILE: &str = {:?};",
            f.user_reserved
        )?;

        let s = &self.memscrub;
        writeln!(
            out,
            "pub const MEMSCRUB_TASK_NAME: &str = {:?};",
            s.task_name
        )?;
        writeln!(out, "pub const MEMSCRUB_SEM_NAME: &str = {:?};", s.sem_name)?;
        writeln!(
            out,
            "pub const MEMSCRUB_DEFAULT_PRIORITY: Priority = {};",
            s.default_priority
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_PRIORITY_LOW: Priority = {};",
            s.priority_range[0]
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_PRIORITY_HIGH: Priority = {};",
            s.priority_range[1]
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_BLOCK_SIZE: u32 = {:#x};",
            s.block_size
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_TASK_DELAY_MS: u32 = {};",
            s.task_delay_ms
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_DEFAULT_START_ADDR: u32 = {:#x};",
            s.start_addr
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_DEFAULT_END_ADDR: u32 = {:#x};",
            s.end_addr
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_DEFAULT_RUN_MODE: ScrubRunMode =\n    \
             ScrubRunMode::{:?};",
            s.run_mode
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_START_ON_STARTUP: bool = {};",
            s.start_on_startup
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_CTRL_REGISTER: u32 = {:#x};",
            s.ctrl_register
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_ECC_STATUS_REGISTER: u32 = {:#x};",
            s.ecc_status_register
        )?;
        writeln!(
            out,
            "pub const MEMSCRUB_ECC_COUNT_REGISTER: u32 = {:#x};",
            s.ecc_count_register
        )?;

        let w = &self.watchdog;
        writeln!(
            out,
            "pub const WATCHDOG_DEFAULT_TIMEOUT_MS: u32 = {};",
            w.default_timeout_ms
        )?;
        writeln!(
            out,
            "pub const WATCHDOG_CTRL_REGISTER: u32 = {:#x};",
            w.ctrl_register
        )?;
        writeln!(
            out,
            "pub const WATCHDOG_TIMEOUT_REGISTER: u32 = {:#x};",
            w.timeout_register
        )?;
        writeln!(
            out,
            "pub const WATCHDOG_SERVICE_REGISTER: u32 = {:#x};",
            w.service_register
        )?;

        let st = &self.startup;
        writeln!(
            out,
            "pub const STARTUP_MAX_PROCESSOR_RESETS: u32 = {};",
            st.max_processor_resets
        )?;
        writeln!(
            out,
            "pub const STARTUP_MAX_POWERON_RESETS: u32 = {};",
            st.max_poweron_resets
        )?;
        writeln!(
            out,
            "pub const STARTUP_MAX_WAIT_SEC: u32 = {};",
            st.max_wait_sec
        )?;
        writeln!(
            out,
            "pub const FAILED_STARTUP_FILENAME: &str = {:?};",
            st.failed_startup_filename
        )?;
        writeln!(
            out,
            "pub const FAILED_STARTUP_FILENAME_MAX_LEN: usize = {};",
            st.filename_max_len
        )?;
        writeln!(
            out,
            "pub const DEFAULT_CFS_PARTITION: &str = {:?};",
            st.default_partition
        )?;
        writeln!(
            out,
            "pub const STARTUP_TIMER_NAME: &str = {:?};",
            st.timer_name
        )?;

        Ok(())
    }
}
