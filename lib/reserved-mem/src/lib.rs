// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reserved memory map.
//!
//! The board sets aside a fixed region of RAM that the kernel leaves alone
//! across a processor reset. At startup we carve it into a small boot record
//! followed by four named blocks:
//!
//! ```text
//!  base ->  +--------------------+
//!           | BootRecord         |
//!           +--------------------+
//!           | Reset              |
//!           +--------------------+
//!           | Cds                |
//!           +--------------------+
//!           | VolatileDisk       |
//!           +--------------------+
//!           | UserReserved       |
//!           +--------------------+
//! ```
//!
//! Every block starts on a word boundary. Block addresses and sizes are fixed
//! once [`ReservedMemoryMap::setup`] returns; block *contents* are written by
//! the rest of flight software and mirrored to flash by the sync task, which
//! uses the per-block dirty range kept here to skip blocks nobody touched.

#![cfg_attr(not(test), no_std)]

mod boot;

pub use boot::{BootRecord, BOOT_RECORD_MAGIC, BOOT_RECORD_VERSION};

use core::ops::Range;
use enum_map::{enum_map, Enum, EnumMap};
use num_derive::FromPrimitive;
use psp_config::RESERVED_MEM_ALIGN;
use psp_userlib::{psp_log, FromRaw, PspError, PspResult, ResetType};
use ringbuf::{ringbuf, ringbuf_entry};
use spin::Mutex;
use zerocopy::{FromBytes, IntoBytes};

const LOG_TAG: &str = "PSP RESERVED MEM";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Enum, FromPrimitive)]
#[repr(u32)]
pub enum MemBlockKind {
    Reset = 0,
    Cds = 1,
    VolatileDisk = 2,
    UserReserved = 3,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Setup { base: u32, total: usize },
    OverBudget { total: usize, budget: usize },
    RangeRejected(MemBlockKind, usize, usize),
    BootRecordInvalid,
    BootDetected(ResetType, u32),
    ResetRecorded(ResetType),
}

ringbuf!(Trace, 16, Trace::None);

/// Sizes and backing files for the four blocks.
#[derive(Clone, Debug)]
pub struct Layout {
    /// Upper bound on the sum of the (word-rounded) block sizes.
    pub budget: usize,
    pub sizes: EnumMap<MemBlockKind, usize>,
    pub backing_files: EnumMap<MemBlockKind, &'static str>,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            budget: psp_config::RESERVED_MEM_BUDGET,
            sizes: enum_map! {
                MemBlockKind::Reset => psp_config::RESET_AREA_SIZE,
                MemBlockKind::Cds => psp_config::CDS_SIZE,
                MemBlockKind::VolatileDisk => psp_config::VOLATILE_DISK_SIZE,
                MemBlockKind::UserReserved => psp_config::USER_RESERVED_SIZE,
            },
            backing_files: enum_map! {
                MemBlockKind::Reset => psp_config::RESET_BACKING_FILE,
                MemBlockKind::Cds => psp_config::CDS_BACKING_FILE,
                MemBlockKind::VolatileDisk =>
                    psp_config::VOLATILE_DISK_BACKING_FILE,
                MemBlockKind::UserReserved =>
                    psp_config::USER_RESERVED_BACKING_FILE,
            },
        }
    }
}

/// Where one block lives. Fixed for the life of a boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryBlock {
    pub kind: MemBlockKind,
    pub base_address: u32,
    pub size: usize,
    pub backing_file: &'static str,
}

struct BlockState {
    data: &'static mut [u8],
    /// Bytes changed since the sync task last took the range.
    dirty: Option<Range<usize>>,
}

struct Block {
    info: MemoryBlock,
    state: Mutex<BlockState>,
}

pub struct ReservedMemoryMap {
    boot: Mutex<&'static mut [u8]>,
    blocks: EnumMap<MemBlockKind, Block>,
}

const fn align_up(n: usize) -> usize {
    (n + RESERVED_MEM_ALIGN - 1) & !(RESERVED_MEM_ALIGN - 1)
}

const BOOT_RECORD_SPAN: usize = align_up(core::mem::size_of::<BootRecord>());

fn merge(a: Option<Range<usize>>, b: Range<usize>) -> Option<Range<usize>> {
    if b.is_empty() {
        return a;
    }
    Some(match a {
        Some(a) => a.start.min(b.start)..a.end.max(b.end),
        None => b,
    })
}

impl ReservedMemoryMap {
    /// Carves `region`, which the board maps at `base_address`, into the
    /// boot record and the blocks described by `layout`.
    ///
    /// Every block starts out dirty, so the first sync pass after boot looks
    /// at all of it.
    pub fn setup(
        region: &'static mut [u8],
        base_address: u32,
        layout: &Layout,
    ) -> PspResult<Self> {
        if base_address as usize % RESERVED_MEM_ALIGN != 0 {
            psp_log!(LOG_TAG, "base {:#x} is not word aligned", base_address);
            return Err(PspError::ErrorAddressMisaligned);
        }

        let mut total = 0usize;
        for (_, &size) in &layout.sizes {
            total = size
                .checked_add(RESERVED_MEM_ALIGN - 1)
                .map(|n| n & !(RESERVED_MEM_ALIGN - 1))
                .and_then(|n| total.checked_add(n))
                .ok_or(PspError::InvalidMemSize)?;
        }
        if total > layout.budget {
            ringbuf_entry!(Trace::OverBudget {
                total,
                budget: layout.budget
            });
            psp_log!(
                LOG_TAG,
                "blocks need {:#x} bytes, budget is {:#x}",
                total,
                layout.budget
            );
            return Err(PspError::InvalidMemSize);
        }
        let span = BOOT_RECORD_SPAN + total;
        if span > region.len() {
            psp_log!(
                LOG_TAG,
                "region of {:#x} bytes cannot hold {:#x}",
                region.len(),
                span
            );
            return Err(PspError::InvalidMemSize);
        }
        u32::try_from(span)
            .ok()
            .and_then(|s| base_address.checked_add(s))
            .ok_or(PspError::InvalidMemAddr)?;

        let (boot, mut rest) = region.split_at_mut(BOOT_RECORD_SPAN);
        let mut offset = BOOT_RECORD_SPAN;
        let blocks = EnumMap::from_fn(|kind| {
            let size = layout.sizes[kind];
            let (data, tail) =
                core::mem::take(&mut rest).split_at_mut(align_up(size));
            rest = tail;
            let info = MemoryBlock {
                kind,
                // Checked against u32 overflow above.
                base_address: base_address + offset as u32,
                size,
                backing_file: layout.backing_files[kind],
            };
            offset += align_up(size);
            Block {
                info,
                state: Mutex::new(BlockState {
                    data: data.split_at_mut(size).0,
                    dirty: merge(None, 0..size),
                }),
            }
        });

        ringbuf_entry!(Trace::Setup {
            base: base_address,
            total
        });
        Ok(Self {
            boot: Mutex::new(boot),
            blocks,
        })
    }

    pub fn block(&self, kind: MemBlockKind) -> &MemoryBlock {
        &self.blocks[kind].info
    }

    /// Looks a block up by its raw id, as the middleware names them.
    pub fn block_by_id(&self, id: u32) -> PspResult<&MemoryBlock> {
        MemBlockKind::from_u32(id)
            .map(|k| self.block(k))
            .ok_or(PspError::InvalidMemType)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &MemoryBlock> + '_ {
        self.blocks.values().map(|b| &b.info)
    }

    fn checked_range(
        &self,
        kind: MemBlockKind,
        offset: usize,
        len: usize,
    ) -> PspResult<Range<usize>> {
        let size = self.blocks[kind].info.size;
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(offset..end),
            _ => {
                ringbuf_entry!(Trace::RangeRejected(kind, offset, len));
                Err(PspError::InvalidMemRange)
            }
        }
    }

    /// Copies `buf.len()` bytes out of `kind` starting at `offset`.
    pub fn read(
        &self,
        kind: MemBlockKind,
        offset: usize,
        buf: &mut [u8],
    ) -> PspResult<()> {
        let r = self.checked_range(kind, offset, buf.len())?;
        let st = self.blocks[kind].state.lock();
        buf.copy_from_slice(&st.data[r]);
        Ok(())
    }

    /// Copies `data` into `kind` at `offset`. A range that does not fit is
    /// rejected before anything is written.
    pub fn write(
        &self,
        kind: MemBlockKind,
        offset: usize,
        data: &[u8],
    ) -> PspResult<()> {
        let r = self.checked_range(kind, offset, data.len())?;
        let mut st = self.blocks[kind].state.lock();
        st.data[r.clone()].copy_from_slice(data);
        st.dirty = merge(st.dirty.take(), r);
        Ok(())
    }

    /// Runs `f` over the block contents without marking anything dirty.
    pub fn with_block<R>(
        &self,
        kind: MemBlockKind,
        f: impl FnOnce(&[u8]) -> R,
    ) -> R {
        let st = self.blocks[kind].state.lock();
        f(&*st.data)
    }

    /// Runs `f` with the whole block writable. The whole block is marked
    /// dirty.
    pub fn with_block_mut<R>(
        &self,
        kind: MemBlockKind,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        let mut st = self.blocks[kind].state.lock();
        let size = st.data.len();
        st.dirty = merge(st.dirty.take(), 0..size);
        f(&mut *st.data)
    }

    /// Returns and clears the dirty range of `kind`.
    pub fn take_dirty(&self, kind: MemBlockKind) -> Option<Range<usize>> {
        self.blocks[kind].state.lock().dirty.take()
    }

    /// Puts back a range taken with [`Self::take_dirty`] that could not be
    /// dealt with, merging it with anything dirtied in the meantime.
    pub fn restore_dirty(&self, kind: MemBlockKind, range: Range<usize>) {
        let mut st = self.blocks[kind].state.lock();
        st.dirty = merge(st.dirty.take(), range);
    }

    pub fn is_dirty(&self, kind: MemBlockKind) -> bool {
        self.blocks[kind].state.lock().dirty.is_some()
    }

    pub fn mark_all_dirty(&self) {
        for (_, b) in &self.blocks {
            let mut st = b.state.lock();
            let size = st.data.len();
            st.dirty = merge(None, 0..size);
        }
    }

    pub fn get_cds_size(&self) -> usize {
        self.block(MemBlockKind::Cds).size
    }

    pub fn write_to_cds(&self, data: &[u8], offset: usize) -> PspResult<()> {
        self.write(MemBlockKind::Cds, offset, data)
    }

    pub fn read_from_cds(
        &self,
        buf: &mut [u8],
        offset: usize,
    ) -> PspResult<()> {
        self.read(MemBlockKind::Cds, offset, buf)
    }

    pub fn get_reset_area(&self) -> &MemoryBlock {
        self.block(MemBlockKind::Reset)
    }

    pub fn get_volatile_disk_mem(&self) -> &MemoryBlock {
        self.block(MemBlockKind::VolatileDisk)
    }

    pub fn get_user_reserved_area(&self) -> &MemoryBlock {
        self.block(MemBlockKind::UserReserved)
    }

    /// Current boot record, if the one in memory checks out.
    pub fn boot_record(&self) -> Option<BootRecord> {
        let bytes = self.boot.lock();
        BootRecord::read_from_prefix(&bytes[..])
            .ok()
            .map(|(rec, _)| rec)
            .filter(BootRecord::is_valid)
    }

    fn store_boot_record(&self, rec: &BootRecord) {
        let mut bytes = self.boot.lock();
        // The slot was sized for a BootRecord in `setup`.
        let _ = rec.write_to_prefix(&mut bytes[..]);
    }

    /// Notes the reset type we are about to restart with, so the next boot
    /// knows whether to trust reserved memory.
    pub fn record_reset(&self, reset_type: ResetType) {
        let mut rec = self.boot_record().unwrap_or_else(|| {
            BootRecord::new(None, ResetType::PowerOn, 0)
        });
        rec.next_reset_type = reset_type as u32;
        rec.seal();
        self.store_boot_record(&rec);
        ringbuf_entry!(Trace::ResetRecorded(reset_type));
    }

    /// Works out what kind of reset we came up from, and readies the boot
    /// record for this boot.
    ///
    /// Only a valid record asking for a processor reset yields
    /// [`ResetType::Processor`]. Anything else, including a record that did
    /// not survive, is a power-on reset, and the record is started over.
    pub fn detect_reset_type(&self) -> ResetType {
        let (reset_type, boot_count) = match self.boot_record() {
            Some(rec) => {
                let t = match rec.next_reset() {
                    Some(ResetType::Processor) => ResetType::Processor,
                    _ => ResetType::PowerOn,
                };
                (t, rec.boot_count.wrapping_add(1))
            }
            None => {
                ringbuf_entry!(Trace::BootRecordInvalid);
                psp_log!(LOG_TAG, "boot record invalid, reinitializing");
                (ResetType::PowerOn, 1)
            }
        };
        self.store_boot_record(&BootRecord::new(None, reset_type, boot_count));
        ringbuf_entry!(Trace::BootDetected(reset_type, boot_count));
        reset_type
    }
}
