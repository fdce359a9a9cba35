// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-mapped register access for the real board.

use crate::RegisterIo;

/// Volatile access to the physical address space.
pub struct Mmio {
    _private: (),
}

impl Mmio {
    /// # Safety
    ///
    /// Every address later handed to `read_u32`/`write_u32` must be a
    /// word-aligned device register or RAM word that is mapped in the calling
    /// context, and writes must not alias memory the program owns.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl RegisterIo for Mmio {
    fn read_u32(&self, addr: u32) -> u32 {
        // Safety: upheld by the contract on `Mmio::new`.
        unsafe { core::ptr::read_volatile(addr as usize as *const u32) }
    }

    fn write_u32(&self, addr: u32, value: u32) {
        // Safety: upheld by the contract on `Mmio::new`.
        unsafe {
            core::ptr::write_volatile(addr as usize as *mut u32, value)
        }
    }
}
