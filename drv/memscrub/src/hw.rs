// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory controller registers used by the scrubber.

use bitflags::bitflags;
use psp_userlib::RegisterIo;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ScrubCtrl: u32 {
        /// ECC checking and correction on reads
        const ENABLE = 1 << 0;
        /// Write corrected data back on a single-bit error
        const CORRECT_ON_READ = 1 << 1;
    }
}

bitflags! {
    /// Sticky error flags; write one to clear.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct EccStatus: u32 {
        /// Single-bit error seen and corrected
        const SBE = 1 << 0;
        /// Multi-bit error seen; data was not correctable
        const MBE = 1 << 1;
        /// More errors arrived than the count register could hold
        const OVERFLOW = 1 << 2;
    }
}

/// How many times the control register is re-read waiting for a toggle to
/// take effect.
pub const CTRL_POLL_LIMIT: usize = 8;

/// Addresses of the scrubber's registers.
#[derive(Copy, Clone, Debug)]
pub struct ScrubRegs {
    pub ctrl: u32,
    pub ecc_status: u32,
    pub ecc_count: u32,
}

/// Errors harvested after a block was read.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EccHarvest {
    pub correctable: u32,
    pub uncorrectable: u32,
}

impl ScrubRegs {
    pub fn ctrl(&self, io: &dyn RegisterIo) -> ScrubCtrl {
        ScrubCtrl::from_bits_retain(io.read_u32(self.ctrl))
    }

    /// Sets or clears ENABLE, then polls until the hardware reflects it.
    /// Returns false if it never does.
    pub fn set_enable(&self, io: &dyn RegisterIo, on: bool) -> bool {
        let mut want = self.ctrl(io) | ScrubCtrl::CORRECT_ON_READ;
        want.set(ScrubCtrl::ENABLE, on);
        io.write_u32(self.ctrl, want.bits());
        (0..CTRL_POLL_LIMIT)
            .any(|_| self.ctrl(io).contains(ScrubCtrl::ENABLE) == on)
    }

    /// Reads and clears the ECC status and count registers.
    pub fn harvest(&self, io: &dyn RegisterIo) -> EccHarvest {
        let status = EccStatus::from_bits_retain(io.read_u32(self.ecc_status));
        if status.is_empty() {
            return EccHarvest::default();
        }
        let count = io.read_u32(self.ecc_count);
        io.write_u32(self.ecc_status, status.bits());
        io.write_u32(self.ecc_count, 0);

        EccHarvest {
            // The counter only tracks corrected errors; a set flag with a
            // zero count still means at least one happened.
            correctable: if status.contains(EccStatus::SBE) {
                count.max(1)
            } else {
                0
            },
            uncorrectable: u32::from(status.contains(EccStatus::MBE)),
        }
    }
}
