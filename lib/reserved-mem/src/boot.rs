// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use psp_userlib::{FromRaw, ResetType};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const BOOT_RECORD_MAGIC: u32 = 0x5053_5042;
pub const BOOT_RECORD_VERSION: u32 = 1;

/// Record kept at the head of reserved memory.
///
/// Reserved memory survives a processor reset but not a power cycle, so a
/// record with a good checksum on the way up means RAM was preserved. Before
/// a commanded restart, the PSP writes the reset type it is about to issue
/// into `next_reset_type`; the next boot reads it back to decide whether the
/// contents of the other blocks can be trusted.
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
pub struct BootRecord {
    /// Must always be `BOOT_RECORD_MAGIC`.
    magic: u32,

    /// Must always be `BOOT_RECORD_VERSION` (for now)
    version: u32,

    /// Raw [`ResetType`] requested for the next restart, or 0 if none.
    pub next_reset_type: u32,

    /// Raw [`ResetType`] of the reset we came up from.
    pub last_reset_type: u32,

    /// Boots since reserved memory was last initialized.
    pub boot_count: u32,

    /// CRC-32 over the rest of the data using the iSCSI polynomial
    checksum: u32,
}

impl BootRecord {
    pub fn new(
        next_reset_type: Option<ResetType>,
        last_reset_type: ResetType,
        boot_count: u32,
    ) -> Self {
        let mut out = Self {
            magic: BOOT_RECORD_MAGIC,
            version: BOOT_RECORD_VERSION,
            next_reset_type: next_reset_type.map(|t| t as u32).unwrap_or(0),
            last_reset_type: last_reset_type as u32,
            boot_count,
            checksum: 0,
        };
        out.seal();
        out
    }

    /// Recomputes the checksum after a field was changed.
    pub fn seal(&mut self) {
        self.checksum = self.expected_checksum();
    }

    fn expected_checksum(&self) -> u32 {
        static CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);
        let mut c = CRC.digest();
        // Everything except the trailing checksum word.
        let size = core::mem::size_of::<BootRecord>()
            - core::mem::size_of::<u32>();
        c.update(&self.as_bytes()[..size]);
        c.finalize()
    }

    pub fn is_valid(&self) -> bool {
        self.magic == BOOT_RECORD_MAGIC
            && self.version == BOOT_RECORD_VERSION
            && self.checksum == self.expected_checksum()
    }

    pub fn next_reset(&self) -> Option<ResetType> {
        ResetType::from_u32(self.next_reset_type)
    }

    pub fn last_reset(&self) -> Option<ResetType> {
        ResetType::from_u32(self.last_reset_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    #[test]
    fn any_flipped_bit_invalidates() {
        let rec =
            BootRecord::new(Some(ResetType::Processor), ResetType::PowerOn, 4);
        assert!(rec.is_valid());
        let bytes = rec.as_bytes();
        for i in 0..bytes.len() * 8 {
            let mut b = [0u8; core::mem::size_of::<BootRecord>()];
            b.copy_from_slice(bytes);
            b[i / 8] ^= 1 << (i % 8);
            let r = BootRecord::read_from_bytes(&b[..]).unwrap();
            assert!(!r.is_valid(), "bit {i} flipped but record still valid");
        }
    }

    #[test]
    fn zeroed_memory_is_not_a_record() {
        let r = BootRecord::new_zeroed();
        assert!(!r.is_valid());
        assert_eq!(r.next_reset(), None);
    }
}
