// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::policy::Counters;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const STARTUP_RECORD_MAGIC: u32 = 0x5354_5254;
pub const STARTUP_RECORD_VERSION: u32 = 1;

/// Contents of the failed-startup tracking file.
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
pub struct StartupRecord {
    /// Must always be `STARTUP_RECORD_MAGIC`.
    magic: u32,

    /// Must always be `STARTUP_RECORD_VERSION` (for now)
    version: u32,

    pub failed_attempts: u32,
    pub failed_reset_attempts: u32,

    /// CRC-32 over the rest of the data using the iSCSI polynomial
    checksum: u32,
}

impl StartupRecord {
    pub fn new(c: Counters) -> Self {
        let mut out = Self {
            magic: STARTUP_RECORD_MAGIC,
            version: STARTUP_RECORD_VERSION,
            failed_attempts: c.failed_attempts,
            failed_reset_attempts: c.failed_reset_attempts,
            checksum: 0,
        };
        out.checksum = out.expected_checksum();
        out
    }

    fn expected_checksum(&self) -> u32 {
        static CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);
        let mut c = CRC.digest();
        let size = core::mem::size_of::<StartupRecord>()
            - core::mem::size_of::<u32>();
        c.update(&self.as_bytes()[..size]);
        c.finalize()
    }

    pub fn is_valid(&self) -> bool {
        self.magic == STARTUP_RECORD_MAGIC
            && self.version == STARTUP_RECORD_VERSION
            && self.checksum == self.expected_checksum()
    }

    /// Decodes a file image, which must be exactly one valid record.
    pub fn parse(bytes: &[u8]) -> Option<Counters> {
        let rec = Self::read_from_bytes(bytes).ok()?;
        rec.is_valid().then_some(Counters {
            failed_attempts: rec.failed_attempts,
            failed_reset_attempts: rec.failed_reset_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_only_whole_valid_records() {
        let c = Counters {
            failed_attempts: 2,
            failed_reset_attempts: 1,
        };
        let rec = StartupRecord::new(c);
        assert_eq!(StartupRecord::parse(rec.as_bytes()), Some(c));

        let bytes = rec.as_bytes();
        assert_eq!(StartupRecord::parse(&bytes[..bytes.len() - 1]), None);

        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(StartupRecord::parse(&long), None);

        let mut bad = bytes.to_vec();
        bad[8] ^= 0x80;
        assert_eq!(StartupRecord::parse(&bad), None);

        assert_eq!(StartupRecord::parse(&[0u8; 20]), None);
    }
}
