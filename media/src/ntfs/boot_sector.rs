// NTFS boot sector parsing

use super::NTFS_OEM_ID;
use byteorder::{ByteOrder, LittleEndian};
use winstick_core::{Result, WinstickError};

/// The boot sector fields the reader needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    /// Sectors in the volume, not counting the backup boot sector.
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_record_size: u32,
    pub volume_serial: u64,
}

impl NtfsBootSector {
    /// Whether `sector` looks like an NTFS boot sector at all.
    pub fn is_ntfs(sector: &[u8]) -> bool {
        sector.len() >= 512 && &sector[3..11] == NTFS_OEM_ID
    }

    pub fn parse(sector: &[u8]) -> Result<Self> {
        if !Self::is_ntfs(sector) {
            return Err(WinstickError::InvalidSource("not an NTFS volume".to_string()));
        }
        if sector[510] != 0x55 || sector[511] != 0xAA {
            return Err(WinstickError::InvalidSource(
                "NTFS boot sector lacks the 0x55AA signature".to_string(),
            ));
        }

        let bytes_per_sector = LittleEndian::read_u16(&sector[0x0B..]) as u32;
        if ![512, 1024, 2048, 4096].contains(&bytes_per_sector) {
            return Err(WinstickError::InvalidSource(format!(
                "Invalid bytes per sector: {}",
                bytes_per_sector
            )));
        }
        // Values above 0x80 encode 2^(256 - n) sectors
        let raw_spc = sector[0x0D];
        let sectors_per_cluster = if raw_spc > 0x80 {
            1u32.checked_shl(256 - raw_spc as u32).unwrap_or(0)
        } else {
            raw_spc as u32
        };
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(WinstickError::InvalidSource(format!(
                "Invalid sectors per cluster: {}",
                raw_spc
            )));
        }
        let cluster_bytes = bytes_per_sector * sectors_per_cluster;

        // Positive: clusters per record; negative: 2^|n| bytes
        let raw_record = sector[0x40] as i8;
        let mft_record_size = if raw_record > 0 {
            raw_record as u32 * cluster_bytes
        } else {
            1u32.checked_shl(-(raw_record as i32) as u32).unwrap_or(0)
        };
        if !(256..=65536).contains(&mft_record_size) {
            return Err(WinstickError::InvalidSource(format!(
                "Invalid MFT record size: {}",
                mft_record_size
            )));
        }

        let total_sectors = LittleEndian::read_u64(&sector[0x28..]);
        if total_sectors
            .checked_add(1)
            .and_then(|n| n.checked_mul(bytes_per_sector as u64))
            .is_none()
        {
            return Err(WinstickError::InvalidSource(format!(
                "Volume of {} sectors overflows a byte count",
                total_sectors
            )));
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            mft_lcn: LittleEndian::read_u64(&sector[0x30..]),
            mft_record_size,
            volume_serial: LittleEndian::read_u64(&sector[0x48..]),
        })
    }

    pub fn cluster_bytes(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// Bytes the volume spans on disk, including the trailing backup boot sector.
    pub fn volume_bytes(&self) -> u64 {
        self.total_sectors.saturating_add(1).saturating_mul(self.bytes_per_sector as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_sector(spc: u8, record: u8) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[3..11].copy_from_slice(NTFS_OEM_ID);
        LittleEndian::write_u16(&mut sector[0x0B..], 512);
        sector[0x0D] = spc;
        LittleEndian::write_u64(&mut sector[0x28..], 2_000_000);
        LittleEndian::write_u64(&mut sector[0x30..], 786_432);
        sector[0x40] = record;
        LittleEndian::write_u64(&mut sector[0x48..], 0x1122_3344_5566_7788);
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }

    #[test]
    fn parses_common_layout() {
        let boot = NtfsBootSector::parse(&boot_sector(8, 0xF6)).unwrap();
        assert_eq!(boot.cluster_bytes(), 4096);
        assert_eq!(boot.mft_record_size, 1024);
        assert_eq!(boot.mft_lcn, 786_432);
        assert_eq!(boot.volume_serial, 0x1122_3344_5566_7788);
        assert_eq!(boot.volume_bytes(), 2_000_001 * 512);
    }

    #[test]
    fn oversized_sector_count_is_rejected() {
        let mut sector = boot_sector(8, 0xF6);
        LittleEndian::write_u64(&mut sector[0x28..], u64::MAX);
        let err = NtfsBootSector::parse(&sector).unwrap_err();
        assert!(matches!(err, WinstickError::InvalidSource(_)));
    }

    #[test]
    fn positive_record_size_counts_clusters() {
        let boot = NtfsBootSector::parse(&boot_sector(1, 2)).unwrap();
        assert_eq!(boot.mft_record_size, 1024);
    }

    #[test]
    fn rejects_other_filesystems() {
        let mut sector = boot_sector(8, 0xF6);
        sector[3..11].copy_from_slice(b"MSDOS5.0");
        assert!(matches!(
            NtfsBootSector::parse(&sector),
            Err(WinstickError::InvalidSource(_))
        ));
        assert!(NtfsBootSector::parse(&boot_sector(3, 0xF6)).is_err());
    }
}
