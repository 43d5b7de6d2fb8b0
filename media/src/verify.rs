//! Write records and read-back verification.
//!
//! Every structure the session writes is recorded as an extent with the
//! CRC32 of the bytes handed to the device. Verification re-reads each
//! extent and compares checksums.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use winstick_core::{
    BlockDevice, CancelToken, Phase, ProgressEvent, ProgressSink, Result, WinstickError,
};

/// Largest read issued while verifying a single extent.
const VERIFY_CHUNK_SECTORS: u64 = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub start_lba: u64,
    pub sector_count: u64,
    pub crc32: u32,
}

impl Extent {
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.sector_count
    }
}

/// Checksummed extents written to one region of the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub region: String,
    pub extents: Vec<Extent>,
    /// Set once the extents have been read back successfully.
    pub verified: bool,
}

impl VerificationRecord {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            ..Self::default()
        }
    }

    /// Record `data` as written at `start_lba`. An existing extent with the
    /// same start and length is replaced, so rewritten sectors keep one entry.
    pub fn record(&mut self, start_lba: u64, data: &[u8], sector_size: u32) {
        let sector_count = data.len() as u64 / sector_size as u64;
        let extent = Extent {
            start_lba,
            sector_count,
            crc32: crc32fast::hash(data),
        };
        match self
            .extents
            .iter_mut()
            .find(|e| e.start_lba == start_lba && e.sector_count == sector_count)
        {
            Some(existing) => *existing = extent,
            None => self.extents.push(extent),
        }
        self.verified = false;
    }

    pub fn sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.sector_count).sum()
    }
}

/// Re-read every extent of every record and compare CRC32 values.
pub fn verify_records(
    device: &mut dyn BlockDevice,
    records: &mut [VerificationRecord],
    progress: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<()> {
    let sector_size = device.geometry().sector_size as u64;
    let bytes_total: u64 = records.iter().map(|r| r.sectors() * sector_size).sum();
    let mut bytes_done = 0u64;
    info!(
        "Verifying {} extents ({} bytes)",
        records.iter().map(|r| r.extents.len()).sum::<usize>(),
        bytes_total
    );

    for record in records.iter_mut() {
        for extent in &record.extents {
            if cancel.is_cancelled() {
                return Err(WinstickError::Cancelled);
            }
            let actual = checksum_extent(device, extent)?;
            if actual != extent.crc32 {
                return Err(WinstickError::VerificationMismatch {
                    sectors: extent.start_lba..extent.end_lba(),
                    expected: extent.crc32,
                    actual,
                });
            }
            bytes_done += extent.sector_count * sector_size;
            progress.report(ProgressEvent {
                phase: Phase::Verifying,
                bytes_done,
                bytes_total,
            });
        }
        record.verified = true;
        debug!("Region {} verified", record.region);
    }
    Ok(())
}

fn checksum_extent(device: &mut dyn BlockDevice, extent: &Extent) -> Result<u32> {
    let mut hasher = crc32fast::Hasher::new();
    let mut lba = extent.start_lba;
    while lba < extent.end_lba() {
        let count = (extent.end_lba() - lba).min(VERIFY_CHUNK_SECTORS);
        let data = device.read_sectors(lba, count)?;
        hasher.update(&data);
        lba += count;
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use winstick_core::test_utils::MemoryDisk;
    use winstick_core::NullProgress;

    #[test]
    fn rewritten_extent_replaces_previous_checksum() {
        let mut record = VerificationRecord::new("boot");
        record.record(0, &[1u8; 512], 512);
        record.record(1, &[2u8; 1024], 512);
        record.record(0, &[3u8; 512], 512);
        assert_eq!(record.extents.len(), 2);
        assert_eq!(record.extents[0].crc32, crc32fast::hash(&[3u8; 512]));
        assert_eq!(record.sectors(), 3);
    }

    #[test]
    fn detects_corrupted_read_back() {
        let disk = MemoryDisk::new("mem://verify", 512, 8192);
        let mut dev = disk.open().unwrap();
        let data = vec![0xA5u8; 4096 * 512];
        dev.write_sectors(100, &data).unwrap();

        let mut records = vec![VerificationRecord::new("data")];
        records[0].record(100, &data, 512);
        verify_records(&mut dev, &mut records, &mut NullProgress, &CancelToken::new()).unwrap();
        assert!(records[0].verified);

        disk.corrupt_reads(3000..3001);
        let err = verify_records(&mut dev, &mut records, &mut NullProgress, &CancelToken::new())
            .unwrap_err();
        match err {
            WinstickError::VerificationMismatch { sectors, .. } => assert_eq!(sectors, 100..4196),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn cancellation_stops_verification() {
        let disk = MemoryDisk::new("mem://verify", 512, 64);
        let mut dev = disk.open().unwrap();
        let mut records = vec![VerificationRecord::new("table")];
        records[0].record(0, &[0u8; 512], 512);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = verify_records(&mut dev, &mut records, &mut NullProgress, &cancel).unwrap_err();
        assert!(matches!(err, WinstickError::Cancelled));
    }
}
