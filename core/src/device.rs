use crate::error::{Result, WinstickError};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub sector_size: u32,
    pub device_type: DeviceType,
    pub mount_points: Vec<PathBuf>,
    pub is_removable: bool,
    pub is_system: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    HardDisk,
    SSD,
    USB,
    SDCard,
    Virtual,
    Unknown,
}

impl Device {
    /// Why this device may not be written, if it may not.
    pub fn refusal(&self, allow_non_removable: bool) -> Option<WinstickError> {
        if self.is_system {
            return Some(WinstickError::NotRemovable(format!(
                "{} hosts the running system and is never written",
                self.id
            )));
        }
        if !self.is_removable && !allow_non_removable {
            return Some(WinstickError::NotRemovable(format!(
                "{} is not a removable device",
                self.id
            )));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub sector_size: u32,
    pub total_sectors: u64,
    /// Partition boundary alignment in bytes.
    pub optimal_alignment: u64,
}

impl Geometry {
    pub const DEFAULT_ALIGNMENT: u64 = 1024 * 1024;

    pub fn new(sector_size: u32, total_sectors: u64) -> Self {
        Self {
            sector_size,
            total_sectors,
            optimal_alignment: Self::DEFAULT_ALIGNMENT,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_sectors * self.sector_size as u64
    }

    pub fn alignment_sectors(&self) -> u64 {
        (self.optimal_alignment / self.sector_size as u64).max(1)
    }

    pub fn align_up(&self, lba: u64) -> u64 {
        let align = self.alignment_sectors();
        lba.div_ceil(align) * align
    }

    pub fn align_down(&self, lba: u64) -> u64 {
        let align = self.alignment_sectors();
        lba / align * align
    }

    pub fn is_aligned(&self, lba: u64) -> bool {
        lba % self.alignment_sectors() == 0
    }

    pub fn bytes_to_sectors(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.sector_size as u64)
    }

    /// Validate a write of `len` bytes at `start`, returning the sector count.
    pub fn check_write(&self, start: u64, len: usize) -> Result<u64> {
        if len % self.sector_size as usize != 0 {
            return Err(WinstickError::MisalignedWrite {
                len,
                sector_size: self.sector_size,
            });
        }
        let count = (len / self.sector_size as usize) as u64;
        self.check_range(start, count)?;
        Ok(count)
    }

    pub fn check_range(&self, start: u64, count: u64) -> Result<()> {
        let end = start.checked_add(count).unwrap_or(u64::MAX);
        if end > self.total_sectors {
            return Err(WinstickError::io_at(
                start..end,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("access beyond the last sector {}", self.total_sectors),
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Unlocked,
    ExclusivelyLocked,
}

/// An opened block device.
///
/// Implementations hold an exclusive lock from the moment they are returned by
/// [`DeviceManager::open`] until they are closed or dropped. Reads and writes
/// are whole sectors; nothing is padded on the caller's behalf.
pub trait BlockDevice: Send {
    fn id(&self) -> &str;

    fn geometry(&self) -> Geometry;

    fn lock_state(&self) -> LockState;

    fn read_sectors(&mut self, start: u64, count: u64) -> Result<Vec<u8>>;

    /// `data.len()` must be a multiple of the sector size.
    fn write_sectors(&mut self, start: u64, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Flush and release the lock.
    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush()
    }
}

#[async_trait::async_trait]
pub trait DeviceManager: Send + Sync {
    /// Every block device found, removable or not, with removability and
    /// system-disk flags filled in.
    async fn enumerate_devices(&self) -> Result<Vec<Device>>;

    /// Devices a session may target without an override.
    async fn enumerate_removable(&self) -> Result<Vec<Device>> {
        let devices = self.enumerate_devices().await?;
        Ok(devices
            .into_iter()
            .filter(|d| d.is_removable && !d.is_system)
            .collect())
    }

    async fn get_device_by_id(&self, device_id: &str) -> Result<Option<Device>> {
        let devices = self.enumerate_devices().await?;
        Ok(devices.into_iter().find(|d| d.id == device_id))
    }

    /// Open and exclusively lock a device.
    ///
    /// Fails with `NotRemovable` for system disks and, unless
    /// `allow_non_removable` is set, for fixed disks.
    fn open(&self, device: &Device, allow_non_removable: bool) -> Result<Box<dyn BlockDevice>>;

    /// Open a device for reading only. Nothing is locked, unmounted or taken
    /// offline, and any device may be read, system disks included. Managers
    /// whose `open` has no side effects can keep this default.
    fn open_read_only(&self, device: &Device) -> Result<Box<dyn BlockDevice>> {
        self.open(device, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_in_sectors() {
        let small = Geometry::new(512, 1 << 20);
        assert_eq!(small.alignment_sectors(), 2048);
        assert_eq!(small.align_up(1), 2048);
        assert_eq!(small.align_up(2048), 2048);
        assert_eq!(small.align_down(4095), 2048);

        let native = Geometry::new(4096, 1 << 18);
        assert_eq!(native.alignment_sectors(), 256);
        assert!(native.is_aligned(512));
    }

    #[test]
    fn unaligned_write_is_rejected() {
        let geometry = Geometry::new(512, 100);
        let err = geometry.check_write(0, 700).unwrap_err();
        assert!(matches!(
            err,
            WinstickError::MisalignedWrite {
                len: 700,
                sector_size: 512
            }
        ));
        assert_eq!(geometry.check_write(10, 1024).unwrap(), 2);
    }

    #[test]
    fn out_of_bounds_write_reports_range() {
        let geometry = Geometry::new(512, 100);
        let err = geometry.check_write(99, 1024).unwrap_err();
        assert_eq!(err.sectors(), Some(99..101));
    }

    #[test]
    fn system_disks_are_refused_even_with_override() {
        let device = Device {
            id: "disk0".to_string(),
            name: "Internal".to_string(),
            size: 1 << 40,
            sector_size: 512,
            device_type: DeviceType::SSD,
            mount_points: vec![PathBuf::from("/")],
            is_removable: false,
            is_system: true,
        };
        assert!(device.refusal(true).is_some());

        let fixed = Device {
            is_system: false,
            ..device
        };
        assert!(fixed.refusal(false).is_some());
        assert!(fixed.refusal(true).is_none());
    }
}
