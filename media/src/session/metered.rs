use log::trace;
use winstick_core::{BlockDevice, Geometry, LockState, Result};

/// Counts what passes through to the device.
pub struct MeteredDevice {
    inner: Box<dyn BlockDevice>,
    bytes_written: u64,
    bytes_attempted: u64,
}

impl MeteredDevice {
    pub fn new(inner: Box<dyn BlockDevice>) -> Self {
        Self {
            inner,
            bytes_written: 0,
            bytes_attempted: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_attempted(&self) -> u64 {
        self.bytes_attempted
    }

    /// Flush and release the device lock.
    pub fn close(self) -> Result<()> {
        self.inner.close()
    }
}

impl BlockDevice for MeteredDevice {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    fn lock_state(&self) -> LockState {
        self.inner.lock_state()
    }

    fn read_sectors(&mut self, start: u64, count: u64) -> Result<Vec<u8>> {
        self.inner.read_sectors(start, count)
    }

    fn write_sectors(&mut self, start: u64, data: &[u8]) -> Result<()> {
        self.bytes_attempted += data.len() as u64;
        self.inner.write_sectors(start, data)?;
        self.bytes_written += data.len() as u64;
        trace!("{} bytes written at LBA {}", data.len(), start);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
