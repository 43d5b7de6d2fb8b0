/// In-memory devices for tests - NEVER touches real hardware
use crate::device::{BlockDevice, Device, DeviceManager, DeviceType, Geometry, LockState};
use crate::error::{Result, WinstickError};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::ops::Range;
use std::sync::{Arc, Mutex};

const CHUNK_SECTORS: u64 = 128;

#[derive(Default)]
struct DiskState {
    /// Sparse contents keyed by chunk index; all-zero chunks are dropped.
    chunks: HashMap<u64, Vec<u8>>,
    locked: bool,
    bytes_written: u64,
    bytes_attempted: u64,
    write_calls: usize,
    failing_writes: Option<Range<u64>>,
    corrupt_reads: Option<Range<u64>>,
}

/// A simulated storage medium. Clones share the same contents.
#[derive(Clone)]
pub struct MemoryDisk {
    id: String,
    geometry: Geometry,
    state: Arc<Mutex<DiskState>>,
}

impl MemoryDisk {
    pub fn new(id: &str, sector_size: u32, total_sectors: u64) -> Self {
        Self {
            id: id.to_string(),
            geometry: Geometry::new(sector_size, total_sectors),
            state: Arc::new(Mutex::new(DiskState::default())),
        }
    }

    pub fn with_size(id: &str, size_bytes: u64) -> Self {
        Self::new(id, 512, size_bytes / 512)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Lock the disk and hand out a block device; `DeviceBusy` if already open.
    pub fn open(&self) -> Result<MemoryDevice> {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            return Err(WinstickError::DeviceBusy(format!(
                "{} is locked by another session",
                self.id
            )));
        }
        state.locked = true;
        Ok(MemoryDevice {
            disk: self.clone(),
            open: true,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }

    /// Every write touching `sector` or later fails with an I/O error.
    pub fn fail_writes_from(&self, sector: u64) {
        self.fail_writes_in(sector..u64::MAX);
    }

    /// Every write overlapping `sectors` fails with an I/O error.
    pub fn fail_writes_in(&self, sectors: Range<u64>) {
        self.state.lock().unwrap().failing_writes = Some(sectors);
    }

    /// Reads of these sectors return flipped bytes, as a failing flash cell would.
    pub fn corrupt_reads(&self, sectors: Range<u64>) {
        self.state.lock().unwrap().corrupt_reads = Some(sectors);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_writes = None;
        state.corrupt_reads = None;
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.lock().unwrap().bytes_written
    }

    /// Bytes passed to `write_sectors`, including writes that failed.
    pub fn bytes_attempted(&self) -> u64 {
        self.state.lock().unwrap().bytes_attempted
    }

    pub fn write_calls(&self) -> usize {
        self.state.lock().unwrap().write_calls
    }

    /// Non-zero contents, keyed by chunk. Equal snapshots mean identical media.
    pub fn snapshot(&self) -> BTreeMap<u64, Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .chunks
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let state = self.state.lock().unwrap();
        copy_out(&state, self.chunk_bytes(), offset, &mut out);
        out
    }

    /// Write without locking or fault injection, for seeding fixtures.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        copy_in(&mut state, self.chunk_bytes(), offset, data);
    }

    fn chunk_bytes(&self) -> u64 {
        CHUNK_SECTORS * self.geometry.sector_size as u64
    }
}

fn copy_out(state: &DiskState, chunk_bytes: u64, offset: u64, out: &mut [u8]) {
    let mut done = 0usize;
    while done < out.len() {
        let pos = offset + done as u64;
        let index = pos / chunk_bytes;
        let within = (pos % chunk_bytes) as usize;
        let take = (chunk_bytes as usize - within).min(out.len() - done);
        match state.chunks.get(&index) {
            Some(chunk) => out[done..done + take].copy_from_slice(&chunk[within..within + take]),
            None => out[done..done + take].fill(0),
        }
        done += take;
    }
}

fn copy_in(state: &mut DiskState, chunk_bytes: u64, offset: u64, data: &[u8]) {
    let mut done = 0usize;
    while done < data.len() {
        let pos = offset + done as u64;
        let index = pos / chunk_bytes;
        let within = (pos % chunk_bytes) as usize;
        let take = (chunk_bytes as usize - within).min(data.len() - done);
        let slice = &data[done..done + take];
        match state.chunks.get_mut(&index) {
            Some(chunk) => {
                chunk[within..within + take].copy_from_slice(slice);
                if chunk.iter().all(|b| *b == 0) {
                    state.chunks.remove(&index);
                }
            }
            None if slice.iter().all(|b| *b == 0) => {}
            None => {
                let mut chunk = vec![0u8; chunk_bytes as usize];
                chunk[within..within + take].copy_from_slice(slice);
                state.chunks.insert(index, chunk);
            }
        }
        done += take;
    }
}

/// Locked handle onto a [`MemoryDisk`]. Dropping it releases the lock.
pub struct MemoryDevice {
    disk: MemoryDisk,
    open: bool,
}

impl BlockDevice for MemoryDevice {
    fn id(&self) -> &str {
        &self.disk.id
    }

    fn geometry(&self) -> Geometry {
        self.disk.geometry
    }

    fn lock_state(&self) -> LockState {
        if self.open {
            LockState::ExclusivelyLocked
        } else {
            LockState::Unlocked
        }
    }

    fn read_sectors(&mut self, start: u64, count: u64) -> Result<Vec<u8>> {
        let geometry = self.disk.geometry;
        geometry.check_range(start, count)?;
        let ss = geometry.sector_size as u64;
        let mut out = vec![0u8; (count * ss) as usize];
        let state = self.disk.state.lock().unwrap();
        copy_out(&state, self.disk.chunk_bytes(), start * ss, &mut out);
        if let Some(bad) = &state.corrupt_reads {
            for sector in start.max(bad.start)..(start + count).min(bad.end) {
                let at = ((sector - start) * ss) as usize;
                out[at] ^= 0xFF;
            }
        }
        Ok(out)
    }

    fn write_sectors(&mut self, start: u64, data: &[u8]) -> Result<()> {
        let geometry = self.disk.geometry;
        let count = geometry.check_write(start, data.len())?;
        let mut state = self.disk.state.lock().unwrap();
        state.write_calls += 1;
        state.bytes_attempted += data.len() as u64;
        if let Some(bad) = &state.failing_writes {
            if start < bad.end && start + count > bad.start {
                return Err(WinstickError::io_at(
                    start..start + count,
                    io::Error::new(io::ErrorKind::Other, "simulated media write failure"),
                ));
            }
        }
        copy_in(
            &mut state,
            CHUNK_SECTORS * geometry.sector_size as u64,
            start * geometry.sector_size as u64,
            data,
        );
        state.bytes_written += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        if self.open {
            self.disk.state.lock().unwrap().locked = false;
            self.open = false;
        }
    }
}

/// Device manager backed by [`MemoryDisk`]s.
#[derive(Clone, Default)]
pub struct MockDeviceManager {
    entries: Arc<Mutex<Vec<(Device, MemoryDisk)>>>,
    enumerate_call_count: Arc<Mutex<usize>>,
}

impl MockDeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a removable USB stick and return its backing disk.
    pub fn add_usb(&self, name: &str, size_bytes: u64) -> (Device, MemoryDisk) {
        self.add(name, size_bytes, DeviceType::USB, true, false)
    }

    pub fn add_fixed(&self, name: &str, size_bytes: u64) -> (Device, MemoryDisk) {
        self.add(name, size_bytes, DeviceType::SSD, false, false)
    }

    pub fn add_system(&self, name: &str, size_bytes: u64) -> (Device, MemoryDisk) {
        self.add(name, size_bytes, DeviceType::SSD, false, true)
    }

    fn add(
        &self,
        name: &str,
        size_bytes: u64,
        device_type: DeviceType,
        is_removable: bool,
        is_system: bool,
    ) -> (Device, MemoryDisk) {
        let id = format!("mock://{}", name.to_lowercase().replace(' ', "-"));
        let disk = MemoryDisk::with_size(&id, size_bytes);
        let device = Device {
            id,
            name: name.to_string(),
            size: disk.geometry().size_bytes(),
            sector_size: 512,
            device_type,
            mount_points: vec![],
            is_removable,
            is_system,
        };
        self.entries
            .lock()
            .unwrap()
            .push((device.clone(), disk.clone()));
        (device, disk)
    }

    pub fn call_count(&self) -> usize {
        *self.enumerate_call_count.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl DeviceManager for MockDeviceManager {
    async fn enumerate_devices(&self) -> Result<Vec<Device>> {
        *self.enumerate_call_count.lock().unwrap() += 1;
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(d, _)| d.clone())
            .collect())
    }

    fn open(&self, device: &Device, allow_non_removable: bool) -> Result<Box<dyn BlockDevice>> {
        if let Some(refusal) = device.refusal(allow_non_removable) {
            return Err(refusal);
        }
        let entries = self.entries.lock().unwrap();
        let disk = entries
            .iter()
            .find(|(d, _)| d.id == device.id)
            .map(|(_, disk)| disk.clone())
            .ok_or_else(|| WinstickError::Other(format!("Device not found: {}", device.id)))?;
        Ok(Box::new(disk.open()?))
    }
}
