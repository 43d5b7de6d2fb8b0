use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use winstick_core::{BlockDevice, Geometry, LockState, Result, WinstickError};

#[cfg(windows)]
const ERROR_SHARING_VIOLATION: i32 = 32;

/// Runs a closure once when dropped. Undoes whatever had to happen to a
/// device before it could be opened, such as taking it offline.
pub struct ReleaseGuard(Option<Box<dyn FnOnce() + Send>>);

impl ReleaseGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// Block device over an opened file or device node. Write handles are
/// exclusive; read-only handles share the device with everyone else.
pub struct FileBlockDevice {
    id: String,
    file: File,
    geometry: Geometry,
    locked: bool,
    writable: bool,
    // Declared after `file` so it fires once the handle is closed.
    release: Option<ReleaseGuard>,
}

impl FileBlockDevice {
    /// Open a disk image file for sector I/O.
    pub fn open_image(path: &Path, sector_size: u32) -> Result<Self> {
        let id = path.display().to_string();
        let file = exclusive_options()
            .open(path)
            .map_err(|e| open_error(&id, e))?;
        let len = file.metadata()?.len();
        if len % sector_size as u64 != 0 {
            warn!(
                "{} is {} bytes, not a whole number of {}-byte sectors; the tail is ignored",
                id, len, sector_size
            );
        }
        let geometry = Geometry::new(sector_size, len / sector_size as u64);
        Self::from_file(id, file, geometry)
    }

    /// Open a disk image file for reading without locking it.
    pub fn open_image_read_only(path: &Path, sector_size: u32) -> Result<Self> {
        let id = path.display().to_string();
        let file = shared_read_options()
            .open(path)
            .map_err(|e| open_error(&id, e))?;
        let geometry = Geometry::new(sector_size, file.metadata()?.len() / sector_size as u64);
        Ok(Self::read_only(id, file, geometry))
    }

    /// Create (or truncate) an image file of `size_bytes` and open it.
    pub fn create_image(path: &Path, sector_size: u32, size_bytes: u64) -> Result<Self> {
        let file = File::create(path)?;
        file.set_len(size_bytes)?;
        drop(file);
        Self::open_image(path, sector_size)
    }

    /// Wrap an already opened handle, taking the advisory lock where the platform has one.
    pub(crate) fn from_file(id: String, file: File, geometry: Geometry) -> Result<Self> {
        lock_exclusive(&id, &file)?;
        debug!(
            "Opened {} ({} sectors of {} bytes)",
            id, geometry.total_sectors, geometry.sector_size
        );
        Ok(Self {
            id,
            file,
            geometry,
            locked: true,
            writable: true,
            release: None,
        })
    }

    /// Open a device node exclusively. `release` runs when the device is
    /// closed or dropped, and also when the open itself fails.
    pub(crate) fn open_exclusive(
        id: &str,
        geometry: Geometry,
        release: Option<ReleaseGuard>,
    ) -> Result<Self> {
        let file = exclusive_options()
            .open(id)
            .map_err(|e| open_error(id, e))?;
        let mut dev = Self::from_file(id.to_string(), file, geometry)?;
        dev.release = release;
        Ok(dev)
    }

    /// Wrap a handle opened with [`shared_read_options`]. No lock is taken
    /// and writes are refused.
    pub(crate) fn read_only(id: String, file: File, geometry: Geometry) -> Self {
        debug!("Opened {} read-only", id);
        Self {
            id,
            file,
            geometry,
            locked: false,
            writable: false,
            release: None,
        }
    }

    fn byte_offset(&self, lba: u64) -> u64 {
        lba * self.geometry.sector_size as u64
    }
}

impl BlockDevice for FileBlockDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn lock_state(&self) -> LockState {
        if self.locked {
            LockState::ExclusivelyLocked
        } else {
            LockState::Unlocked
        }
    }

    fn read_sectors(&mut self, start: u64, count: u64) -> Result<Vec<u8>> {
        self.geometry.check_range(start, count)?;
        let mut buf = vec![0u8; (count * self.geometry.sector_size as u64) as usize];
        let offset = self.byte_offset(start);
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(&mut buf))
            .map_err(|e| WinstickError::io_at(start..start + count, e))?;
        Ok(buf)
    }

    fn write_sectors(&mut self, start: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(WinstickError::PermissionDenied(format!(
                "{} is open read-only",
                self.id
            )));
        }
        let count = self.geometry.check_write(start, data.len())?;
        let offset = self.byte_offset(start);
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .map_err(|e| WinstickError::io_at(start..start + count, e))
    }

    fn flush(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for FileBlockDevice {
    fn drop(&mut self) {
        if self.locked {
            unlock(&self.file);
            self.locked = false;
            debug!("Released {}", self.id);
        }
    }
}

pub(crate) fn exclusive_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        options.share_mode(0);
    }
    options
}

/// Read access that leaves the device usable by others, mounted volumes included.
pub(crate) fn shared_read_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_SHARE_READ | FILE_SHARE_WRITE
        options.share_mode(0x1 | 0x2);
    }
    options
}

/// Translate an open failure into the device-layer error kinds.
pub(crate) fn open_error(id: &str, err: io::Error) -> WinstickError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return WinstickError::PermissionDenied(format!("{}: {}", id, err));
    }
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(nix::errno::Errno::EBUSY as i32) {
            return WinstickError::DeviceBusy(format!("{} is in use: {}", id, err));
        }
    }
    #[cfg(windows)]
    {
        if err.raw_os_error() == Some(ERROR_SHARING_VIOLATION) {
            return WinstickError::DeviceBusy(format!("{} is open in another process", id));
        }
    }
    WinstickError::Io {
        sectors: None,
        source: err,
    }
}

#[cfg(unix)]
fn lock_exclusive(id: &str, file: &File) -> Result<()> {
    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(()),
        Err(Errno::EWOULDBLOCK) => Err(WinstickError::DeviceBusy(format!(
            "{} is locked by another process",
            id
        ))),
        Err(e) => Err(WinstickError::Other(format!("Failed to lock {}: {}", id, e))),
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
}

// Share mode 0 already makes the open handle exclusive.
#[cfg(windows)]
fn lock_exclusive(_id: &str, _file: &File) -> Result<()> {
    Ok(())
}

#[cfg(windows)]
fn unlock(_file: &File) {}
