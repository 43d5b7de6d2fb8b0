use std::path::{Path, PathBuf};
use winstick_core::{BlockDevice, Device, DeviceManager, DeviceType, Result, WinstickError};
use winstick_platform::FileBlockDevice;

/// Serves one disk image file as if it were a removable device.
pub struct ImageFileManager {
    path: PathBuf,
    device: Device,
}

impl ImageFileManager {
    pub fn new(path: &Path) -> Result<Self> {
        let len = std::fs::metadata(path)
            .map_err(|e| WinstickError::Other(format!("cannot stat {}: {}", path.display(), e)))?
            .len();
        let device = Device {
            id: path.display().to_string(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            size: len,
            sector_size: 512,
            device_type: DeviceType::Virtual,
            mount_points: vec![],
            is_removable: true,
            is_system: false,
        };
        Ok(Self {
            path: path.to_path_buf(),
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[async_trait::async_trait]
impl DeviceManager for ImageFileManager {
    async fn enumerate_devices(&self) -> Result<Vec<Device>> {
        Ok(vec![self.device.clone()])
    }

    fn open(&self, device: &Device, allow_non_removable: bool) -> Result<Box<dyn BlockDevice>> {
        if let Some(refusal) = device.refusal(allow_non_removable) {
            return Err(refusal);
        }
        if device.id != self.device.id {
            return Err(WinstickError::Other(format!("Device not found: {}", device.id)));
        }
        Ok(Box::new(FileBlockDevice::open_image(&self.path, self.device.sector_size)?))
    }

    fn open_read_only(&self, device: &Device) -> Result<Box<dyn BlockDevice>> {
        if device.id != self.device.id {
            return Err(WinstickError::Other(format!("Device not found: {}", device.id)));
        }
        Ok(Box::new(FileBlockDevice::open_image_read_only(
            &self.path,
            self.device.sector_size,
        )?))
    }
}
