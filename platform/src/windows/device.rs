use crate::file::{open_error, shared_read_options, FileBlockDevice, ReleaseGuard};
use crate::windows::elevation::is_elevated;
use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use std::os::windows::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use winstick_core::{
    BlockDevice, Device, DeviceManager, DeviceType, Geometry, Result, WinstickError,
};

const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Deserialize)]
struct WindowsDisk {
    #[serde(rename = "Number")]
    number: u32,
    #[serde(rename = "FriendlyName")]
    friendly_name: Option<String>,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "LogicalSectorSize")]
    logical_sector_size: Option<u32>,
    #[serde(rename = "BusType")]
    bus_type: Option<String>,
    #[serde(rename = "MediaType")]
    media_type: Option<String>,
    #[serde(rename = "IsSystem")]
    is_system: bool,
    #[serde(rename = "IsBoot")]
    is_boot: bool,
    #[serde(rename = "DriveLetters", default)]
    drive_letters: Option<String>,
}

pub struct WindowsDeviceManager;

impl WindowsDeviceManager {
    fn powershell(script: &str) -> Result<String> {
        let output = Command::new("powershell.exe")
            .creation_flags(CREATE_NO_WINDOW)
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .output()
            .map_err(|e| WinstickError::Other(format!("Failed to run PowerShell: {}", e)))?;
        if !output.status.success() {
            return Err(WinstickError::Other(format!(
                "PowerShell command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn get_disks() -> Result<Vec<WindowsDisk>> {
        let json = Self::powershell(
            "Get-Disk | Select-Object Number, FriendlyName, Size, LogicalSectorSize, \
             @{n='BusType';e={[string]$_.BusType}}, @{n='MediaType';e={[string]$_.MediaType}}, \
             IsSystem, IsBoot, \
             @{n='DriveLetters';e={(Get-Partition -DiskNumber $_.Number -ErrorAction SilentlyContinue | \
             Where-Object DriveLetter | ForEach-Object { \"$($_.DriveLetter):\" }) -join ','}} \
             | ConvertTo-Json",
        )?;
        parse_disks(&json)
    }

    fn get_device_type(bus_type: Option<&str>, media_type: Option<&str>) -> DeviceType {
        match bus_type.map(|b| b.to_uppercase()).as_deref() {
            Some("USB") => return DeviceType::USB,
            Some("SD") | Some("MMC") => return DeviceType::SDCard,
            Some("FILE BACKED VIRTUAL") | Some("VIRTUAL") => return DeviceType::Virtual,
            Some("NVME") => return DeviceType::SSD,
            _ => {}
        }
        match media_type.map(|m| m.to_uppercase()).as_deref() {
            Some("SSD") => DeviceType::SSD,
            Some("HDD") => DeviceType::HardDisk,
            _ => DeviceType::Unknown,
        }
    }

    fn is_removable(media_type: Option<&str>, bus_type: Option<&str>) -> bool {
        if let Some(media) = media_type {
            let media = media.to_lowercase();
            if media.contains("removable") || media.contains("external") {
                return true;
            }
        }
        bus_type.map_or(false, |bus| {
            matches!(bus.to_uppercase().as_str(), "USB" | "SD" | "MMC")
        })
    }

    fn disk_number(device_id: &str) -> Option<u32> {
        device_id
            .to_uppercase()
            .strip_prefix(r"\\.\PHYSICALDRIVE")
            .and_then(|n| n.parse().ok())
    }

    fn set_offline(number: u32, offline: bool) -> Result<()> {
        Self::powershell(&format!(
            "Set-Disk -Number {} -IsOffline ${} -ErrorAction Stop",
            number, offline
        ))
        .map(|_| ())
    }

    /// Taking the disk offline dismounts its volumes so raw writes reach the
    /// media. The returned guard brings it back online once the handle closes.
    fn take_offline(number: u32) -> Result<ReleaseGuard> {
        info!("Taking disk {} offline for raw access", number);
        Self::set_offline(number, true)?;
        Ok(ReleaseGuard::new(move || {
            info!("Bringing disk {} back online", number);
            if let Err(e) = Self::set_offline(number, false) {
                warn!("Disk {} stays offline: {}", number, e);
            }
        }))
    }

    fn geometry_of(device: &Device) -> Geometry {
        Geometry::new(device.sector_size, device.size / device.sector_size as u64)
    }
}

fn parse_disks(json: &str) -> Result<Vec<WindowsDisk>> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }
    // ConvertTo-Json emits a bare object for a single disk
    let disks = if json.starts_with('[') {
        serde_json::from_str(json)?
    } else {
        vec![serde_json::from_str::<WindowsDisk>(json)?]
    };
    Ok(disks)
}

#[async_trait]
impl DeviceManager for WindowsDeviceManager {
    async fn enumerate_devices(&self) -> Result<Vec<Device>> {
        let disks = Self::get_disks()?;
        let mut devices: Vec<Device> = disks
            .into_iter()
            .map(|disk| {
                let is_system = disk.is_system || disk.is_boot;
                let removable =
                    Self::is_removable(disk.media_type.as_deref(), disk.bus_type.as_deref());
                Device {
                    id: format!(r"\\.\PHYSICALDRIVE{}", disk.number),
                    name: disk
                        .friendly_name
                        .clone()
                        .unwrap_or_else(|| format!("Disk {}", disk.number)),
                    size: disk.size,
                    sector_size: disk.logical_sector_size.unwrap_or(512),
                    device_type: Self::get_device_type(
                        disk.bus_type.as_deref(),
                        disk.media_type.as_deref(),
                    ),
                    mount_points: disk
                        .drive_letters
                        .as_deref()
                        .unwrap_or("")
                        .split(',')
                        .filter(|l| !l.is_empty())
                        .map(|l| PathBuf::from(format!("{}\\", l)))
                        .collect(),
                    is_removable: removable && !is_system,
                    is_system,
                }
            })
            .collect();
        devices.sort_by(|a, b| {
            b.is_removable
                .cmp(&a.is_removable)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(devices)
    }

    fn open(&self, device: &Device, allow_non_removable: bool) -> Result<Box<dyn BlockDevice>> {
        if let Some(refusal) = device.refusal(allow_non_removable) {
            warn!("Refusing to open {}: {}", device.id, refusal);
            return Err(refusal);
        }
        if !is_elevated() {
            return Err(WinstickError::PermissionDenied(format!(
                "raw access to {} requires administrator privileges",
                device.id
            )));
        }
        let number = Self::disk_number(&device.id).ok_or_else(|| {
            WinstickError::Other(format!("{} is not a physical drive path", device.id))
        })?;
        let online = if device.mount_points.is_empty() {
            None
        } else {
            Some(Self::take_offline(number)?)
        };
        Ok(Box::new(FileBlockDevice::open_exclusive(
            &device.id,
            Self::geometry_of(device),
            online,
        )?))
    }

    fn open_read_only(&self, device: &Device) -> Result<Box<dyn BlockDevice>> {
        Self::disk_number(&device.id).ok_or_else(|| {
            WinstickError::Other(format!("{} is not a physical drive path", device.id))
        })?;
        let file = shared_read_options()
            .open(&device.id)
            .map_err(|e| match open_error(&device.id, e) {
                WinstickError::PermissionDenied(_) if !is_elevated() => {
                    WinstickError::PermissionDenied(format!(
                        "reading {} requires administrator privileges",
                        device.id
                    ))
                }
                other => other,
            })?;
        Ok(Box::new(FileBlockDevice::read_only(
            device.id.clone(),
            file,
            Self::geometry_of(device),
        )))
    }
}
