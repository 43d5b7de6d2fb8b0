use crate::file::{open_error, shared_read_options, FileBlockDevice, ReleaseGuard};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use winstick_core::{
    BlockDevice, Device, DeviceManager, DeviceType, Geometry, Result, WinstickError,
};

pub struct MacOSDeviceManager;

impl MacOSDeviceManager {
    fn diskutil(args: &[&str]) -> Result<String> {
        let output = Command::new("diskutil")
            .args(args)
            .output()
            .map_err(|e| WinstickError::Other(format!("Failed to run diskutil: {}", e)))?;
        if !output.status.success() {
            return Err(WinstickError::Other(format!(
                "diskutil {} failed",
                args.join(" ")
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn geometry_of(device: &Device) -> Geometry {
        Geometry::new(device.sector_size, device.size / device.sector_size as u64)
    }

    /// Whole disks behind `/`: the disk holding the root volume and, for
    /// APFS, the physical stores of its container.
    fn root_disks() -> Option<Vec<String>> {
        let disks = Self::diskutil(&["info", "/"])
            .map(|text| root_disks_from_info(&parse_info(&text)))
            .unwrap_or_default();
        if disks.is_empty() {
            warn!("Could not resolve the disk holding /; treating internal disks as system disks");
            return None;
        }
        Some(disks)
    }

    fn describe(disk: &str, root_disks: Option<&[String]>) -> Result<Device> {
        let info = parse_info(&Self::diskutil(&["info", disk])?);
        let field = |key: &str| info.get(key).map(String::as_str).unwrap_or("");

        let size = parse_byte_count(field("Disk Size")).unwrap_or(0);
        let protocol = field("Protocol").to_string();
        let removable = field("Removable Media") == "Removable"
            || field("Device Location") == "External"
            || protocol == "USB";
        let mount_points = Self::volume_mounts(disk);
        let is_system = mount_points.iter().any(|m| m == &PathBuf::from("/"))
            || match root_disks {
                Some(roots) => roots.iter().any(|d| d == disk),
                None => field("Device Location") == "Internal",
            };

        Ok(Device {
            id: format!("/dev/r{}", disk),
            name: format!("{} ({})", field("Device / Media Name"), disk),
            size,
            sector_size: field("Device Block Size")
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(512),
            device_type: match protocol.as_str() {
                "USB" => DeviceType::USB,
                "Secure Digital" => DeviceType::SDCard,
                "Disk Image" => DeviceType::Virtual,
                _ if field("Solid State") == "Yes" => DeviceType::SSD,
                _ => DeviceType::HardDisk,
            },
            mount_points,
            is_removable: removable && !is_system,
            is_system,
        })
    }

    fn volume_mounts(disk: &str) -> Vec<PathBuf> {
        let Ok(mounts) = Command::new("mount").output() else {
            return Vec::new();
        };
        let prefix = format!("/dev/{}s", disk);
        String::from_utf8_lossy(&mounts.stdout)
            .lines()
            .filter_map(|line| {
                let (source, rest) = line.split_once(" on ")?;
                let target = rest.split(" (").next()?;
                (source == format!("/dev/{}", disk) || source.starts_with(&prefix))
                    .then(|| PathBuf::from(target))
            })
            .collect()
    }
}

/// `Key:   Value` lines from `diskutil info`.
fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// `disk3s1s1` -> `disk3`.
fn whole_disk(identifier: &str) -> &str {
    let identifier = identifier.trim().trim_start_matches("/dev/");
    let Some(rest) = identifier.strip_prefix("disk") else {
        return "";
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    &identifier[..4 + digits]
}

/// Whole disks named by `diskutil info /`. APFS roots sit on a synthesized
/// disk whose physical stores are listed separately, possibly comma-separated.
fn root_disks_from_info(info: &HashMap<String, String>) -> Vec<String> {
    let mut disks: Vec<String> = Vec::new();
    let stores = info
        .iter()
        .filter(|(key, _)| key.starts_with("APFS Physical Store"))
        .flat_map(|(_, value)| value.split(','));
    for identifier in info.get("Part of Whole").map(String::as_str).into_iter().chain(stores) {
        let disk = whole_disk(identifier);
        if disk.len() > 4 && !disks.iter().any(|d| d == disk) {
            disks.push(disk.to_string());
        }
    }
    disks
}

/// Pull `N` out of `"16.0 GB (16008609792 Bytes) (exactly 31266816 512-Byte-Units)"`.
fn parse_byte_count(value: &str) -> Option<u64> {
    let start = value.find('(')? + 1;
    let digits: String = value[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Whole-disk identifiers such as `disk2` from `diskutil list` output.
fn parse_disk_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.strip_prefix("/dev/"))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl DeviceManager for MacOSDeviceManager {
    async fn enumerate_devices(&self) -> Result<Vec<Device>> {
        let list = Self::diskutil(&["list", "physical"])?;
        let root_disks = Self::root_disks();
        debug!("Root volume lives on {:?}", root_disks);
        let mut devices = Vec::new();
        for disk in parse_disk_list(&list) {
            match Self::describe(&disk, root_disks.as_deref()) {
                Ok(device) => devices.push(device),
                Err(e) => debug!("Skipping {}: {}", disk, e),
            }
        }
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
        let remount = if device.mount_points.is_empty() {
            None
        } else {
            let disk = device.id.trim_start_matches("/dev/r").to_string();
            Self::diskutil(&["unmountDisk", &disk]).map_err(|e| {
                WinstickError::DeviceBusy(format!("{} could not be unmounted: {}", device.id, e))
            })?;
            Some(ReleaseGuard::new(move || {
                if let Err(e) = Self::diskutil(&["mountDisk", &disk]) {
                    debug!("{} left unmounted: {}", disk, e);
                }
            }))
        };
        Ok(Box::new(FileBlockDevice::open_exclusive(
            &device.id,
            Self::geometry_of(device),
            remount,
        )?))
    }

    fn open_read_only(&self, device: &Device) -> Result<Box<dyn BlockDevice>> {
        let file = shared_read_options()
            .open(&device.id)
            .map_err(|e| open_error(&device.id, e))?;
        Ok(Box::new(FileBlockDevice::read_only(
            device.id.clone(),
            file,
            Self::geometry_of(device),
        )))
    }
}
