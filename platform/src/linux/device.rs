use crate::file::{exclusive_options, open_error, shared_read_options, FileBlockDevice};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use winstick_core::{
    BlockDevice, Device, DeviceManager, DeviceType, Geometry, Result, WinstickError,
};

nix::ioctl_read!(blk_get_size64, 0x12, 114, u64);
nix::ioctl_read_bad!(blk_ssz_get, 0x1268, std::os::raw::c_int);
nix::ioctl_read_bad!(blk_pbsz_get, 0x127b, std::os::raw::c_uint);

pub struct LinuxDeviceManager;

impl LinuxDeviceManager {
    fn read_sys_flag(device_name: &str, attribute: &str) -> Option<bool> {
        fs::read_to_string(format!("/sys/block/{}/{}", device_name, attribute))
            .ok()
            .map(|content| content.trim() == "1")
    }

    fn is_removable(device_name: &str) -> bool {
        if Self::read_sys_flag(device_name, "removable").unwrap_or(false) {
            return true;
        }
        // Many USB SSD enclosures report removable=0; the bus still tells us.
        fs::canonicalize(format!("/sys/block/{}", device_name))
            .map(|path| path.to_string_lossy().contains("/usb"))
            .unwrap_or(false)
    }

    fn get_device_type(device_name: &str, removable: bool) -> DeviceType {
        if device_name.starts_with("mmcblk") {
            return DeviceType::SDCard;
        }
        if removable {
            return DeviceType::USB;
        }
        if device_name.starts_with("loop") || device_name.starts_with("nbd") {
            return DeviceType::Virtual;
        }
        match Self::read_sys_flag(device_name, "queue/rotational") {
            Some(true) | None => DeviceType::HardDisk,
            Some(false) => DeviceType::SSD,
        }
    }

    fn logical_sector_size(device_name: &str) -> u32 {
        fs::read_to_string(format!(
            "/sys/block/{}/queue/logical_block_size",
            device_name
        ))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(512)
    }

    fn get_mount_points(device_path: &str) -> Vec<PathBuf> {
        match fs::read_to_string("/proc/mounts") {
            Ok(mounts) => parse_mount_points(&mounts, device_path),
            Err(_) => Vec::new(),
        }
    }

    fn is_system_disk(device_path: &str, mount_points: &[PathBuf]) -> bool {
        if mount_points.iter().any(|m| is_critical_mount(m)) {
            return true;
        }
        if let Ok(cmdline) = fs::read_to_string("/proc/cmdline") {
            if cmdline
                .split_whitespace()
                .filter_map(|arg| arg.strip_prefix("root="))
                .any(|root| root.starts_with(device_path))
            {
                return true;
            }
        }
        false
    }

    fn get_device_model(device_name: &str) -> String {
        for attribute in ["device/model", "device/vendor"] {
            if let Ok(model) = fs::read_to_string(format!("/sys/block/{}/{}", device_name, attribute)) {
                let model = model.trim();
                if !model.is_empty() {
                    return model.to_string();
                }
            }
        }
        device_name.to_uppercase()
    }

    fn describe(name: &str, size: u64, model: Option<String>, removable: Option<bool>) -> Device {
        let device_path = format!("/dev/{}", name);
        let mount_points = Self::get_mount_points(&device_path);
        let is_system = Self::is_system_disk(&device_path, &mount_points);
        let is_removable = removable.unwrap_or(false) || Self::is_removable(name);
        let model = model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| Self::get_device_model(name));
        Device {
            id: device_path,
            name: format!("{} ({})", model, name),
            size,
            sector_size: Self::logical_sector_size(name),
            device_type: Self::get_device_type(name, is_removable),
            mount_points,
            is_removable: is_removable && !is_system,
            is_system,
        }
    }

    fn enumerate_lsblk(&self) -> Result<Vec<Device>> {
        let lsblk = which::which("lsblk")
            .map_err(|e| WinstickError::Other(format!("lsblk not available: {}", e)))?;
        let output = Command::new(lsblk)
            .args(["-b", "-d", "-P", "-o", "NAME,SIZE,TYPE,MODEL,RM"])
            .output()
            .map_err(|e| WinstickError::Other(format!("Failed to run lsblk: {}", e)))?;
        if !output.status.success() {
            return Err(WinstickError::Other("lsblk command failed".to_string()));
        }

        let mut devices = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let fields = parse_lsblk_pairs(line);
            if fields.get("TYPE").map(String::as_str) != Some("disk") {
                continue;
            }
            let Some(name) = fields.get("NAME").filter(|n| !n.is_empty()) else {
                continue;
            };
            let size = fields
                .get("SIZE")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            if size == 0 {
                continue;
            }
            devices.push(Self::describe(
                name,
                size,
                fields.get("MODEL").map(|m| m.trim().to_string()),
                fields.get("RM").map(|rm| rm == "1"),
            ));
        }
        Ok(devices)
    }

    fn enumerate_sysfs(&self) -> Result<Vec<Device>> {
        let sys_block = Path::new("/sys/block");
        let entries = fs::read_dir(sys_block)
            .map_err(|e| WinstickError::Other(format!("Failed to read /sys/block: {}", e)))?;

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
                continue;
            }
            // sysfs reports size in 512-byte units regardless of the logical block size
            let size = fs::read_to_string(entry.path().join("size"))
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(0)
                * 512;
            if size == 0 {
                continue;
            }
            devices.push(Self::describe(&name, size, None, None));
        }
        Ok(devices)
    }

    fn query_geometry(file: &fs::File) -> Result<Geometry> {
        let fd = file.as_raw_fd();
        let mut size: u64 = 0;
        let mut logical: std::os::raw::c_int = 0;
        let mut physical: std::os::raw::c_uint = 0;
        // SAFETY: fd is an open block device and each out-pointer matches the ioctl's type.
        unsafe {
            blk_get_size64(fd, &mut size)
                .map_err(|e| WinstickError::Other(format!("BLKGETSIZE64 failed: {}", e)))?;
            blk_ssz_get(fd, &mut logical)
                .map_err(|e| WinstickError::Other(format!("BLKSSZGET failed: {}", e)))?;
            if blk_pbsz_get(fd, &mut physical).is_err() {
                physical = 0;
            }
        }
        let sector_size = u32::try_from(logical)
            .ok()
            .filter(|s| s.is_power_of_two() && *s >= 512)
            .ok_or_else(|| WinstickError::Other(format!("Bogus sector size {}", logical)))?;
        let mut geometry = Geometry::new(sector_size, size / sector_size as u64);
        if physical as u64 > Geometry::DEFAULT_ALIGNMENT {
            geometry.optimal_alignment = physical as u64;
        }
        Ok(geometry)
    }
}

#[async_trait::async_trait]
impl DeviceManager for LinuxDeviceManager {
    async fn enumerate_devices(&self) -> Result<Vec<Device>> {
        let mut devices = match self.enumerate_lsblk() {
            Ok(devices) if !devices.is_empty() => devices,
            Ok(_) => self.enumerate_sysfs()?,
            Err(e) => {
                debug!("lsblk enumeration unavailable ({}), falling back to sysfs", e);
                self.enumerate_sysfs()?
            }
        };

        // Removable first, then by name
        devices.sort_by(|a, b| {
            b.is_removable
                .cmp(&a.is_removable)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(devices)
    }

    fn open(&self, device: &Device, allow_non_removable: bool) -> Result<Box<dyn BlockDevice>> {
        if let Some(refusal) = device.refusal(allow_non_removable) {
            warn!("Refusing to open {}: {}", device.id, refusal);
            return Err(refusal);
        }
        if !device.mount_points.is_empty() {
            return Err(WinstickError::DeviceBusy(format!(
                "{} has mounted filesystems at {:?}",
                device.id, device.mount_points
            )));
        }

        // O_EXCL on a block device fails with EBUSY while anything else holds it.
        let file = exclusive_options()
            .custom_flags(nix::fcntl::OFlag::O_EXCL.bits())
            .open(&device.id)
            .map_err(|e| open_error(&device.id, e))?;
        let geometry = Self::query_geometry(&file)?;
        Ok(Box::new(FileBlockDevice::from_file(
            device.id.clone(),
            file,
            geometry,
        )?))
    }

    fn open_read_only(&self, device: &Device) -> Result<Box<dyn BlockDevice>> {
        let file = shared_read_options()
            .open(&device.id)
            .map_err(|e| open_error(&device.id, e))?;
        let geometry = Self::query_geometry(&file)?;
        Ok(Box::new(FileBlockDevice::read_only(
            device.id.clone(),
            file,
            geometry,
        )))
    }
}

/// Parse one `lsblk -P` line of `KEY="value"` pairs. lsblk escapes unsafe
/// bytes in values as `\xNN`.
pub(crate) fn parse_lsblk_pairs(line: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut key = String::new();
    let mut value = Vec::new();
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if in_quotes => match chars.next() {
                Some('x') => {
                    let hex: String = chars.clone().take(2).collect();
                    let byte = (hex.len() == 2 && hex.chars().all(|c| c.is_ascii_hexdigit()))
                        .then(|| u8::from_str_radix(&hex, 16).ok())
                        .flatten();
                    match byte {
                        Some(byte) => {
                            value.push(byte);
                            chars.nth(1);
                        }
                        None => value.push(b'x'),
                    }
                }
                Some(c) => push_char(&mut value, c),
                None => {}
            },
            '"' => {
                in_quotes = !in_quotes;
                if !in_quotes {
                    let decoded = String::from_utf8_lossy(&value).into_owned();
                    fields.insert(std::mem::take(&mut key), decoded);
                    value.clear();
                }
            }
            '=' | ' ' if !in_quotes => {}
            c if in_quotes => push_char(&mut value, c),
            c => key.push(c),
        }
    }
    fields
}

fn push_char(bytes: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

/// Mount points of `device_path` and its partitions listed in a `/proc/mounts` dump.
pub(crate) fn parse_mount_points(mounts: &str, device_path: &str) -> Vec<PathBuf> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let source = parts.next()?;
            let target = parts.next()?;
            let rest = source.strip_prefix(device_path)?;
            // sda matches sda1 and sdap1 style names but not sdb
            let is_partition = rest.is_empty()
                || rest.chars().all(|c| c.is_ascii_digit())
                || (rest.starts_with('p') && rest[1..].chars().all(|c| c.is_ascii_digit()));
            is_partition.then(|| PathBuf::from(target.replace("\\040", " ")))
        })
        .collect()
}

fn is_critical_mount(mount: &Path) -> bool {
    let path = mount.to_string_lossy();
    path == "/"
        || path == "/boot"
        || path == "/boot/efi"
        || path == "/home"
        || path == "/usr"
        || path == "/var"
        || path == "[SWAP]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsblk_pairs_with_spaces() {
        let fields = parse_lsblk_pairs(
            r#"NAME="sdb" SIZE="15610576896" TYPE="disk" MODEL="Ultra Fit" RM="1""#,
        );
        assert_eq!(fields["NAME"], "sdb");
        assert_eq!(fields["SIZE"], "15610576896");
        assert_eq!(fields["MODEL"], "Ultra Fit");
        assert_eq!(fields["RM"], "1");
    }

    #[test]
    fn hex_escapes_are_decoded() {
        let fields = parse_lsblk_pairs(
            r#"NAME="sdc" MODEL="SanDisk\x20Ultra\x20Fit" VENDOR="Caf\xc3\xa9" RM="1""#,
        );
        assert_eq!(fields["MODEL"], "SanDisk Ultra Fit");
        assert_eq!(fields["VENDOR"], "Café");
        assert_eq!(fields["RM"], "1");
    }

    #[test]
    fn broken_escapes_stay_literal() {
        let fields = parse_lsblk_pairs(r#"MODEL="A\xZZ" NAME="sdd""#);
        assert_eq!(fields["MODEL"], "AxZZ");
        assert_eq!(fields["NAME"], "sdd");
    }

    #[test]
    fn empty_values_are_kept() {
        let fields = parse_lsblk_pairs(r#"NAME="nvme0n1" MODEL="" RM="0""#);
        assert_eq!(fields["MODEL"], "");
        assert_eq!(fields["RM"], "0");
    }

    #[test]
    fn mount_points_match_partitions_only() {
        let mounts = "/dev/sda1 / ext4 rw 0 0\n\
                      /dev/sdb1 /media/usb\\040stick vfat rw 0 0\n\
                      /dev/sdab1 /mnt/other ext4 rw 0 0\n\
                      /dev/nvme0n1p2 /boot ext4 rw 0 0\n";
        assert_eq!(
            parse_mount_points(mounts, "/dev/sdb"),
            vec![PathBuf::from("/media/usb stick")]
        );
        assert_eq!(parse_mount_points(mounts, "/dev/sda"), vec![PathBuf::from("/")]);
        assert_eq!(
            parse_mount_points(mounts, "/dev/nvme0n1"),
            vec![PathBuf::from("/boot")]
        );
    }

    #[test]
    fn root_and_boot_are_critical() {
        assert!(is_critical_mount(Path::new("/")));
        assert!(is_critical_mount(Path::new("/boot/efi")));
        assert!(!is_critical_mount(Path::new("/media/usb")));
    }
}
