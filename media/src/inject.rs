//! Boot driver injection.
//!
//! A driver variant is a set of files for the boot partition plus optional
//! boot code for the MBR and the FAT32 volume boot record. Injection writes
//! the files and a boot configuration record that tells the driver where
//! the installer lives, then patches the boot code so firmware reaches the
//! driver first.

use crate::fat32::constants::BOOT_CODE_OFFSET;
use crate::fat32::Fat32Volume;
use crate::partition::mbr;
use crate::partition::Layout;
use crate::verify::VerificationRecord;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use winstick_core::{BlockDevice, BootMode, Result, WinstickError};

/// Space the partition planner keeps free for injection at the least.
pub const MIN_DRIVER_RESERVE: u64 = 8 * 1024 * 1024;

/// Largest cluster the FAT32 constructor picks; payload estimates made
/// before planning assume it.
pub const MAX_CLUSTER_BYTES: u64 = 32 * 1024;

pub const CONFIG_MAGIC: &[u8; 4] = b"WSBC";
pub const CONFIG_VERSION: u16 = 1;
pub const CONFIG_PATH: &str = "winstick/boot.cfg";
pub const CONFIG_LEN: usize = 100;

/// VBR boot code runs from 0x5A up to the stage pointer at 0x1F0.
pub const VBR_CODE_LEN: usize = 0x1F0 - BOOT_CODE_OFFSET;
const VBR_STAGE_LBA: usize = 0x1F0;
const VBR_STAGE_SECTORS: usize = 0x1F8;

const MANIFEST_NAME: &str = "manifest.json";
const VARIANT_ID_LEN: usize = 32;

/// Config flag: the installer is a raw NTFS partition rather than files
/// on the boot partition.
pub const CONFIG_FLAG_RAW_NTFS: u16 = 0x0001;

/// Bytes stored either inline or in a file next to the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadSource {
    Inline { data: Vec<u8> },
    File { path: PathBuf },
}

impl PayloadSource {
    fn load(&self, base: Option<&Path>) -> Result<Vec<u8>> {
        match self {
            PayloadSource::Inline { data } => Ok(data.clone()),
            PayloadSource::File { path } => {
                let full = match base {
                    Some(dir) => dir.join(path),
                    None => path.clone(),
                };
                std::fs::read(&full).map_err(|e| {
                    WinstickError::DriverIncompatible(format!(
                        "cannot read driver file {}: {}",
                        full.display(),
                        e
                    ))
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    /// Destination path on the boot partition.
    pub target: String,
    #[serde(flatten)]
    pub source: PayloadSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSpec {
    pub id: String,
    pub boot_modes: Vec<BootMode>,
    pub files: Vec<FileSpec>,
    /// Target of the file the boot code loads.
    pub stage_file: String,
    #[serde(default)]
    pub mbr_boot_code: Option<PayloadSource>,
    #[serde(default)]
    pub vbr_boot_code: Option<PayloadSource>,
}

/// `manifest.json` of a driver directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogManifest {
    pub variants: Vec<VariantSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverFile {
    pub target: String,
    pub data: Vec<u8>,
}

/// A loaded driver variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverVariant {
    pub id: String,
    pub boot_modes: Vec<BootMode>,
    pub files: Vec<DriverFile>,
    pub stage_file: String,
    pub mbr_boot_code: Option<Vec<u8>>,
    pub vbr_boot_code: Option<Vec<u8>>,
}

impl DriverVariant {
    pub fn supports(&self, mode: BootMode) -> bool {
        self.boot_modes.contains(&mode)
    }

    fn validate(&self) -> Result<()> {
        let incompatible = |why: String| WinstickError::DriverIncompatible(format!("{}: {}", self.id, why));
        if self.id.is_empty() || self.id.len() > VARIANT_ID_LEN {
            return Err(incompatible(format!("id must be 1 to {} bytes", VARIANT_ID_LEN)));
        }
        if !self.files.iter().any(|f| f.target == self.stage_file) {
            return Err(incompatible(format!("stage file {} is not in the payload", self.stage_file)));
        }
        if self.files.iter().any(|f| f.target.eq_ignore_ascii_case(CONFIG_PATH)) {
            return Err(incompatible(format!("{} is reserved for the boot configuration", CONFIG_PATH)));
        }
        if let Some(code) = &self.mbr_boot_code {
            if code.len() > mbr::BOOT_CODE_LEN {
                return Err(incompatible(format!(
                    "MBR boot code is {} bytes, at most {} fit",
                    code.len(),
                    mbr::BOOT_CODE_LEN
                )));
            }
        }
        if let Some(code) = &self.vbr_boot_code {
            if code.len() > VBR_CODE_LEN {
                return Err(incompatible(format!(
                    "VBR boot code is {} bytes, at most {} fit",
                    code.len(),
                    VBR_CODE_LEN
                )));
            }
        }
        if self.mbr_boot_code.is_none() && self.boot_modes.iter().any(|m| m.boots_from_mbr()) {
            return Err(incompatible("BIOS boot needs MBR boot code".to_string()));
        }
        Ok(())
    }

    /// Bytes injection takes on a FAT32 volume with `cluster_bytes` clusters:
    /// every file and the config rounded to clusters, one cluster per new
    /// directory, and one for the root directory to grow.
    pub fn payload_bytes(&self, cluster_bytes: u64) -> u64 {
        let round = |len: u64| len.div_ceil(cluster_bytes) * cluster_bytes;
        let files: u64 = self.files.iter().map(|f| round(f.data.len() as u64)).sum();
        let mut dirs = BTreeSet::new();
        for target in self.files.iter().map(|f| f.target.as_str()).chain([CONFIG_PATH]) {
            let parts: Vec<&str> = target.split('/').filter(|p| !p.is_empty()).collect();
            for depth in 1..parts.len() {
                dirs.insert(parts[..depth].join("/").to_ascii_lowercase());
            }
        }
        files + round(CONFIG_LEN as u64) + (dirs.len() as u64 + 1) * cluster_bytes
    }
}

/// Every driver variant available to a session.
#[derive(Debug, Clone, Default)]
pub struct DriverCatalog {
    variants: Vec<DriverVariant>,
}

impl DriverCatalog {
    pub fn from_variants(variants: Vec<DriverVariant>) -> Result<Self> {
        for variant in &variants {
            variant.validate()?;
        }
        Ok(Self { variants })
    }

    /// Parse a manifest; file paths are resolved against `base`.
    pub fn from_manifest(manifest: &CatalogManifest, base: Option<&Path>) -> Result<Self> {
        let mut variants = Vec::with_capacity(manifest.variants.len());
        for variant in &manifest.variants {
            let files = variant
                .files
                .iter()
                .map(|f| {
                    Ok(DriverFile {
                        target: f.target.clone(),
                        data: f.source.load(base)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            variants.push(DriverVariant {
                id: variant.id.clone(),
                boot_modes: variant.boot_modes.clone(),
                files,
                stage_file: variant.stage_file.clone(),
                mbr_boot_code: variant.mbr_boot_code.as_ref().map(|s| s.load(base)).transpose()?,
                vbr_boot_code: variant.vbr_boot_code.as_ref().map(|s| s.load(base)).transpose()?,
            });
        }
        Self::from_variants(variants)
    }

    /// Load `<dir>/manifest.json`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_NAME);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            WinstickError::DriverIncompatible(format!("cannot read {}: {}", path.display(), e))
        })?;
        let manifest: CatalogManifest = serde_json::from_str(&text)?;
        let catalog = Self::from_manifest(&manifest, Some(dir))?;
        info!(
            "Loaded {} driver variants from {}",
            catalog.variants.len(),
            dir.display()
        );
        Ok(catalog)
    }

    /// Catalog bundled at build time from `$WINSTICK_DRIVER_DIR/manifest.json`,
    /// whose payloads must all be inline.
    #[cfg(feature = "embedded-drivers")]
    pub fn builtin() -> Result<Self> {
        const MANIFEST: &str = include_str!(concat!(env!("WINSTICK_DRIVER_DIR"), "/manifest.json"));
        let manifest: CatalogManifest = serde_json::from_str(MANIFEST)?;
        Self::from_manifest(&manifest, None)
    }

    pub fn variants(&self) -> &[DriverVariant] {
        &self.variants
    }

    /// The variant named `id` that boots `mode`.
    pub fn select(&self, id: &str, mode: BootMode) -> Result<&DriverVariant> {
        let mut named = self.variants.iter().filter(|v| v.id == id).peekable();
        if named.peek().is_none() {
            return Err(WinstickError::DriverIncompatible(format!(
                "no driver variant named '{}'",
                id
            )));
        }
        named.find(|v| v.supports(mode)).ok_or_else(|| {
            WinstickError::DriverIncompatible(format!("variant '{}' has no {} driver", id, mode))
        })
    }
}

/// Record the boot driver reads to find the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    pub flags: u16,
    pub boot_mode: BootMode,
    /// Partition holding the installer.
    pub target_start_lba: u64,
    pub target_sectors: u64,
    pub sector_size: u32,
    pub disk_signature: u32,
    pub target_guid: Uuid,
    /// Where the boot code finds the stage file.
    pub stage_lba: u64,
    pub stage_sectors: u32,
    pub variant: String,
}

fn mode_code(mode: BootMode) -> u8 {
    match mode {
        BootMode::Bios => 1,
        BootMode::Uefi => 2,
        BootMode::Hybrid => 3,
    }
}

impl BootConfig {
    /// Little-endian layout:
    /// magic, version, flags, mode, 3 reserved, start, sectors, sector size,
    /// disk signature, GUID, stage LBA, stage sectors, variant id, CRC32.
    pub fn encode(&self) -> [u8; CONFIG_LEN] {
        let mut out = [0u8; CONFIG_LEN];
        out[0..4].copy_from_slice(CONFIG_MAGIC);
        LittleEndian::write_u16(&mut out[4..6], CONFIG_VERSION);
        LittleEndian::write_u16(&mut out[6..8], self.flags);
        out[8] = mode_code(self.boot_mode);
        LittleEndian::write_u64(&mut out[12..20], self.target_start_lba);
        LittleEndian::write_u64(&mut out[20..28], self.target_sectors);
        LittleEndian::write_u32(&mut out[28..32], self.sector_size);
        LittleEndian::write_u32(&mut out[32..36], self.disk_signature);
        out[36..52].copy_from_slice(&self.target_guid.to_bytes_le());
        LittleEndian::write_u64(&mut out[52..60], self.stage_lba);
        LittleEndian::write_u32(&mut out[60..64], self.stage_sectors);
        let id = self.variant.as_bytes();
        let id_len = id.len().min(VARIANT_ID_LEN);
        out[64..64 + id_len].copy_from_slice(&id[..id_len]);
        let crc = crc32fast::hash(&out[..96]);
        LittleEndian::write_u32(&mut out[96..100], crc);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let invalid = |why: &str| WinstickError::InvalidLayout(format!("boot configuration: {}", why));
        if data.len() < CONFIG_LEN || &data[0..4] != CONFIG_MAGIC {
            return Err(invalid("missing WSBC magic"));
        }
        if LittleEndian::read_u16(&data[4..6]) != CONFIG_VERSION {
            return Err(invalid("unknown version"));
        }
        if crc32fast::hash(&data[..96]) != LittleEndian::read_u32(&data[96..100]) {
            return Err(invalid("checksum mismatch"));
        }
        let boot_mode = match data[8] {
            1 => BootMode::Bios,
            2 => BootMode::Uefi,
            3 => BootMode::Hybrid,
            _ => return Err(invalid("unknown boot mode")),
        };
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&data[36..52]);
        let id = &data[64..64 + VARIANT_ID_LEN];
        let id_len = id.iter().position(|b| *b == 0).unwrap_or(VARIANT_ID_LEN);
        Ok(Self {
            flags: LittleEndian::read_u16(&data[6..8]),
            boot_mode,
            target_start_lba: LittleEndian::read_u64(&data[12..20]),
            target_sectors: LittleEndian::read_u64(&data[20..28]),
            sector_size: LittleEndian::read_u32(&data[28..32]),
            disk_signature: LittleEndian::read_u32(&data[32..36]),
            target_guid: Uuid::from_bytes_le(guid),
            stage_lba: LittleEndian::read_u64(&data[52..60]),
            stage_sectors: LittleEndian::read_u32(&data[60..64]),
            variant: String::from_utf8_lossy(&id[..id_len]).into_owned(),
        })
    }
}

/// What injection put on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionReport {
    pub variant: String,
    pub files: Vec<String>,
    pub payload_bytes: u64,
    pub config: BootConfig,
    pub mbr_patched: bool,
    pub vbr_patched: bool,
}

/// Write `variant` into the boot partition of `layout`.
///
/// `volume` is the still-open boot volume; its directory tables are written
/// later by [`Fat32Volume::finish`]. A patched MBR replaces the LBA 0 extent
/// of `table_record`.
pub fn inject(
    device: &mut dyn BlockDevice,
    volume: &mut Fat32Volume,
    layout: &Layout,
    variant: &DriverVariant,
    table_record: &mut VerificationRecord,
) -> Result<InjectionReport> {
    let mode = layout.mode;
    if !variant.supports(mode) {
        return Err(WinstickError::DriverIncompatible(format!(
            "variant '{}' has no {} driver",
            variant.id, mode
        )));
    }
    let required = variant.payload_bytes(volume.params().cluster_bytes());
    let reserved = layout.driver_reserve.min(volume.free_bytes());
    if required > reserved {
        return Err(WinstickError::PayloadTooLarge { required, reserved });
    }
    info!(
        "Injecting driver '{}' for {} ({} bytes of {} reserved)",
        variant.id, mode, required, reserved
    );

    let mut stage = None;
    for file in &variant.files {
        let extent = volume.write_file(device, &file.target, &file.data)?;
        debug!("Driver file /{} at LBA {}", file.target, extent.start_lba);
        if file.target == variant.stage_file {
            stage = Some(extent);
        }
    }
    let stage = stage.ok_or_else(|| {
        WinstickError::DriverIncompatible(format!("stage file {} missing", variant.stage_file))
    })?;

    let target = layout.content_partition();
    let config = BootConfig {
        flags: if mode.copies_raw_volume() {
            CONFIG_FLAG_RAW_NTFS
        } else {
            0
        },
        boot_mode: mode,
        target_start_lba: target.start_lba,
        target_sectors: target.sector_count,
        sector_size: layout.geometry.sector_size,
        disk_signature: layout.table.disk_signature,
        target_guid: target.guid.unwrap_or_default(),
        stage_lba: stage.start_lba,
        stage_sectors: u32::try_from(stage.sectors).unwrap_or(u32::MAX),
        variant: variant.id.clone(),
    };
    volume.write_file(device, CONFIG_PATH, &config.encode())?;

    let mbr_patched = match (&variant.mbr_boot_code, mode.boots_from_mbr()) {
        (Some(code), true) => {
            patch_mbr(device, code, table_record)?;
            true
        }
        _ => false,
    };
    let vbr_patched = match &variant.vbr_boot_code {
        Some(code) => {
            let mut sector = volume.boot_sector();
            sector[BOOT_CODE_OFFSET..BOOT_CODE_OFFSET + VBR_CODE_LEN].fill(0);
            sector[BOOT_CODE_OFFSET..BOOT_CODE_OFFSET + code.len()].copy_from_slice(code);
            LittleEndian::write_u64(&mut sector[VBR_STAGE_LBA..], config.stage_lba);
            LittleEndian::write_u32(&mut sector[VBR_STAGE_SECTORS..], config.stage_sectors);
            volume.rewrite_boot_sectors(device, &sector)?;
            debug!("Patched volume boot record at LBA {}", volume.partition_start());
            true
        }
        None => false,
    };

    let mut files: Vec<String> = variant.files.iter().map(|f| f.target.clone()).collect();
    files.push(CONFIG_PATH.to_string());
    Ok(InjectionReport {
        variant: variant.id.clone(),
        files,
        payload_bytes: required,
        config,
        mbr_patched,
        vbr_patched,
    })
}

/// Replace MBR bytes 0..440, keeping the disk signature and partition table.
fn patch_mbr(device: &mut dyn BlockDevice, code: &[u8], record: &mut VerificationRecord) -> Result<()> {
    let sector_size = device.geometry().sector_size;
    let mut sector = device.read_sectors(0, 1)?;
    sector[..mbr::BOOT_CODE_LEN].fill(0);
    sector[..code.len()].copy_from_slice(code);
    device.write_sectors(0, &sector)?;
    record.record(0, &sector, sector_size);
    debug!("Patched MBR boot code ({} bytes)", code.len());
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fat32::{Fat32Reader, FormatOptions};
    use crate::partition::layout::FileDemand;
    use crate::partition::{plan, write_table, ContentDemand, LayoutRequest, LayoutSeed};
    use winstick_core::test_utils::MemoryDisk;

    /// One variant for BIOS with boot code and one for UEFI/hybrid.
    pub(crate) fn test_catalog() -> DriverCatalog {
        DriverCatalog::from_variants(vec![
            DriverVariant {
                id: "ntfs-boot".to_string(),
                boot_modes: vec![BootMode::Bios],
                files: vec![
                    DriverFile {
                        target: "winstick/ntfsldr.bin".to_string(),
                        data: vec![0xB0; 20_000],
                    },
                    DriverFile {
                        target: "winstick/ntfs.drv".to_string(),
                        data: vec![0xD0; 3000],
                    },
                ],
                stage_file: "winstick/ntfsldr.bin".to_string(),
                mbr_boot_code: Some(vec![0xFA; 300]),
                vbr_boot_code: Some(vec![0xEB; 120]),
            },
            DriverVariant {
                id: "ntfs-boot".to_string(),
                boot_modes: vec![BootMode::Uefi, BootMode::Hybrid],
                files: vec![
                    DriverFile {
                        target: "efi/boot/bootx64.efi".to_string(),
                        data: vec![0x4D; 40_000],
                    },
                    DriverFile {
                        target: "efi/winstick/ntfs_x64.efi".to_string(),
                        data: vec![0x5A; 60_000],
                    },
                ],
                stage_file: "efi/boot/bootx64.efi".to_string(),
                mbr_boot_code: Some(vec![0x33; 440]),
                vbr_boot_code: None,
            },
        ])
        .unwrap()
    }

    fn bios_layout(disk: &MemoryDisk) -> Layout {
        let request = LayoutRequest {
            demand: ContentDemand::Extracted {
                entries: vec![FileDemand {
                    path: "setup.exe".to_string(),
                    size: 1000,
                    is_dir: false,
                }],
            },
            driver_reserve: 0,
            seed: LayoutSeed::derive(&[b"inject"]),
        };
        plan(&disk.geometry(), BootMode::Bios, &request).unwrap()
    }

    #[test]
    fn selects_variant_by_mode() {
        let catalog = test_catalog();
        assert_eq!(catalog.select("ntfs-boot", BootMode::Bios).unwrap().files.len(), 2);
        assert!(catalog
            .select("ntfs-boot", BootMode::Hybrid)
            .unwrap()
            .supports(BootMode::Uefi));
        assert!(matches!(
            catalog.select("grub", BootMode::Uefi),
            Err(WinstickError::DriverIncompatible(_))
        ));

        let uefi_only = DriverCatalog::from_variants(vec![catalog.variants()[1].clone()]).unwrap();
        assert!(matches!(
            uefi_only.select("ntfs-boot", BootMode::Bios),
            Err(WinstickError::DriverIncompatible(_))
        ));
    }

    #[test]
    fn oversized_boot_code_is_refused() {
        let mut variant = test_catalog().variants()[0].clone();
        variant.mbr_boot_code = Some(vec![0; 441]);
        assert!(DriverCatalog::from_variants(vec![variant.clone()]).is_err());
        variant.mbr_boot_code = Some(vec![0; 440]);
        variant.vbr_boot_code = Some(vec![0; VBR_CODE_LEN + 1]);
        assert!(DriverCatalog::from_variants(vec![variant]).is_err());
    }

    #[test]
    fn config_record_round_trips_and_detects_damage() {
        let config = BootConfig {
            flags: CONFIG_FLAG_RAW_NTFS,
            boot_mode: BootMode::Hybrid,
            target_start_lba: 264_192,
            target_sectors: 12_000_000,
            sector_size: 512,
            disk_signature: 0xCAFE_F00D,
            target_guid: Uuid::from_u128(0x1234),
            stage_lba: 4200,
            stage_sectors: 80,
            variant: "ntfs-boot".to_string(),
        };
        let mut bytes = config.encode();
        assert_eq!(&bytes[0..4], b"WSBC");
        assert_eq!(BootConfig::decode(&bytes).unwrap(), config);
        bytes[20] ^= 1;
        assert!(BootConfig::decode(&bytes).is_err());
    }

    #[test]
    fn payload_counts_clusters_and_directories() {
        let catalog = test_catalog();
        let variant = &catalog.variants()[1];
        // 10 + 15 clusters of data, 1 config, dirs efi, efi/boot, efi/winstick, winstick, +1 root
        assert_eq!(variant.payload_bytes(4096), (10 + 15 + 1 + 4 + 1) * 4096);
    }

    #[test]
    fn bios_injection_patches_mbr_and_vbr() {
        let disk = MemoryDisk::with_size("usb", 256 * 1024 * 1024);
        let layout = bios_layout(&disk);
        let mut device = disk.open().unwrap();
        let mut table_record = write_table(&mut device, &layout.table).unwrap();
        let boot = layout.boot_partition().clone();
        let mut volume = Fat32Volume::format(&mut device, &boot, FormatOptions::default()).unwrap();

        let variant = test_catalog().select("ntfs-boot", BootMode::Bios).unwrap().clone();
        let report = inject(&mut device, &mut volume, &layout, &variant, &mut table_record).unwrap();
        assert!(report.mbr_patched && report.vbr_patched);
        volume.finish(&mut device).unwrap();

        let mbr_sector = device.read_sectors(0, 1).unwrap();
        assert!(mbr_sector[..300].iter().all(|b| *b == 0xFA));
        assert!(mbr_sector[300..440].iter().all(|b| *b == 0));
        let (signature, slots) = mbr::decode(&mbr_sector).unwrap();
        assert_eq!(signature, layout.table.disk_signature);
        assert_eq!(slots.len(), 1);
        let lba0 = table_record.extents.iter().find(|e| e.start_lba == 0).unwrap();
        assert_eq!(lba0.crc32, crc32fast::hash(&mbr_sector));

        let vbr = device.read_sectors(boot.start_lba, 1).unwrap();
        assert_eq!(&vbr[BOOT_CODE_OFFSET..BOOT_CODE_OFFSET + 120], &[0xEB; 120][..]);
        assert_eq!(LittleEndian::read_u64(&vbr[VBR_STAGE_LBA..]), report.config.stage_lba);
        assert_eq!(&vbr[0x52..0x5A], b"FAT32   ");
        assert_eq!(device.read_sectors(boot.start_lba + 6, 1).unwrap(), vbr);

        let mut reader = Fat32Reader::open(&mut device, boot.start_lba).unwrap();
        let config = BootConfig::decode(&reader.read_file(CONFIG_PATH).unwrap()).unwrap();
        assert_eq!(config, report.config);
        assert_eq!(config.flags, 0);
        assert_eq!(config.target_start_lba, boot.start_lba);
        assert_eq!(reader.read_file("winstick/ntfs.drv").unwrap(), vec![0xD0; 3000]);
    }

    #[test]
    fn payload_beyond_reserve_is_refused() {
        let disk = MemoryDisk::with_size("usb", 256 * 1024 * 1024);
        let layout = bios_layout(&disk);
        let mut device = disk.open().unwrap();
        let mut table_record = write_table(&mut device, &layout.table).unwrap();
        let mut volume =
            Fat32Volume::format(&mut device, layout.boot_partition(), FormatOptions::default()).unwrap();

        let mut variant = test_catalog().select("ntfs-boot", BootMode::Bios).unwrap().clone();
        variant.files[1].data = vec![0; layout.driver_reserve as usize];
        let before = disk.bytes_written();
        let err = inject(&mut device, &mut volume, &layout, &variant, &mut table_record).unwrap_err();
        assert!(matches!(err, WinstickError::PayloadTooLarge { .. }));
        assert_eq!(disk.bytes_written(), before);
    }

    #[test]
    fn manifest_directories_load_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bootx64.efi"), vec![0x11; 5000]).unwrap();
        std::fs::write(
            dir.path().join("manifest.json"),
            r#"{
                "variants": [{
                    "id": "ntfs-boot",
                    "boot_modes": ["uefi"],
                    "files": [
                        { "target": "efi/boot/bootx64.efi", "path": "bootx64.efi" },
                        { "target": "efi/winstick/readme.txt", "data": [104, 105] }
                    ],
                    "stage_file": "efi/boot/bootx64.efi"
                }]
            }"#,
        )
        .unwrap();
        let catalog = DriverCatalog::load_dir(dir.path()).unwrap();
        let variant = catalog.select("ntfs-boot", BootMode::Uefi).unwrap();
        assert_eq!(variant.files[0].data.len(), 5000);
        assert_eq!(variant.files[1].data, b"hi");
        assert!(variant.mbr_boot_code.is_none());
    }
}
