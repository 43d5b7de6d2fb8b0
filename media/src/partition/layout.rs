//! Boot-mode layouts.
//!
//! [`plan`] is a pure function from device geometry, boot mode and the
//! content that has to fit, to a validated [`PartitionTable`] plus the FAT32
//! parameters of the boot partition. Nothing touches the device here, so
//! every sizing failure surfaces before the first write.

use super::{gpt_array_sectors, validator, PartitionEntry, PartitionKind, PartitionTable, Scheme};
use crate::fat32::constants::{DIR_ENTRY_LEN, MAX_FILE_SIZE};
use crate::fat32::names::{slots_for_name, validate_name};
use crate::fat32::Fat32Params;
use crate::inject::MIN_DRIVER_RESERVE;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use winstick_core::{BootMode, Geometry, Result, WinstickError};

/// Namespace for seeds derived from session inputs.
const SEED_NAMESPACE: Uuid = Uuid::from_u128(0x5c1d_8a4e_77b2_4f0e_9d3a_6e1f_0b2c_4a99);

/// ESPs are never made smaller than this.
pub const MIN_ESP_BYTES: u64 = 64 * 1024 * 1024;

pub const ESP_NAME: &str = "EFI System Partition";
pub const DATA_NAME: &str = "Basic data partition";

/// Source of every identifier written to the disk. Equal seeds give
/// byte-identical tables and volume serials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutSeed(Uuid);

impl LayoutSeed {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Seed from an ordered list of inputs, e.g. source serial, size and boot mode.
    pub fn derive(parts: &[&[u8]]) -> Self {
        let mut material = Vec::new();
        for part in parts {
            material.extend_from_slice(&(part.len() as u64).to_le_bytes());
            material.extend_from_slice(part);
        }
        Self(Uuid::new_v5(&SEED_NAMESPACE, &material))
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    pub fn guid(&self, purpose: &str) -> Uuid {
        Uuid::new_v5(&self.0, purpose.as_bytes())
    }

    /// Non-zero MBR disk signature.
    pub fn disk_signature(&self) -> u32 {
        let bytes = self.guid("mbr-disk-signature").into_bytes();
        let signature = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if signature == 0 {
            1
        } else {
            signature
        }
    }

    pub fn volume_id(&self, purpose: &str) -> u32 {
        let bytes = self.guid(purpose).into_bytes();
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])
    }
}

/// One path of an extracted tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDemand {
    /// Slash-separated path relative to the volume root.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// What the content partition must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentDemand {
    /// A raw NTFS volume of this many bytes.
    Raw { bytes: u64 },
    /// Files extracted into the FAT32 boot partition.
    Extracted { entries: Vec<FileDemand> },
}

#[derive(Debug, Clone)]
pub struct LayoutRequest {
    pub demand: ContentDemand,
    /// Bytes the driver injector needs in the boot partition.
    pub driver_reserve: u64,
    pub seed: LayoutSeed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub mode: BootMode,
    pub geometry: Geometry,
    pub table: PartitionTable,
    /// Index of the FAT32 partition the injector writes into.
    pub boot_index: usize,
    /// Index of the partition receiving the source content.
    pub content_index: usize,
    pub boot_params: Fat32Params,
    /// Cluster-rounded bytes kept free for the injector.
    pub driver_reserve: u64,
    /// Largest content the layout accepts, in bytes.
    pub content_capacity: u64,
}

impl Layout {
    pub fn boot_partition(&self) -> &PartitionEntry {
        &self.table.entries[self.boot_index]
    }

    pub fn content_partition(&self) -> &PartitionEntry {
        &self.table.entries[self.content_index]
    }
}

/// Bytes an extracted tree takes in a FAT32 volume with `cluster_bytes`
/// clusters: file data, the root directory and every subdirectory table.
pub fn extracted_bytes(entries: &[FileDemand], cluster_bytes: u64) -> Result<u64> {
    // Directory path -> 32-byte slots; the root starts with its label entry
    let mut dirs: BTreeMap<String, usize> = BTreeMap::new();
    dirs.insert(String::new(), 1);
    let mut data = 0u64;

    for entry in entries {
        let parts: Vec<&str> = entry.path.split('/').filter(|p| !p.is_empty()).collect();
        for part in &parts {
            validate_name(part)?;
        }
        for depth in 1..=parts.len() {
            let parent = parts[..depth - 1].join("/");
            let here = parts[..depth].join("/");
            let is_dir = depth < parts.len() || entry.is_dir;
            if is_dir {
                if dirs.contains_key(&here) {
                    continue;
                }
                // "." and ".."
                dirs.insert(here, 2);
            } else if entry.size > MAX_FILE_SIZE {
                return Err(WinstickError::FileTooLarge {
                    path: entry.path.clone(),
                    size: entry.size,
                });
            } else {
                data += entry.size.div_ceil(cluster_bytes) * cluster_bytes;
            }
            *dirs.entry(parent).or_insert(2) += slots_for_name(parts[depth - 1]);
        }
    }

    let tables: u64 = dirs
        .values()
        .map(|slots| ((*slots * DIR_ENTRY_LEN) as u64).div_ceil(cluster_bytes).max(1))
        .sum::<u64>()
        * cluster_bytes;
    Ok(data + tables)
}

/// Lay out the device for `mode`.
pub fn plan(geometry: &Geometry, mode: BootMode, request: &LayoutRequest) -> Result<Layout> {
    let layout = match mode {
        BootMode::Bios => plan_bios(geometry, request)?,
        BootMode::Uefi | BootMode::Hybrid => plan_gpt(geometry, mode, request)?,
    };
    validator::validate(&layout.table, geometry)?;
    info!(
        "Planned {} layout on {} sectors of {} bytes: {} partitions, {} bytes for content",
        mode,
        geometry.total_sectors,
        geometry.sector_size,
        layout.table.entries.len(),
        layout.content_capacity
    );
    Ok(layout)
}

fn reserve_for(params: &Fat32Params, requested: u64) -> u64 {
    params.round_to_clusters(requested.max(MIN_DRIVER_RESERVE))
}

fn plan_bios(geometry: &Geometry, request: &LayoutRequest) -> Result<Layout> {
    let ContentDemand::Extracted { entries } = &request.demand else {
        return Err(WinstickError::InvalidLayout(
            "BIOS media holds extracted files, not a raw volume".to_string(),
        ));
    };
    if let Some(big) = entries.iter().find(|e| !e.is_dir && e.size > MAX_FILE_SIZE) {
        return Err(WinstickError::FileTooLarge {
            path: big.path.clone(),
            size: big.size,
        });
    }

    // Stay clear of the tail that table writes clear of stale GPT backups
    let tail = 1 + gpt_array_sectors(geometry.sector_size);
    let start = geometry.align_up(1);
    let end = geometry.align_down(
        geometry
            .total_sectors
            .saturating_sub(tail)
            .min(u32::MAX as u64),
    );
    let min_sectors = Fat32Params::min_sectors(geometry.sector_size);
    if end < start + min_sectors {
        return Err(WinstickError::InsufficientSpace {
            required: start + min_sectors,
            available: geometry.total_sectors,
        });
    }
    let sectors = end - start;
    let params = Fat32Params::compute(sectors, geometry.sector_size)?;
    let reserve = reserve_for(&params, request.driver_reserve);
    let capacity = params.data_bytes().saturating_sub(reserve);
    let needed = extracted_bytes(entries, params.cluster_bytes())?;
    debug!(
        "BIOS content needs {} of {} bytes ({} reserved for the driver)",
        needed, capacity, reserve
    );
    if needed > capacity {
        return Err(WinstickError::InsufficientSpace {
            required: geometry.bytes_to_sectors(needed),
            available: capacity / geometry.sector_size as u64,
        });
    }

    let table = PartitionTable {
        scheme: Scheme::Mbr,
        disk_signature: request.seed.disk_signature(),
        disk_guid: None,
        entries: vec![PartitionEntry {
            start_lba: start,
            sector_count: sectors,
            kind: PartitionKind::Fat32,
            bootable: true,
            name: String::new(),
            guid: None,
        }],
    };
    Ok(Layout {
        mode: BootMode::Bios,
        geometry: *geometry,
        table,
        boot_index: 0,
        content_index: 0,
        boot_params: params,
        driver_reserve: reserve,
        content_capacity: capacity,
    })
}

/// Smallest aligned ESP whose FAT32 data area holds `reserve` bytes plus
/// the root directory.
fn esp_sectors(geometry: &Geometry, reserve: u64) -> Result<(u64, Fat32Params)> {
    let floor = geometry
        .bytes_to_sectors(MIN_ESP_BYTES)
        .max(Fat32Params::min_sectors(geometry.sector_size));
    let mut sectors = geometry.align_up(floor);
    loop {
        let params = Fat32Params::compute(sectors, geometry.sector_size)?;
        let usable = params.data_bytes().saturating_sub(params.cluster_bytes());
        if usable >= params.round_to_clusters(reserve) {
            return Ok((sectors, params));
        }
        let shortfall = params.round_to_clusters(reserve) - usable;
        sectors = geometry.align_up(sectors + geometry.bytes_to_sectors(shortfall));
    }
}

fn plan_gpt(geometry: &Geometry, mode: BootMode, request: &LayoutRequest) -> Result<Layout> {
    let ContentDemand::Raw { bytes } = request.demand else {
        return Err(WinstickError::InvalidLayout(format!(
            "{} media copies the source volume raw",
            mode
        )));
    };

    let array = gpt_array_sectors(geometry.sector_size);
    let reserve_request = request.driver_reserve.max(MIN_DRIVER_RESERVE);
    let (esp_len, params) = esp_sectors(geometry, reserve_request)?;
    let reserve = reserve_for(&params, request.driver_reserve);
    let esp_start = geometry.align_up(2 + array);
    let data_start = esp_start + esp_len;

    // GPT keeps the backup array and header past the last usable sector;
    // hybrid mirrors must fit 32-bit MBR fields.
    let mut usable_end = geometry.total_sectors.saturating_sub(1 + array);
    if mode == BootMode::Hybrid {
        usable_end = usable_end.min(u32::MAX as u64);
    }
    let data_end = geometry.align_down(usable_end);
    let needed = geometry.bytes_to_sectors(bytes).max(1);
    if data_end < data_start + needed {
        let available = data_end.saturating_sub(data_start);
        return Err(WinstickError::InsufficientSpace {
            required: needed,
            available,
        });
    }
    let data_len = data_end - data_start;
    debug!(
        "ESP {} sectors at {}, data {} sectors at {} for a {}-byte volume",
        esp_len, esp_start, data_len, data_start, bytes
    );

    let hybrid = mode == BootMode::Hybrid;
    let table = PartitionTable {
        scheme: if hybrid { Scheme::Hybrid } else { Scheme::Gpt },
        disk_signature: request.seed.disk_signature(),
        disk_guid: Some(request.seed.guid("disk")),
        entries: vec![
            PartitionEntry {
                start_lba: esp_start,
                sector_count: esp_len,
                kind: PartitionKind::EfiSystem,
                bootable: hybrid,
                name: ESP_NAME.to_string(),
                guid: Some(request.seed.guid("esp")),
            },
            PartitionEntry {
                start_lba: data_start,
                sector_count: data_len,
                kind: PartitionKind::BasicData,
                bootable: false,
                name: DATA_NAME.to_string(),
                guid: Some(request.seed.guid("data")),
            },
        ],
    };
    Ok(Layout {
        mode,
        geometry: *geometry,
        table,
        boot_index: 0,
        content_index: 1,
        boot_params: params,
        driver_reserve: reserve,
        content_capacity: data_len * geometry.sector_size as u64,
    })
}
