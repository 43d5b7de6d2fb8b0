//! Partition table construction, encoding and decoding.
//!
//! A [`PartitionTable`] is the scheme-independent description of what goes
//! on the disk. [`layout::plan`] produces one for a boot mode, the validator
//! checks it against known-good shapes, and [`write_table`] / [`read_table`]
//! move it between memory and the device.

pub mod gpt;
pub mod layout;
pub mod mbr;
pub mod validator;

#[cfg(test)]
mod tests;

use crate::verify::VerificationRecord;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use uuid::Uuid;
use winstick_core::{BlockDevice, Geometry, Result, WinstickError};

pub use layout::{plan, ContentDemand, Layout, LayoutRequest, LayoutSeed};
pub use validator::{validate, ReferenceLayout, REFERENCE_LAYOUTS};

/// EFI System Partition type GUID.
pub const ESP_TYPE_GUID: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
/// Microsoft basic data partition type GUID.
pub const BASIC_DATA_TYPE_GUID: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    Mbr,
    Gpt,
    /// GPT plus an MBR that mirrors its partitions for legacy firmware.
    Hybrid,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Mbr => write!(f, "MBR"),
            Scheme::Gpt => write!(f, "GPT"),
            Scheme::Hybrid => write!(f, "hybrid GPT/MBR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    EfiSystem,
    BasicData,
    /// FAT32 (LBA) on a plain MBR disk.
    Fat32,
}

impl PartitionKind {
    pub fn mbr_type(self) -> u8 {
        match self {
            PartitionKind::EfiSystem => 0xEF,
            PartitionKind::BasicData => 0x07,
            PartitionKind::Fat32 => 0x0C,
        }
    }

    pub fn gpt_type(self) -> Uuid {
        match self {
            PartitionKind::EfiSystem => ESP_TYPE_GUID,
            PartitionKind::BasicData | PartitionKind::Fat32 => BASIC_DATA_TYPE_GUID,
        }
    }

    pub fn from_mbr_type(code: u8) -> Option<Self> {
        match code {
            0xEF => Some(PartitionKind::EfiSystem),
            0x07 => Some(PartitionKind::BasicData),
            0x0B | 0x0C => Some(PartitionKind::Fat32),
            _ => None,
        }
    }

    pub fn from_gpt_type(guid: &Uuid) -> Option<Self> {
        if *guid == ESP_TYPE_GUID {
            Some(PartitionKind::EfiSystem)
        } else if *guid == BASIC_DATA_TYPE_GUID {
            Some(PartitionKind::BasicData)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub start_lba: u64,
    pub sector_count: u64,
    pub kind: PartitionKind,
    pub bootable: bool,
    /// GPT partition name; empty on MBR-only disks.
    pub name: String,
    /// Unique partition GUID; `None` on MBR-only disks.
    pub guid: Option<Uuid>,
}

impl PartitionEntry {
    /// First sector past the partition.
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.sector_count
    }

    pub fn sectors(&self) -> Range<u64> {
        self.start_lba..self.end_lba()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    pub scheme: Scheme,
    /// Written at MBR offset 440 in every scheme.
    pub disk_signature: u32,
    pub disk_guid: Option<Uuid>,
    pub entries: Vec<PartitionEntry>,
}

/// Number of sectors holding the 128-entry GPT array.
pub fn gpt_array_sectors(sector_size: u32) -> u64 {
    (gpt::ENTRY_COUNT as u64 * gpt::ENTRY_LEN as u64).div_ceil(sector_size as u64)
}

/// Sectors rewritten by [`write_table`]: the MBR with the primary GPT area
/// behind it, and the backup GPT area at the end of the disk. MBR-only
/// tables clear both GPT areas so stale headers cannot shadow the new table.
pub fn footprint(geometry: &Geometry) -> Result<[Range<u64>; 2]> {
    let array = gpt_array_sectors(geometry.sector_size);
    let head = 0..2 + array;
    let tail_start = geometry
        .total_sectors
        .checked_sub(1 + array)
        .filter(|start| *start >= head.end)
        .ok_or_else(|| {
            WinstickError::InvalidLayout(format!(
                "{} sectors cannot hold both GPT areas of {} sectors",
                geometry.total_sectors,
                head.end
            ))
        })?;
    Ok([head, tail_start..geometry.total_sectors])
}

/// Serialize a table into the two runs of sectors listed by [`footprint`].
pub fn encode_table(table: &PartitionTable, geometry: &Geometry) -> Result<Vec<(u64, Vec<u8>)>> {
    let ss = geometry.sector_size as usize;
    let [head_range, tail_range] = footprint(geometry)?;
    let mut head = vec![0u8; (head_range.end - head_range.start) as usize * ss];
    let mut tail = vec![0u8; (tail_range.end - tail_range.start) as usize * ss];

    let slots = mbr::slots_for(table, geometry)?;
    head[..mbr::SECTOR_LEN].copy_from_slice(&mbr::encode(&slots, table.disk_signature));

    if table.scheme != Scheme::Mbr {
        let disk_guid = table.disk_guid.ok_or_else(|| {
            WinstickError::InvalidLayout("GPT table without a disk GUID".to_string())
        })?;
        let array = gpt::encode_entries(&table.entries)?;
        let primary = gpt::encode_header(&gpt::HeaderFields::primary(geometry, disk_guid), &array);
        let backup = gpt::encode_header(&gpt::HeaderFields::backup(geometry, disk_guid), &array);

        head[ss..ss + gpt::HEADER_LEN].copy_from_slice(&primary);
        head[2 * ss..2 * ss + array.len()].copy_from_slice(&array);
        tail[..array.len()].copy_from_slice(&array);
        let backup_offset = tail.len() - ss;
        tail[backup_offset..backup_offset + gpt::HEADER_LEN].copy_from_slice(&backup);
    }

    Ok(vec![(head_range.start, head), (tail_range.start, tail)])
}

/// Write the table to the device and return a record of what was written.
pub fn write_table(device: &mut dyn BlockDevice, table: &PartitionTable) -> Result<VerificationRecord> {
    let geometry = device.geometry();
    let mut record = VerificationRecord::new("partition-table");

    info!(
        "Writing {} partition table to {} ({} entries, signature 0x{:08X})",
        table.scheme,
        device.id(),
        table.entries.len(),
        table.disk_signature
    );
    for entry in &table.entries {
        info!(
            "  {:?}: LBA {}..{} ({} MiB){}",
            entry.kind,
            entry.start_lba,
            entry.end_lba(),
            entry.sector_count * geometry.sector_size as u64 / (1024 * 1024),
            if entry.bootable { ", bootable" } else { "" }
        );
    }

    // MBR and its sector are recorded on their own so boot code patches
    // can replace that extent later.
    for (lba, data) in encode_table(table, &geometry)? {
        device.write_sectors(lba, &data)?;
        let ss = geometry.sector_size as usize;
        if lba == 0 {
            record.record(0, &data[..ss], geometry.sector_size);
            record.record(1, &data[ss..], geometry.sector_size);
        } else {
            record.record(lba, &data, geometry.sector_size);
        }
        debug!("Wrote {} table sectors at LBA {}", data.len() / ss, lba);
    }
    Ok(record)
}

/// Decode whatever table the device carries.
pub fn read_table(device: &mut dyn BlockDevice) -> Result<PartitionTable> {
    let geometry = device.geometry();
    let sector0 = device.read_sectors(0, 1)?;
    let (disk_signature, slots) = mbr::decode(&sector0)?;

    let protective = slots
        .iter()
        .any(|slot| slot.partition_type == mbr::PROTECTIVE_TYPE);
    if !protective {
        let entries = slots
            .iter()
            .map(|slot| {
                let kind = PartitionKind::from_mbr_type(slot.partition_type).ok_or_else(|| {
                    WinstickError::InvalidLayout(format!(
                        "unsupported MBR partition type 0x{:02X}",
                        slot.partition_type
                    ))
                })?;
                Ok(PartitionEntry {
                    start_lba: slot.start_lba as u64,
                    sector_count: slot.sector_count as u64,
                    kind,
                    bootable: slot.active,
                    name: String::new(),
                    guid: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(PartitionTable {
            scheme: Scheme::Mbr,
            disk_signature,
            disk_guid: None,
            entries,
        });
    }

    let header = device.read_sectors(1, 1)?;
    let fields = gpt::decode_header(&header)?;
    let array_sectors = gpt_array_sectors(geometry.sector_size);
    let array = device.read_sectors(fields.entries_lba, array_sectors)?;
    let entries = gpt::decode_entries(&array, fields.entries_crc)?;

    let scheme = if slots.len() > 1 {
        Scheme::Hybrid
    } else {
        Scheme::Gpt
    };
    Ok(PartitionTable {
        scheme,
        disk_signature,
        disk_guid: Some(fields.disk_guid),
        entries,
    })
}
