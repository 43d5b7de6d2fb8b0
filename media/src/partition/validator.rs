// Partition table validation against known-good layouts
// Runs on every planned table before it is written

use super::mbr::{self, MbrSlot, PROTECTIVE_TYPE};
use super::{gpt, gpt_array_sectors, PartitionKind, PartitionTable, Scheme};
use log::debug;
use std::collections::HashSet;
use winstick_core::{Geometry, Result, WinstickError};

/// A table shape firmware is known to accept: scheme plus the ordered
/// partition kinds and their boot flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceLayout {
    pub name: &'static str,
    pub scheme: Scheme,
    pub partitions: &'static [(PartitionKind, bool)],
}

pub const REFERENCE_LAYOUTS: &[ReferenceLayout] = &[
    ReferenceLayout {
        name: "bios-mbr-fat32",
        scheme: Scheme::Mbr,
        partitions: &[(PartitionKind::Fat32, true)],
    },
    ReferenceLayout {
        name: "uefi-gpt-esp-data",
        scheme: Scheme::Gpt,
        partitions: &[(PartitionKind::EfiSystem, false), (PartitionKind::BasicData, false)],
    },
    ReferenceLayout {
        name: "hybrid-ee-first",
        scheme: Scheme::Hybrid,
        partitions: &[(PartitionKind::EfiSystem, true), (PartitionKind::BasicData, false)],
    },
];

fn invalid(message: String) -> WinstickError {
    WinstickError::InvalidLayout(message)
}

/// Check `table` against the device and the reference layouts. Returns the
/// reference the table matches.
pub fn validate(table: &PartitionTable, geometry: &Geometry) -> Result<&'static ReferenceLayout> {
    if table.entries.is_empty() {
        return Err(invalid("table has no partitions".to_string()));
    }

    let (first_usable, last_usable) = match table.scheme {
        Scheme::Mbr => (1, geometry.total_sectors - 1),
        Scheme::Gpt | Scheme::Hybrid => {
            let array = gpt_array_sectors(geometry.sector_size);
            if geometry.total_sectors < 2 * (2 + array) {
                return Err(invalid("device too small for a GPT".to_string()));
            }
            (2 + array, geometry.total_sectors - 2 - array)
        }
    };

    for (i, entry) in table.entries.iter().enumerate() {
        let n = i + 1;
        if entry.sector_count == 0 {
            return Err(invalid(format!("partition {} is empty", n)));
        }
        if entry.start_lba < first_usable || entry.end_lba() - 1 > last_usable {
            return Err(invalid(format!(
                "partition {} ({}..{}) lies outside usable sectors {}..={}",
                n,
                entry.start_lba,
                entry.end_lba(),
                first_usable,
                last_usable
            )));
        }
        if !geometry.is_aligned(entry.start_lba) || !geometry.is_aligned(entry.sector_count) {
            return Err(invalid(format!(
                "partition {} is not aligned to {} sectors",
                n,
                geometry.alignment_sectors()
            )));
        }
    }

    let mut sorted: Vec<_> = table.entries.iter().collect();
    sorted.sort_by_key(|e| e.start_lba);
    for pair in sorted.windows(2) {
        if pair[0].end_lba() > pair[1].start_lba {
            return Err(invalid(format!(
                "partitions at {} and {} overlap",
                pair[0].start_lba, pair[1].start_lba
            )));
        }
    }

    if table.scheme != Scheme::Mbr {
        if table.disk_guid.is_none() {
            return Err(invalid("GPT without a disk GUID".to_string()));
        }
        let mut seen = HashSet::new();
        for entry in &table.entries {
            let guid = entry
                .guid
                .ok_or_else(|| invalid(format!("partition at {} has no GUID", entry.start_lba)))?;
            if !seen.insert(guid) {
                return Err(invalid(format!("duplicate partition GUID {}", guid)));
            }
            if entry.name.encode_utf16().count() > gpt::NAME_UNITS {
                return Err(invalid(format!("partition name '{}' is too long", entry.name)));
            }
        }
    }

    let reference = REFERENCE_LAYOUTS
        .iter()
        .find(|reference| {
            reference.scheme == table.scheme
                && reference.partitions.len() == table.entries.len()
                && reference
                    .partitions
                    .iter()
                    .zip(&table.entries)
                    .all(|((kind, bootable), entry)| *kind == entry.kind && *bootable == entry.bootable)
        })
        .ok_or_else(|| {
            invalid(format!(
                "{} table with {} partitions matches no known-good layout",
                table.scheme,
                table.entries.len()
            ))
        })?;

    check_mbr(table, geometry)?;
    debug!("Table matches reference layout {}", reference.name);
    Ok(reference)
}

/// Encode the MBR the table produces, decode it again and check it says
/// what the table says.
fn check_mbr(table: &PartitionTable, geometry: &Geometry) -> Result<()> {
    let slots = mbr::slots_for(table, geometry)?;
    let (signature, decoded) = mbr::decode(&mbr::encode(&slots, table.disk_signature))?;
    if signature != table.disk_signature || decoded != slots {
        return Err(invalid("MBR does not survive encoding".to_string()));
    }

    let mirrors: &[MbrSlot] = match table.scheme {
        Scheme::Mbr => &decoded,
        Scheme::Gpt => {
            if decoded.len() != 1 || decoded[0].partition_type != PROTECTIVE_TYPE {
                return Err(invalid("GPT needs exactly one protective MBR entry".to_string()));
            }
            return Ok(());
        }
        Scheme::Hybrid => {
            let protective = decoded
                .first()
                .filter(|slot| slot.partition_type == PROTECTIVE_TYPE && slot.start_lba == 1)
                .ok_or_else(|| invalid("hybrid MBR must start with the 0xEE entry".to_string()))?;
            let first_start = table.entries.iter().map(|e| e.start_lba).min().unwrap_or(0);
            if protective.end_lba() > first_start {
                return Err(invalid("protective entry overlaps a mirrored partition".to_string()));
            }
            &decoded[1..]
        }
    };

    if mirrors.len() != table.entries.len() {
        return Err(invalid("MBR does not mirror every partition".to_string()));
    }
    for (slot, entry) in mirrors.iter().zip(&table.entries) {
        if slot.start_lba as u64 != entry.start_lba
            || slot.sector_count as u64 != entry.sector_count
            || slot.partition_type != entry.kind.mbr_type()
            || slot.active != entry.bootable
        {
            return Err(invalid(format!(
                "MBR entry at {} disagrees with the partition at {}",
                slot.start_lba, entry.start_lba
            )));
        }
    }
    if mirrors.iter().filter(|slot| slot.active).count() != 1 {
        return Err(invalid("exactly one MBR entry must be active".to_string()));
    }
    Ok(())
}
