// Master boot record encoding
// 440 bytes boot code, disk signature, 4 partition slots, 0x55AA

use super::{PartitionTable, Scheme};
use byteorder::{ByteOrder, LittleEndian};
use winstick_core::{Geometry, Result, WinstickError};

pub const SECTOR_LEN: usize = 512;
pub const BOOT_CODE_LEN: usize = 440;
pub const DISK_SIGNATURE_OFFSET: usize = 440;
pub const TABLE_OFFSET: usize = 446;
pub const SLOT_LEN: usize = 16;
pub const SLOT_COUNT: usize = 4;
pub const PROTECTIVE_TYPE: u8 = 0xEE;

// Standard geometry: 255 heads, 63 sectors per track
const HEADS: u64 = 255;
const SECTORS_PER_TRACK: u64 = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrSlot {
    pub active: bool,
    pub partition_type: u8,
    pub start_lba: u32,
    pub sector_count: u32,
}

impl MbrSlot {
    pub fn end_lba(&self) -> u64 {
        self.start_lba as u64 + self.sector_count as u64
    }
}

fn lba32(lba: u64, what: &str) -> Result<u32> {
    u32::try_from(lba).map_err(|_| {
        WinstickError::InvalidLayout(format!("{} {} does not fit an MBR slot", what, lba))
    })
}

/// The MBR slots a table produces on disk.
pub fn slots_for(table: &PartitionTable, geometry: &Geometry) -> Result<Vec<MbrSlot>> {
    let mirror = |table: &PartitionTable| -> Result<Vec<MbrSlot>> {
        table
            .entries
            .iter()
            .map(|entry| {
                Ok(MbrSlot {
                    active: entry.bootable,
                    partition_type: entry.kind.mbr_type(),
                    start_lba: lba32(entry.start_lba, "start LBA")?,
                    sector_count: lba32(entry.sector_count, "sector count")?,
                })
            })
            .collect()
    };

    let slots = match table.scheme {
        Scheme::Mbr => mirror(table)?,
        Scheme::Gpt => vec![MbrSlot {
            active: false,
            partition_type: PROTECTIVE_TYPE,
            start_lba: 1,
            sector_count: (geometry.total_sectors - 1).min(u32::MAX as u64) as u32,
        }],
        Scheme::Hybrid => {
            // 0xEE first, covering the GPT structures up to the first partition
            let first = table
                .entries
                .iter()
                .map(|e| e.start_lba)
                .min()
                .ok_or_else(|| WinstickError::InvalidLayout("hybrid table has no partitions".into()))?;
            let mut slots = vec![MbrSlot {
                active: false,
                partition_type: PROTECTIVE_TYPE,
                start_lba: 1,
                sector_count: lba32(first - 1, "protective size")?,
            }];
            slots.extend(mirror(table)?);
            slots
        }
    };

    if slots.len() > SLOT_COUNT {
        return Err(WinstickError::InvalidLayout(format!(
            "{} partitions do not fit the 4 MBR slots",
            slots.len()
        )));
    }
    Ok(slots)
}

fn lba_to_chs(lba: u64) -> [u8; 3] {
    let cylinder_size = HEADS * SECTORS_PER_TRACK;
    let cylinder = lba / cylinder_size;
    // If cylinder > 1023, use maximum CHS values (LBA will be used instead)
    if cylinder > 1023 {
        return [0xFE, 0xFF, 0xFF];
    }
    let temp = lba % cylinder_size;
    let head = temp / SECTORS_PER_TRACK;
    let sector = temp % SECTORS_PER_TRACK + 1; // Sectors are 1-based
    [
        head as u8,
        ((sector & 0x3F) | ((cylinder >> 2) & 0xC0)) as u8,
        (cylinder & 0xFF) as u8,
    ]
}

/// Encode an MBR sector with empty boot code.
pub fn encode(slots: &[MbrSlot], disk_signature: u32) -> [u8; SECTOR_LEN] {
    let mut mbr = [0u8; SECTOR_LEN];
    LittleEndian::write_u32(&mut mbr[DISK_SIGNATURE_OFFSET..], disk_signature);

    for (i, slot) in slots.iter().enumerate().take(SLOT_COUNT) {
        let entry = &mut mbr[TABLE_OFFSET + i * SLOT_LEN..TABLE_OFFSET + (i + 1) * SLOT_LEN];
        entry[0] = if slot.active { 0x80 } else { 0x00 };
        entry[1..4].copy_from_slice(&lba_to_chs(slot.start_lba as u64));
        entry[4] = slot.partition_type;
        entry[5..8].copy_from_slice(&lba_to_chs(slot.end_lba().saturating_sub(1)));
        LittleEndian::write_u32(&mut entry[8..12], slot.start_lba);
        LittleEndian::write_u32(&mut entry[12..16], slot.sector_count);
    }

    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    mbr
}

/// Disk signature and the non-empty slots, in slot order.
pub fn decode(sector: &[u8]) -> Result<(u32, Vec<MbrSlot>)> {
    if sector.len() < SECTOR_LEN || sector[510] != 0x55 || sector[511] != 0xAA {
        return Err(WinstickError::InvalidLayout(
            "Invalid MBR signature (expected 0x55AA)".to_string(),
        ));
    }
    let signature = LittleEndian::read_u32(&sector[DISK_SIGNATURE_OFFSET..]);
    let mut slots = Vec::new();
    for i in 0..SLOT_COUNT {
        let entry = &sector[TABLE_OFFSET + i * SLOT_LEN..TABLE_OFFSET + (i + 1) * SLOT_LEN];
        if entry[4] == 0 {
            continue;
        }
        if entry[0] != 0x00 && entry[0] != 0x80 {
            return Err(WinstickError::InvalidLayout(format!(
                "Partition {} has invalid boot flag: 0x{:02X}",
                i + 1,
                entry[0]
            )));
        }
        slots.push(MbrSlot {
            active: entry[0] == 0x80,
            partition_type: entry[4],
            start_lba: LittleEndian::read_u32(&entry[8..12]),
            sector_count: LittleEndian::read_u32(&entry[12..16]),
        });
    }
    Ok((signature, slots))
}
