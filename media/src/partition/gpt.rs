// GUID partition table headers and entry arrays (UEFI 2.x, chapter 5)

use super::{gpt_array_sectors, PartitionEntry, PartitionKind};
use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;
use winstick_core::{Geometry, Result, WinstickError};

pub const SIGNATURE: &[u8; 8] = b"EFI PART";
pub const REVISION: u32 = 0x0001_0000;
pub const HEADER_LEN: usize = 92;
pub const ENTRY_COUNT: u32 = 128;
pub const ENTRY_LEN: usize = 128;
pub const NAME_UNITS: usize = 36;

/// Attribute bit 2: legacy BIOS bootable.
pub const ATTR_LEGACY_BOOTABLE: u64 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFields {
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub entries_lba: u64,
    pub entries_crc: u32,
}

impl HeaderFields {
    pub fn primary(geometry: &Geometry, disk_guid: Uuid) -> Self {
        let array = gpt_array_sectors(geometry.sector_size);
        Self {
            current_lba: 1,
            backup_lba: geometry.total_sectors - 1,
            first_usable_lba: 2 + array,
            last_usable_lba: geometry.total_sectors - 2 - array,
            disk_guid,
            entries_lba: 2,
            entries_crc: 0,
        }
    }

    /// The backup header swaps current/backup and points at the array
    /// stored just before it.
    pub fn backup(geometry: &Geometry, disk_guid: Uuid) -> Self {
        let array = gpt_array_sectors(geometry.sector_size);
        Self {
            current_lba: geometry.total_sectors - 1,
            backup_lba: 1,
            entries_lba: geometry.total_sectors - 1 - array,
            ..Self::primary(geometry, disk_guid)
        }
    }
}

pub fn encode_header(fields: &HeaderFields, array: &[u8]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..8].copy_from_slice(SIGNATURE);
    LittleEndian::write_u32(&mut header[8..12], REVISION);
    LittleEndian::write_u32(&mut header[12..16], HEADER_LEN as u32);
    // CRC32 of header at offset 16 is calculated last
    LittleEndian::write_u64(&mut header[24..32], fields.current_lba);
    LittleEndian::write_u64(&mut header[32..40], fields.backup_lba);
    LittleEndian::write_u64(&mut header[40..48], fields.first_usable_lba);
    LittleEndian::write_u64(&mut header[48..56], fields.last_usable_lba);
    header[56..72].copy_from_slice(&fields.disk_guid.to_bytes_le());
    LittleEndian::write_u64(&mut header[72..80], fields.entries_lba);
    LittleEndian::write_u32(&mut header[80..84], ENTRY_COUNT);
    LittleEndian::write_u32(&mut header[84..88], ENTRY_LEN as u32);
    LittleEndian::write_u32(&mut header[88..92], crc32fast::hash(array));

    let crc = crc32fast::hash(&header);
    LittleEndian::write_u32(&mut header[16..20], crc);
    header
}

pub fn decode_header(sector: &[u8]) -> Result<HeaderFields> {
    if sector.len() < HEADER_LEN || &sector[0..8] != SIGNATURE {
        return Err(WinstickError::InvalidLayout(
            "missing EFI PART signature".to_string(),
        ));
    }
    let header_len = LittleEndian::read_u32(&sector[12..16]) as usize;
    if header_len < HEADER_LEN || header_len > sector.len() {
        return Err(WinstickError::InvalidLayout(format!(
            "GPT header size {} is invalid",
            header_len
        )));
    }
    let mut copy = sector[..header_len].to_vec();
    let stored = LittleEndian::read_u32(&copy[16..20]);
    copy[16..20].fill(0);
    let actual = crc32fast::hash(&copy);
    if stored != actual {
        return Err(WinstickError::InvalidLayout(format!(
            "GPT header CRC mismatch: stored {:08x}, computed {:08x}",
            stored, actual
        )));
    }
    let count = LittleEndian::read_u32(&sector[80..84]);
    let entry_len = LittleEndian::read_u32(&sector[84..88]) as usize;
    if count != ENTRY_COUNT || entry_len != ENTRY_LEN {
        return Err(WinstickError::InvalidLayout(format!(
            "unsupported GPT array of {} entries x {} bytes",
            count, entry_len
        )));
    }

    let mut guid = [0u8; 16];
    guid.copy_from_slice(&sector[56..72]);
    Ok(HeaderFields {
        current_lba: LittleEndian::read_u64(&sector[24..32]),
        backup_lba: LittleEndian::read_u64(&sector[32..40]),
        first_usable_lba: LittleEndian::read_u64(&sector[40..48]),
        last_usable_lba: LittleEndian::read_u64(&sector[48..56]),
        disk_guid: Uuid::from_bytes_le(guid),
        entries_lba: LittleEndian::read_u64(&sector[72..80]),
        entries_crc: LittleEndian::read_u32(&sector[88..92]),
    })
}

/// The full 128-entry array; unused entries stay zero.
pub fn encode_entries(entries: &[PartitionEntry]) -> Result<Vec<u8>> {
    let mut array = vec![0u8; ENTRY_COUNT as usize * ENTRY_LEN];
    if entries.len() > ENTRY_COUNT as usize {
        return Err(WinstickError::InvalidLayout(format!(
            "{} partitions exceed the GPT array",
            entries.len()
        )));
    }

    for (i, entry) in entries.iter().enumerate() {
        let guid = entry.guid.ok_or_else(|| {
            WinstickError::InvalidLayout(format!("GPT partition {} has no unique GUID", i + 1))
        })?;
        let name: Vec<u16> = entry.name.encode_utf16().collect();
        if name.len() > NAME_UNITS {
            return Err(WinstickError::InvalidLayout(format!(
                "partition name '{}' exceeds {} UTF-16 units",
                entry.name, NAME_UNITS
            )));
        }

        let raw = &mut array[i * ENTRY_LEN..(i + 1) * ENTRY_LEN];
        raw[0..16].copy_from_slice(&entry.kind.gpt_type().to_bytes_le());
        raw[16..32].copy_from_slice(&guid.to_bytes_le());
        LittleEndian::write_u64(&mut raw[32..40], entry.start_lba);
        // Last LBA is inclusive
        LittleEndian::write_u64(&mut raw[40..48], entry.end_lba() - 1);
        let attributes = if entry.bootable { ATTR_LEGACY_BOOTABLE } else { 0 };
        LittleEndian::write_u64(&mut raw[48..56], attributes);
        for (j, unit) in name.iter().enumerate() {
            LittleEndian::write_u16(&mut raw[56 + j * 2..58 + j * 2], *unit);
        }
    }
    Ok(array)
}

pub fn decode_entries(array: &[u8], expected_crc: u32) -> Result<Vec<PartitionEntry>> {
    let len = ENTRY_COUNT as usize * ENTRY_LEN;
    if array.len() < len {
        return Err(WinstickError::InvalidLayout("truncated GPT entry array".to_string()));
    }
    let actual = crc32fast::hash(&array[..len]);
    if actual != expected_crc {
        return Err(WinstickError::InvalidLayout(format!(
            "GPT entry array CRC mismatch: stored {:08x}, computed {:08x}",
            expected_crc, actual
        )));
    }

    let mut entries = Vec::new();
    for raw in array[..len].chunks_exact(ENTRY_LEN) {
        let mut type_bytes = [0u8; 16];
        type_bytes.copy_from_slice(&raw[0..16]);
        let type_guid = Uuid::from_bytes_le(type_bytes);
        if type_guid.is_nil() {
            continue;
        }
        let kind = PartitionKind::from_gpt_type(&type_guid).ok_or_else(|| {
            WinstickError::InvalidLayout(format!("unsupported GPT partition type {}", type_guid))
        })?;
        let mut unique = [0u8; 16];
        unique.copy_from_slice(&raw[16..32]);
        let first = LittleEndian::read_u64(&raw[32..40]);
        let last = LittleEndian::read_u64(&raw[40..48]);
        if last < first {
            return Err(WinstickError::InvalidLayout(format!(
                "GPT partition ends ({}) before it starts ({})",
                last, first
            )));
        }
        let units: Vec<u16> = raw[56..56 + NAME_UNITS * 2]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .take_while(|u| *u != 0)
            .collect();

        entries.push(PartitionEntry {
            start_lba: first,
            sector_count: last - first + 1,
            kind,
            bootable: LittleEndian::read_u64(&raw[48..56]) & ATTR_LEGACY_BOOTABLE != 0,
            name: String::from_utf16_lossy(&units),
            guid: Some(Uuid::from_bytes_le(unique)),
        });
    }
    Ok(entries)
}
