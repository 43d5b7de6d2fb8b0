// MFT record parsing with update sequence fixups

use super::runs::{decode_data_runs, DataRun};
use super::*;
use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use winstick_core::{Result, WinstickError};

fn invalid(message: String) -> WinstickError {
    WinstickError::InvalidSource(message)
}

/// Undo the update sequence array: the last two bytes of every 512-byte
/// stride hold the sequence number and are restored from the array.
pub fn apply_fixup(buffer: &mut [u8]) -> Result<()> {
    let usa_offset = LittleEndian::read_u16(&buffer[0x04..]) as usize;
    let usa_count = LittleEndian::read_u16(&buffer[0x06..]) as usize;
    if usa_count == 0 {
        return Ok(());
    }
    if usa_offset + usa_count * 2 > buffer.len() || (usa_count - 1) * USA_STRIDE > buffer.len() {
        return Err(invalid("USA extends beyond buffer".to_string()));
    }

    let usn = [buffer[usa_offset], buffer[usa_offset + 1]];
    for i in 1..usa_count {
        let end = i * USA_STRIDE - 2;
        if buffer[end..end + 2] != usn {
            return Err(invalid(format!(
                "Fixup mismatch at stride {}: expected {:02X}{:02X}, found {:02X}{:02X}",
                i,
                usn[0],
                usn[1],
                buffer[end],
                buffer[end + 1]
            )));
        }
        let saved = usa_offset + i * 2;
        buffer[end] = buffer[saved];
        buffer[end + 1] = buffer[saved + 1];
    }
    trace!("Applied {} fixups", usa_count - 1);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeBody {
    Resident(Vec<u8>),
    NonResident {
        start_vcn: u64,
        runs: Vec<DataRun>,
        allocated_size: u64,
        data_size: u64,
        initialized_size: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub type_code: u32,
    pub name: String,
    pub flags: u16,
    pub body: AttributeBody,
}

impl Attribute {
    pub fn is_unnamed_data(&self) -> bool {
        self.type_code == ATTR_TYPE_DATA && self.name.is_empty()
    }

    pub fn resident_value(&self) -> Option<&[u8]> {
        match &self.body {
            AttributeBody::Resident(value) => Some(value),
            AttributeBody::NonResident { .. } => None,
        }
    }
}

/// $FILE_NAME contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileName {
    pub parent: u64,
    pub namespace: u8,
    pub name: String,
}

impl FileName {
    pub fn parse(value: &[u8]) -> Result<Self> {
        if value.len() < 0x42 {
            return Err(invalid("FILE_NAME attribute too small".to_string()));
        }
        let length = value[0x40] as usize;
        if value.len() < 0x42 + length * 2 {
            return Err(invalid("FILE_NAME extends beyond its value".to_string()));
        }
        let units: Vec<u16> = value[0x42..0x42 + length * 2]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .collect();
        Ok(Self {
            parent: record_number(LittleEndian::read_u64(&value[0x00..])),
            namespace: value[0x41],
            name: String::from_utf16_lossy(&units),
        })
    }
}

/// $STANDARD_INFORMATION contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StandardInformation {
    pub modified: u64,
    pub file_attributes: u32,
}

impl StandardInformation {
    pub fn parse(value: &[u8]) -> Result<Self> {
        if value.len() < 0x24 {
            return Err(invalid("STANDARD_INFORMATION too small".to_string()));
        }
        Ok(Self {
            modified: LittleEndian::read_u64(&value[0x08..]),
            file_attributes: LittleEndian::read_u32(&value[0x20..]),
        })
    }
}

/// One entry of an $ATTRIBUTE_LIST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeListEntry {
    pub type_code: u32,
    pub start_vcn: u64,
    pub record: u64,
}

pub fn parse_attribute_list(value: &[u8]) -> Result<Vec<AttributeListEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + 0x1A <= value.len() {
        let length = LittleEndian::read_u16(&value[offset + 0x04..]) as usize;
        if length < 0x1A || offset + length > value.len() {
            return Err(invalid(format!(
                "Attribute list entry at {} has length {}",
                offset, length
            )));
        }
        entries.push(AttributeListEntry {
            type_code: LittleEndian::read_u32(&value[offset..]),
            start_vcn: LittleEndian::read_u64(&value[offset + 0x08..]),
            record: record_number(LittleEndian::read_u64(&value[offset + 0x10..])),
        });
        offset += length;
    }
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct MftRecord {
    pub number: u64,
    pub flags: u16,
    /// Record number of the base record; 0 for base records.
    pub base_record: u64,
    pub attributes: Vec<Attribute>,
}

impl MftRecord {
    /// Parse a raw record. Returns `Ok(None)` for slots that were never
    /// written (no `FILE` signature).
    pub fn parse(number: u64, mut data: Vec<u8>) -> Result<Option<Self>> {
        if data.len() < 0x30 || &data[0..4] != MFT_RECORD_SIGNATURE {
            return Ok(None);
        }
        apply_fixup(&mut data)?;

        let flags = LittleEndian::read_u16(&data[0x16..]);
        let base_record = record_number(LittleEndian::read_u64(&data[0x20..]));
        let used = (LittleEndian::read_u32(&data[0x18..]) as usize).min(data.len());
        let mut offset = LittleEndian::read_u16(&data[0x14..]) as usize;
        let mut attributes = Vec::new();

        while offset + 16 <= used {
            let type_code = LittleEndian::read_u32(&data[offset..]);
            if type_code == ATTR_TYPE_END || type_code == 0 {
                break;
            }
            let length = LittleEndian::read_u32(&data[offset + 4..]) as usize;
            if length < 16 || offset + length > used {
                return Err(invalid(format!(
                    "Attribute 0x{:X} in record {} overruns the record",
                    type_code, number
                )));
            }
            attributes.push(parse_attribute(&data[offset..offset + length], type_code)?);
            offset += length;
        }

        Ok(Some(Self {
            number,
            flags,
            base_record,
            attributes,
        }))
    }

    pub fn in_use(&self) -> bool {
        self.flags & MFT_RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & MFT_RECORD_IS_DIRECTORY != 0
    }

    pub fn find(&self, type_code: u32) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |a| a.type_code == type_code)
    }
}

fn parse_attribute(raw: &[u8], type_code: u32) -> Result<Attribute> {
    let non_resident = raw[0x08] != 0;
    let name_len = raw[0x09] as usize;
    let name_offset = LittleEndian::read_u16(&raw[0x0A..]) as usize;
    let flags = LittleEndian::read_u16(&raw[0x0C..]);
    let name = if name_len == 0 {
        String::new()
    } else {
        let end = name_offset + name_len * 2;
        if end > raw.len() {
            return Err(invalid("Attribute name beyond attribute".to_string()));
        }
        let units: Vec<u16> = raw[name_offset..end]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .collect();
        String::from_utf16_lossy(&units)
    };

    let body = if !non_resident {
        if raw.len() < 0x18 {
            return Err(invalid("Resident attribute header truncated".to_string()));
        }
        let length = LittleEndian::read_u32(&raw[0x10..]) as usize;
        let offset = LittleEndian::read_u16(&raw[0x14..]) as usize;
        if offset + length > raw.len() {
            return Err(invalid("Attribute value beyond attribute".to_string()));
        }
        AttributeBody::Resident(raw[offset..offset + length].to_vec())
    } else {
        if raw.len() < 0x40 {
            return Err(invalid("Non-resident attribute header truncated".to_string()));
        }
        let runlist_offset = LittleEndian::read_u16(&raw[0x20..]) as usize;
        if runlist_offset > raw.len() {
            return Err(invalid("Runlist beyond attribute".to_string()));
        }
        AttributeBody::NonResident {
            start_vcn: LittleEndian::read_u64(&raw[0x10..]),
            runs: decode_data_runs(&raw[runlist_offset..])?,
            allocated_size: LittleEndian::read_u64(&raw[0x28..]),
            data_size: LittleEndian::read_u64(&raw[0x30..]),
            initialized_size: LittleEndian::read_u64(&raw[0x38..]),
        }
    };

    Ok(Attribute {
        type_code,
        name,
        flags,
        body,
    })
}
