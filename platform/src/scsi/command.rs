//! SCSI command blocks and the USB bulk-only transport wrappers that carry them.
//!
//! References: SCSI Primary Commands-2 (SPC-2), SCSI Block Commands-2 (SBC-2)
//! and USB Mass Storage Class Bulk-Only Transport (BOT) rev 1.0.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// "USBC" in little endian (BOT 5.1).
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// "USBS" in little endian (BOT 5.2).
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;
pub const MAX_CDB_LEN: usize = 16;

pub const INQUIRY_LEN: u8 = 36;
pub const SENSE_LEN: u8 = 18;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x00,
    /// SPC-2 7.20
    RequestSense = 0x03,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SPC-2 7.12
    PreventAllowMediumRemoval = 0x1E,
    /// SBC-2 5.10
    ReadCapacity10 = 0x25,
    /// SBC-2 5.6
    Read10 = 0x28,
    /// SBC-2 5.25
    Write10 = 0x2A,
    /// SBC-2 5.18
    SynchronizeCache10 = 0x35,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    NonDirectional,
    DataIn,
    DataOut,
}

/// A serialized CDB plus the data phase it expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBlock {
    cdb: [u8; MAX_CDB_LEN],
    len: usize,
    pub direction: Direction,
    pub data_transfer_len: u32,
}

impl CommandBlock {
    fn new(bytes: &[u8], direction: Direction, data_transfer_len: u32) -> Self {
        let mut cdb = [0u8; MAX_CDB_LEN];
        cdb[..bytes.len()].copy_from_slice(bytes);
        Self {
            cdb,
            len: bytes.len(),
            direction,
            data_transfer_len,
        }
    }

    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.cdb[..self.len]
    }

    /// The CDB zero-padded to the 16-byte CBWCB field.
    pub fn padded(&self) -> [u8; MAX_CDB_LEN] {
        self.cdb
    }
}

/// 6-byte CDB: opcode, 3 bytes of LBA/misc, length, control.
fn six(op: OpCode, misc: [u8; 3], len: u8, direction: Direction, transfer: u32) -> CommandBlock {
    CommandBlock::new(
        &[op as u8, misc[0], misc[1], misc[2], len, 0],
        direction,
        transfer,
    )
}

/// 10-byte CDB with a big-endian LBA and transfer length.
fn ten(op: OpCode, lba: u32, blocks: u16, direction: Direction, transfer: u32) -> CommandBlock {
    let mut bytes = [0u8; 10];
    bytes[0] = op as u8;
    BigEndian::write_u32(&mut bytes[2..6], lba);
    BigEndian::write_u16(&mut bytes[7..9], blocks);
    CommandBlock::new(&bytes, direction, transfer)
}

pub fn test_unit_ready() -> CommandBlock {
    six(OpCode::TestUnitReady, [0; 3], 0, Direction::NonDirectional, 0)
}

pub fn request_sense() -> CommandBlock {
    six(
        OpCode::RequestSense,
        [0; 3],
        SENSE_LEN,
        Direction::DataIn,
        SENSE_LEN as u32,
    )
}

/// "The standard INQUIRY data shall contain at least 36 bytes" (SPC-2 table 46).
pub fn inquiry() -> CommandBlock {
    six(
        OpCode::Inquiry,
        [0; 3],
        INQUIRY_LEN,
        Direction::DataIn,
        INQUIRY_LEN as u32,
    )
}

/// PREVENT field 01b locks the medium in; 00b releases it.
pub fn prevent_allow_medium_removal(prevent: bool) -> CommandBlock {
    six(
        OpCode::PreventAllowMediumRemoval,
        [0; 3],
        prevent as u8,
        Direction::NonDirectional,
        0,
    )
}

pub fn read_capacity_10() -> CommandBlock {
    ten(OpCode::ReadCapacity10, 0, 0, Direction::DataIn, 8)
}

pub fn read_10(lba: u32, blocks: u16, block_size: u32) -> CommandBlock {
    ten(
        OpCode::Read10,
        lba,
        blocks,
        Direction::DataIn,
        blocks as u32 * block_size,
    )
}

pub fn write_10(lba: u32, blocks: u16, block_size: u32) -> CommandBlock {
    ten(
        OpCode::Write10,
        lba,
        blocks,
        Direction::DataOut,
        blocks as u32 * block_size,
    )
}

pub fn synchronize_cache_10() -> CommandBlock {
    ten(OpCode::SynchronizeCache10, 0, 0, Direction::NonDirectional, 0)
}

/// Command Block Wrapper (BOT 5.1), always 31 bytes, little endian.
pub fn encode_cbw(tag: u32, lun: u8, block: &CommandBlock) -> [u8; CBW_LEN] {
    let mut cbw = [0u8; CBW_LEN];
    LittleEndian::write_u32(&mut cbw[0..4], CBW_SIGNATURE);
    LittleEndian::write_u32(&mut cbw[4..8], tag);
    LittleEndian::write_u32(&mut cbw[8..12], block.data_transfer_len);
    cbw[12] = if block.direction == Direction::DataIn {
        0x80
    } else {
        0x00
    };
    cbw[13] = lun & 0x0F;
    cbw[14] = block.len as u8;
    cbw[15..31].copy_from_slice(&block.padded());
    cbw
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Passed,
    Failed,
    PhaseError,
}

/// Command Status Wrapper (BOT 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWrapper {
    pub tag: u32,
    pub residue: u32,
    pub status: CommandStatus,
}

pub fn decode_csw(buf: &[u8]) -> Result<StatusWrapper, String> {
    if buf.len() != CSW_LEN {
        return Err(format!("CSW is {} bytes, expected {}", buf.len(), CSW_LEN));
    }
    let signature = LittleEndian::read_u32(&buf[0..4]);
    if signature != CSW_SIGNATURE {
        return Err(format!("bad CSW signature {:#010x}", signature));
    }
    let status = match buf[12] {
        0 => CommandStatus::Passed,
        1 => CommandStatus::Failed,
        2 => CommandStatus::PhaseError,
        other => return Err(format!("reserved CSW status {}", other)),
    };
    Ok(StatusWrapper {
        tag: LittleEndian::read_u32(&buf[4..8]),
        residue: LittleEndian::read_u32(&buf[8..12]),
        status,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryData {
    pub peripheral_type: u8,
    /// RMB bit of byte 1.
    pub removable: bool,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

pub fn parse_inquiry(buf: &[u8]) -> Option<InquiryData> {
    if buf.len() < INQUIRY_LEN as usize {
        return None;
    }
    let text = |range: std::ops::Range<usize>| {
        String::from_utf8_lossy(&buf[range]).trim().to_string()
    };
    Some(InquiryData {
        peripheral_type: buf[0] & 0x1F,
        removable: buf[1] & 0x80 != 0,
        vendor: text(8..16),
        product: text(16..32),
        revision: text(32..36),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub last_lba: u32,
    pub block_len: u32,
}

impl Capacity {
    pub fn blocks(&self) -> u64 {
        self.last_lba as u64 + 1
    }
}

pub fn parse_read_capacity(buf: &[u8]) -> Option<Capacity> {
    if buf.len() < 8 {
        return None;
    }
    Some(Capacity {
        last_lba: BigEndian::read_u32(&buf[0..4]),
        block_len: BigEndian::read_u32(&buf[4..8]),
    })
}

pub const SENSE_NOT_READY: u8 = 0x02;
pub const SENSE_MEDIUM_ERROR: u8 = 0x03;
pub const SENSE_DATA_PROTECT: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

/// Fixed-format sense data (SPC-2 7.20.2).
pub fn parse_sense(buf: &[u8]) -> Option<Sense> {
    if buf.len() < 14 || buf[0] & 0x7E != 0x70 {
        return None;
    }
    Some(Sense {
        key: buf[2] & 0x0F,
        asc: buf[12],
        ascq: buf[13],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbw_layout() {
        let cbw = encode_cbw(7, 0, &inquiry());
        assert_eq!(&cbw[0..4], b"USBC");
        assert_eq!(LittleEndian::read_u32(&cbw[4..8]), 7);
        assert_eq!(LittleEndian::read_u32(&cbw[8..12]), 36);
        assert_eq!(cbw[12], 0x80);
        assert_eq!(cbw[14], 6);
        assert_eq!(cbw[15], OpCode::Inquiry as u8);
        assert_eq!(cbw[19], 36);
        assert!(cbw[21..].iter().all(|b| *b == 0));
    }

    #[test]
    fn single_byte_command_is_zero_padded() {
        let block = CommandBlock::new(&[1], Direction::NonDirectional, 0);
        let mut padded = block.padded().into_iter();
        assert_eq!(padded.next(), Some(1));
        assert!(padded.all(|b| b == 0));
    }

    #[test]
    fn read_10_is_big_endian() {
        let block = read_10(0x0102_0304, 0x0010, 512);
        assert_eq!(block.as_bytes(), &[0x28, 0, 1, 2, 3, 4, 0, 0x00, 0x10, 0]);
        assert_eq!(block.data_transfer_len, 16 * 512);
        assert_eq!(write_10(0, 1, 512).direction, Direction::DataOut);
    }

    #[test]
    fn csw_must_carry_signature() {
        let mut csw = [0u8; CSW_LEN];
        csw[0..4].copy_from_slice(b"USBS");
        LittleEndian::write_u32(&mut csw[4..8], 9);
        csw[12] = 1;
        let status = decode_csw(&csw).unwrap();
        assert_eq!(status.tag, 9);
        assert_eq!(status.status, CommandStatus::Failed);

        csw[0] = b'X';
        assert!(decode_csw(&csw).is_err());
        assert!(decode_csw(&csw[..12]).is_err());
    }

    #[test]
    fn inquiry_reports_removable_bit() {
        let mut data = [b' '; 36];
        data[0] = 0x00;
        data[1] = 0x80;
        data[8..16].copy_from_slice(b"SanDisk ");
        data[16..26].copy_from_slice(b"Cruzer Fit");
        let parsed = parse_inquiry(&data).unwrap();
        assert!(parsed.removable);
        assert_eq!(parsed.vendor, "SanDisk");
        assert_eq!(parsed.product, "Cruzer Fit");
        assert!(parse_inquiry(&data[..20]).is_none());
    }

    #[test]
    fn sense_key_extraction() {
        let mut sense = [0u8; 18];
        sense[0] = 0x70;
        sense[2] = SENSE_DATA_PROTECT;
        sense[12] = 0x27;
        let parsed = parse_sense(&sense).unwrap();
        assert_eq!(parsed.key, SENSE_DATA_PROTECT);
        assert_eq!(parsed.asc, 0x27);
    }
}
