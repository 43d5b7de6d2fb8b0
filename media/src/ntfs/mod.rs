// NTFS read support for source images
// Only what extraction needs: boot sector, MFT records, attributes, runlists

pub mod boot_sector;
pub mod record;
pub mod runs;
pub mod volume;

pub use boot_sector::NtfsBootSector;
pub use record::{Attribute, AttributeBody, FileName, MftRecord, StandardInformation};
pub use runs::{decode_data_runs, DataRun};
pub use volume::{DataSource, NtfsNode, NtfsVolume, StreamReader};

pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
pub const MFT_RECORD_SIGNATURE: &[u8; 4] = b"FILE";

// Standard MFT record numbers
pub const MFT_RECORD_MFT: u64 = 0;
pub const MFT_RECORD_ROOT: u64 = 5;
/// Records below this are reserved for metadata files.
pub const FIRST_USER_RECORD: u64 = 24;

// Attribute type codes
pub const ATTR_TYPE_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_TYPE_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_TYPE_FILE_NAME: u32 = 0x30;
pub const ATTR_TYPE_DATA: u32 = 0x80;
pub const ATTR_TYPE_END: u32 = 0xFFFF_FFFF;

// MFT record flags
pub const MFT_RECORD_IN_USE: u16 = 0x0001;
pub const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;

// Attribute flags
pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSE: u16 = 0x8000;

// File name namespaces
pub const FILE_NAME_POSIX: u8 = 0x00;
pub const FILE_NAME_WIN32: u8 = 0x01;
pub const FILE_NAME_DOS: u8 = 0x02;
pub const FILE_NAME_WIN32_AND_DOS: u8 = 0x03;

// DOS file attribute bits in $STANDARD_INFORMATION
pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0004;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0020;

/// Update sequence arrays protect every 512 bytes of a record.
pub const USA_STRIDE: usize = 512;

/// Low 48 bits of a file reference are the record number.
pub fn record_number(reference: u64) -> u64 {
    reference & 0x0000_FFFF_FFFF_FFFF
}
