// FAT32 on-disk constants (Microsoft FAT specification 1.03)

// Boot sector offsets
pub const BS_JMP_BOOT: usize = 0x00;
pub const BS_OEM_NAME: usize = 0x03;
pub const BPB_BYTES_PER_SEC: usize = 0x0B;
pub const BPB_SEC_PER_CLUS: usize = 0x0D;
pub const BPB_RSVD_SEC_CNT: usize = 0x0E;
pub const BPB_NUM_FATS: usize = 0x10;
pub const BPB_MEDIA: usize = 0x15;
pub const BPB_SEC_PER_TRK: usize = 0x18;
pub const BPB_NUM_HEADS: usize = 0x1A;
pub const BPB_HIDD_SEC: usize = 0x1C;
pub const BPB_TOT_SEC32: usize = 0x20;

// FAT32-specific offsets (start at 36)
pub const BPB_FAT_SZ32: usize = 0x24;
pub const BPB_EXT_FLAGS: usize = 0x28;
pub const BPB_FS_VER: usize = 0x2A;
pub const BPB_ROOT_CLUS: usize = 0x2C;
pub const BPB_FS_INFO: usize = 0x30;
pub const BPB_BK_BOOT_SEC: usize = 0x32;
pub const BS32_DRV_NUM: usize = 0x40;
pub const BS32_BOOT_SIG: usize = 0x42;
pub const BS32_VOL_ID: usize = 0x43;
pub const BS32_VOL_LAB: usize = 0x47;
pub const BS32_FIL_SYS_TYPE: usize = 0x52;

/// First byte after the BPB; boot code starts here.
pub const BOOT_CODE_OFFSET: usize = 0x5A;

// Boot sector signature
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;

// FSInfo sector
pub const FSI_LEAD_SIG: u32 = 0x4161_5252;
pub const FSI_STRUC_SIG: u32 = 0x6141_7272;
pub const FSI_TRAIL_SIG: u32 = 0xAA55_0000;
pub const FSI_LEAD_SIG_OFFSET: usize = 0x000;
pub const FSI_STRUC_SIG_OFFSET: usize = 0x1E4;
pub const FSI_FREE_COUNT_OFFSET: usize = 0x1E8;
pub const FSI_NXT_FREE_OFFSET: usize = 0x1EC;
pub const FSI_TRAIL_SIG_OFFSET: usize = 0x1FC;
pub const FSI_UNKNOWN: u32 = 0xFFFF_FFFF;

// FAT entry values
pub const FAT32_EOC: u32 = 0x0FFF_FFF8; // End of chain marker (28 bits)
pub const FAT32_MASK: u32 = 0x0FFF_FFFF;

// Cluster count thresholds
pub const FAT32_MIN_CLUSTERS: u32 = 65525;
pub const FAT32_MAX_CLUSTERS: u32 = 0x0FFF_FFF5;

// Standard values
pub const FAT32_RESERVED_SECTORS: u32 = 32;
pub const FAT32_NUM_FATS: u32 = 2;
pub const FAT32_ROOT_CLUSTER: u32 = 2;
pub const FAT32_FS_INFO_SECTOR: u16 = 1;
pub const FAT32_BACKUP_BOOT_SECTOR: u16 = 6;
pub const MEDIA_FIXED: u8 = 0xF8;

// Directory entries
pub const DIR_ENTRY_LEN: usize = 32;
pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = 0x0F;
pub const LFN_LAST_ENTRY: u8 = 0x40;
pub const LFN_CHARS_PER_ENTRY: usize = 13;
pub const MAX_LFN_UNITS: usize = 255;
/// Directories are capped at 65536 32-byte entries.
pub const MAX_DIR_ENTRIES: usize = 65536;

// NT reserved byte (offset 12) case flags for 8.3 names
pub const NT_LOWER_BASE: u8 = 0x08;
pub const NT_LOWER_EXT: u8 = 0x10;

/// The largest file size a directory entry can express.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;
