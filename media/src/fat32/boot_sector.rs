// Boot sector and FSInfo builders for FAT32

use super::constants::*;
use super::params::Fat32Params;
use byteorder::{ByteOrder, LittleEndian};

/// Volume identity written into the extended BPB.
#[derive(Debug, Clone)]
pub struct VolumeIdentity {
    pub oem_name: [u8; 8],
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    /// Partition start LBA on the disk.
    pub hidden_sectors: u32,
}

/// Build a FAT32 boot sector, zero-padded to the sector size.
pub fn build_boot_sector(params: &Fat32Params, identity: &VolumeIdentity) -> Vec<u8> {
    let mut boot_sector = vec![0u8; params.bytes_per_sector as usize];

    // Jump instruction
    boot_sector[BS_JMP_BOOT] = 0xEB;
    boot_sector[BS_JMP_BOOT + 1] = 0x58;
    boot_sector[BS_JMP_BOOT + 2] = 0x90;

    boot_sector[BS_OEM_NAME..BS_OEM_NAME + 8].copy_from_slice(&identity.oem_name);

    // BPB common fields
    LittleEndian::write_u16(
        &mut boot_sector[BPB_BYTES_PER_SEC..],
        params.bytes_per_sector as u16,
    );
    boot_sector[BPB_SEC_PER_CLUS] = params.sectors_per_cluster as u8;
    LittleEndian::write_u16(
        &mut boot_sector[BPB_RSVD_SEC_CNT..],
        params.reserved_sectors as u16,
    );
    boot_sector[BPB_NUM_FATS] = FAT32_NUM_FATS as u8;
    // Root entry count, 16-bit total and 16-bit FAT size stay zero for FAT32
    boot_sector[BPB_MEDIA] = MEDIA_FIXED;
    LittleEndian::write_u16(&mut boot_sector[BPB_SEC_PER_TRK..], 63);
    LittleEndian::write_u16(&mut boot_sector[BPB_NUM_HEADS..], 255);
    LittleEndian::write_u32(&mut boot_sector[BPB_HIDD_SEC..], identity.hidden_sectors);
    LittleEndian::write_u32(&mut boot_sector[BPB_TOT_SEC32..], params.total_sectors);

    // FAT32 extended BPB
    LittleEndian::write_u32(&mut boot_sector[BPB_FAT_SZ32..], params.sectors_per_fat);
    LittleEndian::write_u16(&mut boot_sector[BPB_EXT_FLAGS..], 0); // Mirroring enabled
    LittleEndian::write_u16(&mut boot_sector[BPB_FS_VER..], 0);
    LittleEndian::write_u32(&mut boot_sector[BPB_ROOT_CLUS..], FAT32_ROOT_CLUSTER);
    LittleEndian::write_u16(&mut boot_sector[BPB_FS_INFO..], FAT32_FS_INFO_SECTOR);
    LittleEndian::write_u16(&mut boot_sector[BPB_BK_BOOT_SEC..], FAT32_BACKUP_BOOT_SECTOR);

    boot_sector[BS32_DRV_NUM] = 0x80; // Hard disk
    boot_sector[BS32_BOOT_SIG] = 0x29; // Extended boot signature
    LittleEndian::write_u32(&mut boot_sector[BS32_VOL_ID..], identity.volume_id);
    boot_sector[BS32_VOL_LAB..BS32_VOL_LAB + 11].copy_from_slice(&identity.volume_label);
    boot_sector[BS32_FIL_SYS_TYPE..BS32_FIL_SYS_TYPE + 8].copy_from_slice(b"FAT32   ");

    boot_sector[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2].copy_from_slice(&BOOT_SIGNATURE);
    boot_sector
}

/// Build an FSInfo sector. Unknown counts are written as 0xFFFFFFFF.
pub fn build_fs_info(bytes_per_sector: u32, free_count: u32, next_free: u32) -> Vec<u8> {
    let mut sector = vec![0u8; bytes_per_sector as usize];
    LittleEndian::write_u32(&mut sector[FSI_LEAD_SIG_OFFSET..], FSI_LEAD_SIG);
    LittleEndian::write_u32(&mut sector[FSI_STRUC_SIG_OFFSET..], FSI_STRUC_SIG);
    LittleEndian::write_u32(&mut sector[FSI_FREE_COUNT_OFFSET..], free_count);
    LittleEndian::write_u32(&mut sector[FSI_NXT_FREE_OFFSET..], next_free);
    LittleEndian::write_u32(&mut sector[FSI_TRAIL_SIG_OFFSET..], FSI_TRAIL_SIG);
    sector
}

/// Space-padded, upper-cased 11-byte label; characters outside printable
/// ASCII become underscores.
pub fn label_bytes(label: &str) -> [u8; 11] {
    let mut bytes = [b' '; 11];
    for (slot, ch) in bytes.iter_mut().zip(label.chars()) {
        *slot = if ch.is_ascii_graphic() || ch == ' ' {
            ch.to_ascii_uppercase() as u8
        } else {
            b'_'
        };
    }
    bytes
}
