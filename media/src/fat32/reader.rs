// FAT32 reader over a block device partition
// Used to check freshly built volumes and by `inspect`

use super::constants::*;
use super::names::{decode_lfn, format_short_name};
use byteorder::{ByteOrder, LittleEndian};
use log::info;
use winstick_core::{BlockDevice, Result, WinstickError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatDirEntry {
    pub name: String,
    pub short_name: String,
    pub is_directory: bool,
    pub size: u32,
    pub cluster: u32,
    pub attributes: u8,
}

/// Boot sector fields the reader relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfo {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub sectors_per_fat: u32,
    pub total_sectors: u32,
    pub root_cluster: u32,
    pub volume_id: u32,
    pub label: String,
}

pub struct Fat32Reader<'a> {
    device: &'a mut dyn BlockDevice,
    start_lba: u64,
    boot: BootInfo,
}

impl<'a> Fat32Reader<'a> {
    /// Open the FAT32 volume starting at `start_lba`.
    pub fn open(device: &'a mut dyn BlockDevice, start_lba: u64) -> Result<Self> {
        let sector = device.read_sectors(start_lba, 1)?;
        if sector[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2] != BOOT_SIGNATURE
            || &sector[BS32_FIL_SYS_TYPE..BS32_FIL_SYS_TYPE + 8] != b"FAT32   "
        {
            return Err(WinstickError::InvalidLayout(format!(
                "no FAT32 boot sector at LBA {}",
                start_lba
            )));
        }
        let boot = BootInfo {
            bytes_per_sector: LittleEndian::read_u16(&sector[BPB_BYTES_PER_SEC..]) as u32,
            sectors_per_cluster: sector[BPB_SEC_PER_CLUS] as u32,
            reserved_sectors: LittleEndian::read_u16(&sector[BPB_RSVD_SEC_CNT..]) as u32,
            num_fats: sector[BPB_NUM_FATS] as u32,
            sectors_per_fat: LittleEndian::read_u32(&sector[BPB_FAT_SZ32..]),
            total_sectors: LittleEndian::read_u32(&sector[BPB_TOT_SEC32..]),
            root_cluster: LittleEndian::read_u32(&sector[BPB_ROOT_CLUS..]),
            volume_id: LittleEndian::read_u32(&sector[BS32_VOL_ID..]),
            label: String::from_utf8_lossy(&sector[BS32_VOL_LAB..BS32_VOL_LAB + 11])
                .trim_end()
                .to_string(),
        };
        if boot.bytes_per_sector != device.geometry().sector_size || boot.sectors_per_cluster == 0 {
            return Err(WinstickError::InvalidLayout(format!(
                "FAT32 at LBA {} has an unusable BPB",
                start_lba
            )));
        }
        info!(
            "FAT32 at LBA {}: label '{}', {} sectors per cluster",
            start_lba, boot.label, boot.sectors_per_cluster
        );
        Ok(Self {
            device,
            start_lba,
            boot,
        })
    }

    pub fn boot_info(&self) -> &BootInfo {
        &self.boot
    }

    fn cluster_bytes(&self) -> usize {
        (self.boot.bytes_per_sector * self.boot.sectors_per_cluster) as usize
    }

    fn cluster_lba(&self, cluster: u32) -> u64 {
        let data_start = self.boot.reserved_sectors as u64
            + self.boot.num_fats as u64 * self.boot.sectors_per_fat as u64;
        self.start_lba + data_start + (cluster as u64 - 2) * self.boot.sectors_per_cluster as u64
    }

    /// Entry `cluster` of FAT copy `copy`.
    pub fn fat_entry(&mut self, copy: u32, cluster: u32) -> Result<u32> {
        let bps = self.boot.bytes_per_sector as u64;
        let offset = cluster as u64 * 4;
        let lba = self.start_lba
            + self.boot.reserved_sectors as u64
            + copy as u64 * self.boot.sectors_per_fat as u64
            + offset / bps;
        let sector = self.device.read_sectors(lba, 1)?;
        let within = (offset % bps) as usize;
        Ok(LittleEndian::read_u32(&sector[within..within + 4]) & FAT32_MASK)
    }

    /// Free cluster count and next-free hint from FSInfo.
    pub fn fs_info(&mut self) -> Result<(u32, u32)> {
        let sector = self
            .device
            .read_sectors(self.start_lba + FAT32_FS_INFO_SECTOR as u64, 1)?;
        if LittleEndian::read_u32(&sector[FSI_LEAD_SIG_OFFSET..]) != FSI_LEAD_SIG {
            return Err(WinstickError::InvalidLayout("bad FSInfo signature".to_string()));
        }
        Ok((
            LittleEndian::read_u32(&sector[FSI_FREE_COUNT_OFFSET..]),
            LittleEndian::read_u32(&sector[FSI_NXT_FREE_OFFSET..]),
        ))
    }

    pub fn chain(&mut self, first: u32) -> Result<Vec<u32>> {
        let limit = self.boot.total_sectors / self.boot.sectors_per_cluster.max(1) + 2;
        let mut chain = Vec::new();
        let mut cluster = first;
        while (2..FAT32_EOC).contains(&cluster) {
            if chain.len() as u32 > limit {
                return Err(WinstickError::InvalidLayout(format!(
                    "cluster chain from {} loops",
                    first
                )));
            }
            chain.push(cluster);
            cluster = self.fat_entry(0, cluster)?;
        }
        Ok(chain)
    }

    fn read_chain(&mut self, first: u32, limit: Option<usize>) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        for cluster in self.chain(first)? {
            let lba = self.cluster_lba(cluster);
            data.extend(self.device.read_sectors(lba, self.boot.sectors_per_cluster as u64)?);
            if limit.map_or(false, |limit| data.len() >= limit) {
                break;
            }
        }
        if let Some(limit) = limit {
            data.truncate(limit);
        }
        Ok(data)
    }

    fn parse_dir(&mut self, cluster: u32) -> Result<Vec<FatDirEntry>> {
        let table = self.read_chain(cluster, None)?;
        let mut entries = Vec::new();
        let mut pending_lfn: Vec<[u8; DIR_ENTRY_LEN]> = Vec::new();
        for raw in table.chunks_exact(DIR_ENTRY_LEN) {
            match raw[0] {
                0x00 => break,
                0xE5 => {
                    pending_lfn.clear();
                    continue;
                }
                _ => {}
            }
            let attributes = raw[11];
            if attributes == ATTR_LONG_NAME {
                let mut entry = [0u8; DIR_ENTRY_LEN];
                entry.copy_from_slice(raw);
                pending_lfn.push(entry);
                continue;
            }
            if attributes & ATTR_VOLUME_ID != 0 || raw[0] == b'.' {
                pending_lfn.clear();
                continue;
            }
            let mut short = [0u8; 11];
            short.copy_from_slice(&raw[0..11]);
            let short_name = format_short_name(&short, raw[12]);
            let name = if pending_lfn.is_empty() {
                short_name.clone()
            } else {
                decode_lfn(&pending_lfn)
            };
            pending_lfn.clear();
            entries.push(FatDirEntry {
                name,
                short_name,
                is_directory: attributes & ATTR_DIRECTORY != 0,
                size: LittleEndian::read_u32(&raw[28..32]),
                cluster: (LittleEndian::read_u16(&raw[20..22]) as u32) << 16
                    | LittleEndian::read_u16(&raw[26..28]) as u32,
                attributes,
            });
        }
        Ok(entries)
    }

    fn resolve(&mut self, path: &str) -> Result<Option<FatDirEntry>> {
        let mut cluster = self.boot.root_cluster;
        let mut found = None;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if found.as_ref().map_or(false, |e: &FatDirEntry| !e.is_directory) {
                return Ok(None);
            }
            let entries = self.parse_dir(cluster)?;
            let Some(entry) = entries
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(part) || e.short_name.eq_ignore_ascii_case(part))
            else {
                return Ok(None);
            };
            cluster = entry.cluster;
            found = Some(entry);
        }
        Ok(found)
    }

    /// Entries of a directory; `""` or `"/"` is the root.
    pub fn list(&mut self, path: &str) -> Result<Vec<FatDirEntry>> {
        let cluster = match self.resolve(path)? {
            Some(entry) if entry.is_directory => entry.cluster,
            Some(_) => {
                return Err(WinstickError::InvalidName(format!("'{}' is not a directory", path)))
            }
            None if path.trim_matches('/').is_empty() => self.boot.root_cluster,
            None => return Err(WinstickError::InvalidName(format!("no directory '{}'", path))),
        };
        self.parse_dir(cluster)
    }

    pub fn stat(&mut self, path: &str) -> Result<Option<FatDirEntry>> {
        self.resolve(path)
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let entry = self
            .resolve(path)?
            .filter(|e| !e.is_directory)
            .ok_or_else(|| WinstickError::InvalidName(format!("no file '{}'", path)))?;
        if entry.size == 0 {
            return Ok(Vec::new());
        }
        self.read_chain(entry.cluster, Some(entry.size as usize))
    }

    /// Every file and directory below the root, depth first, with full paths.
    pub fn walk(&mut self) -> Result<Vec<(String, FatDirEntry)>> {
        let mut out = Vec::new();
        let mut stack = vec![(String::new(), self.boot.root_cluster)];
        while let Some((prefix, cluster)) = stack.pop() {
            for entry in self.parse_dir(cluster)? {
                let path = format!("{}/{}", prefix, entry.name);
                if entry.is_directory {
                    stack.push((path.clone(), entry.cluster));
                }
                out.push((path, entry));
            }
        }
        Ok(out)
    }

    /// Whether every FAT copy matches the first.
    pub fn fats_match(&mut self) -> Result<bool> {
        let first = self.start_lba + self.boot.reserved_sectors as u64;
        let spf = self.boot.sectors_per_fat as u64;
        let reference = self.device.read_sectors(first, spf)?;
        for copy in 1..self.boot.num_fats as u64 {
            if self.device.read_sectors(first + copy * spf, spf)? != reference {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Cluster size in bytes, for callers sizing reads.
    pub fn cluster_size(&self) -> usize {
        self.cluster_bytes()
    }
}
