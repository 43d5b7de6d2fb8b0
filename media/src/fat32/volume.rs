//! Write-once FAT32 volume construction.
//!
//! Files are laid out contiguously in creation order, so each file is one
//! extent on disk. Directory tables, both FATs and the FSInfo sector are
//! kept in memory and written by [`Fat32Volume::finish`].

use super::boot_sector::{build_boot_sector, build_fs_info, label_bytes, VolumeIdentity};
use super::constants::*;
use super::names::{generate_alias, lfn_entries, lfn_entry_count, plain_short_name, validate_name};
use super::params::Fat32Params;
use super::timestamps::DosTimestamp;
use crate::partition::PartitionEntry;
use crate::verify::VerificationRecord;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, trace};
use std::collections::{HashMap, HashSet};
use std::io;
use winstick_core::{BlockDevice, Result, WinstickError};

#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub label: String,
    pub volume_id: u32,
    /// Stamped on every directory entry.
    pub timestamp: DosTimestamp,
    /// Sectors per device write.
    pub batch_sectors: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            label: "WINSTICK".to_string(),
            volume_id: 0,
            timestamp: DosTimestamp::EPOCH,
            batch_sectors: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub read_only: bool,
    pub hidden: bool,
    pub system: bool,
    pub archive: bool,
}

impl FileAttributes {
    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.read_only {
            bits |= ATTR_READ_ONLY;
        }
        if self.hidden {
            bits |= ATTR_HIDDEN;
        }
        if self.system {
            bits |= ATTR_SYSTEM;
        }
        if self.archive {
            bits |= ATTR_ARCHIVE;
        }
        bits
    }
}

/// Where a finished file landed on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtent {
    pub first_cluster: u32,
    /// Absolute device LBA of the first data sector; 0 for empty files.
    pub start_lba: u64,
    pub sectors: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    File,
    Directory(usize),
}

#[derive(Debug)]
struct Node {
    name: String,
    short: [u8; 11],
    nt_flags: u8,
    needs_lfn: bool,
    attributes: u8,
    first_cluster: u32,
    size: u32,
    kind: NodeKind,
}

#[derive(Debug, Default)]
struct Directory {
    parent: Option<usize>,
    children: Vec<Node>,
    /// Upper-cased long names to child index.
    lookup: HashMap<String, usize>,
    short_names: HashSet<[u8; 11]>,
    slots: usize,
    first_cluster: u32,
}

pub struct Fat32Volume {
    params: Fat32Params,
    partition_start: u64,
    options: FormatOptions,
    fat: Vec<u32>,
    next_free: u32,
    dirs: Vec<Directory>,
    record: VerificationRecord,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

impl Fat32Volume {
    /// Write the reserved region of a fresh FAT32 volume into `partition`.
    pub fn format(
        device: &mut dyn BlockDevice,
        partition: &PartitionEntry,
        options: FormatOptions,
    ) -> Result<Self> {
        let geometry = device.geometry();
        let params = Fat32Params::compute(partition.sector_count, geometry.sector_size)?;
        let hidden_sectors = u32::try_from(partition.start_lba).unwrap_or(u32::MAX);
        info!(
            "Formatting FAT32 '{}' at LBA {}: {} clusters of {} bytes, FAT {} sectors",
            options.label,
            partition.start_lba,
            params.cluster_count,
            params.cluster_bytes(),
            params.sectors_per_fat
        );

        let mut volume = Self {
            params,
            partition_start: partition.start_lba,
            fat: vec![0; params.cluster_count as usize + 2],
            next_free: FAT32_ROOT_CLUSTER + 1,
            dirs: vec![Directory {
                first_cluster: FAT32_ROOT_CLUSTER,
                // Volume label entry
                slots: 1,
                ..Directory::default()
            }],
            record: VerificationRecord::new(&format!("fat32@{}", partition.start_lba)),
            options,
        };
        volume.fat[0] = 0x0FFF_FF00 | MEDIA_FIXED as u32;
        volume.fat[1] = FAT32_MASK;
        volume.fat[FAT32_ROOT_CLUSTER as usize] = FAT32_EOC;

        let identity = volume.identity(hidden_sectors);
        let boot = build_boot_sector(&params, &identity);
        let fs_info = build_fs_info(params.bytes_per_sector, FSI_UNKNOWN, FSI_UNKNOWN);
        let ss = params.bytes_per_sector as usize;
        let mut reserved = vec![0u8; params.reserved_sectors as usize * ss];
        for (sector, data) in [
            (0usize, &boot),
            (FAT32_FS_INFO_SECTOR as usize, &fs_info),
            (FAT32_BACKUP_BOOT_SECTOR as usize, &boot),
            (FAT32_BACKUP_BOOT_SECTOR as usize + 1, &fs_info),
        ] {
            reserved[sector * ss..(sector + 1) * ss].copy_from_slice(data);
        }
        device.write_sectors(volume.partition_start, &reserved)?;

        // Boot and FSInfo sectors get their own extents; they are rewritten later
        let bk = FAT32_BACKUP_BOOT_SECTOR as usize;
        for range in [0..1, 1..2, 2..bk, bk..bk + 1, bk + 1..bk + 2, bk + 2..reserved.len() / ss] {
            volume.record.record(
                volume.partition_start + range.start as u64,
                &reserved[range.start * ss..range.end * ss],
                params.bytes_per_sector,
            );
        }
        Ok(volume)
    }

    fn identity(&self, hidden_sectors: u32) -> VolumeIdentity {
        VolumeIdentity {
            oem_name: *b"WINSTICK",
            volume_id: self.options.volume_id,
            volume_label: label_bytes(&self.options.label),
            hidden_sectors,
        }
    }

    pub fn params(&self) -> &Fat32Params {
        &self.params
    }

    pub fn partition_start(&self) -> u64 {
        self.partition_start
    }

    /// Clusters not yet handed out, in bytes.
    pub fn free_bytes(&self) -> u64 {
        self.free_clusters() as u64 * self.params.cluster_bytes()
    }

    fn free_clusters(&self) -> u32 {
        self.params.cluster_count + 2 - self.next_free
    }

    /// The boot sector as written by `format`, before any boot code patch.
    pub fn boot_sector(&self) -> Vec<u8> {
        let hidden = u32::try_from(self.partition_start).unwrap_or(u32::MAX);
        build_boot_sector(&self.params, &self.identity(hidden))
    }

    /// Rewrite the primary and backup boot sectors.
    pub fn rewrite_boot_sectors(&mut self, device: &mut dyn BlockDevice, sector: &[u8]) -> Result<()> {
        for offset in [0, FAT32_BACKUP_BOOT_SECTOR as u64] {
            let lba = self.partition_start + offset;
            device.write_sectors(lba, sector)?;
            self.record.record(lba, sector, self.params.bytes_per_sector);
        }
        Ok(())
    }

    /// Resolve a directory path, creating missing components.
    fn ensure_dir(&mut self, parts: &[&str]) -> Result<usize> {
        let mut current = 0usize;
        for part in parts {
            current = match self.lookup(current, part) {
                Some(index) => match self.dirs[current].children[index].kind {
                    NodeKind::Directory(dir) => dir,
                    NodeKind::File => {
                        return Err(WinstickError::InvalidName(format!(
                            "'{}' exists and is not a directory",
                            part
                        )))
                    }
                },
                None => {
                    let dir = self.dirs.len();
                    self.add_node(current, part, ATTR_DIRECTORY, NodeKind::Directory(dir))?;
                    self.dirs.push(Directory {
                        parent: Some(current),
                        // "." and ".."
                        slots: 2,
                        ..Directory::default()
                    });
                    dir
                }
            };
        }
        Ok(current)
    }

    fn lookup(&self, dir: usize, name: &str) -> Option<usize> {
        self.dirs[dir].lookup.get(&name.to_uppercase()).copied()
    }

    fn add_node(&mut self, dir: usize, name: &str, attributes: u8, kind: NodeKind) -> Result<usize> {
        validate_name(name)?;
        if self.lookup(dir, name).is_some() {
            return Err(WinstickError::InvalidName(format!("'{}' already exists", name)));
        }
        let directory = &mut self.dirs[dir];
        // A plain 8.3 name colliding with an earlier alias falls back to an alias of its own
        let plain = plain_short_name(name).filter(|(short, _)| !directory.short_names.contains(short));
        let (short, nt_flags, needs_lfn) = match plain {
            Some((short, flags)) => (short, flags, false),
            None => (generate_alias(name, &directory.short_names)?, 0, true),
        };
        let slots = if needs_lfn { 1 + lfn_entry_count(name) } else { 1 };
        if directory.slots + slots > MAX_DIR_ENTRIES {
            return Err(WinstickError::Other(format!(
                "directory is full, cannot add '{}'",
                name
            )));
        }
        directory.short_names.insert(short);
        directory.slots += slots;
        directory.lookup.insert(name.to_uppercase(), directory.children.len());
        directory.children.push(Node {
            name: name.to_string(),
            short,
            nt_flags,
            needs_lfn,
            attributes,
            first_cluster: 0,
            size: 0,
            kind,
        });
        Ok(directory.children.len() - 1)
    }

    /// Create a directory and any missing parents.
    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        let parts = split_path(path);
        if parts.is_empty() {
            return Ok(());
        }
        self.ensure_dir(&parts)?;
        debug!("Created directory /{}", parts.join("/"));
        Ok(())
    }

    /// Start a file. Data goes through the returned writer, which must be
    /// finished for the file to get its size and cluster chain.
    pub fn create_file<'a>(
        &'a mut self,
        device: &'a mut dyn BlockDevice,
        path: &str,
        size_hint: u64,
    ) -> Result<FileWriter<'a>> {
        let parts = split_path(path);
        let Some((name, parents)) = parts.split_last() else {
            return Err(WinstickError::InvalidName(format!("'{}' names no file", path)));
        };
        if size_hint > MAX_FILE_SIZE {
            return Err(WinstickError::FileTooLarge {
                path: path.to_string(),
                size: size_hint,
            });
        }
        let needed = size_hint.div_ceil(self.params.cluster_bytes());
        if needed > self.free_clusters() as u64 {
            return Err(WinstickError::InsufficientSpace {
                required: needed * self.params.sectors_per_cluster as u64,
                available: self.free_clusters() as u64 * self.params.sectors_per_cluster as u64,
            });
        }

        let dir = self.ensure_dir(parents)?;
        let index = self.add_node(dir, name, ATTR_ARCHIVE, NodeKind::File)?;
        let batch = (self.options.batch_sectors as u64 * self.params.bytes_per_sector as u64)
            .max(self.params.cluster_bytes());
        let batch = self.params.round_to_clusters(batch) as usize;
        trace!("Creating /{} ({} bytes expected)", parts.join("/"), size_hint);

        Ok(FileWriter {
            volume: self,
            device,
            path: path.to_string(),
            dir,
            index,
            buffer: Vec::with_capacity(batch),
            batch,
            length: 0,
            first_cluster: 0,
            clusters: 0,
        })
    }

    /// Create a file from an in-memory buffer.
    pub fn write_file(
        &mut self,
        device: &mut dyn BlockDevice,
        path: &str,
        data: &[u8],
    ) -> Result<FileExtent> {
        let mut writer = self.create_file(device, path, data.len() as u64)?;
        io::Write::write_all(&mut writer, data)?;
        writer.finish()
    }

    pub fn set_attributes(&mut self, path: &str, attributes: FileAttributes) -> Result<()> {
        let parts = split_path(path);
        let Some((name, parents)) = parts.split_last() else {
            return Err(WinstickError::InvalidName("the root has no attributes".to_string()));
        };
        let mut dir = 0usize;
        for part in parents {
            dir = match self.lookup(dir, part).map(|i| self.dirs[dir].children[i].kind) {
                Some(NodeKind::Directory(d)) => d,
                _ => return Err(WinstickError::InvalidName(format!("no directory '{}'", part))),
            };
        }
        let index = self
            .lookup(dir, name)
            .ok_or_else(|| WinstickError::InvalidName(format!("no entry '{}'", path)))?;
        let node = &mut self.dirs[dir].children[index];
        node.attributes = attributes.bits() | (node.attributes & ATTR_DIRECTORY);
        Ok(())
    }

    /// Hand out `count` contiguous clusters.
    fn allocate(&mut self, count: u32) -> Result<u32> {
        if count > self.free_clusters() {
            return Err(WinstickError::InsufficientSpace {
                required: count as u64 * self.params.sectors_per_cluster as u64,
                available: self.free_clusters() as u64 * self.params.sectors_per_cluster as u64,
            });
        }
        let start = self.next_free;
        self.next_free += count;
        Ok(start)
    }

    fn link_chain(&mut self, first: u32, count: u32) {
        for cluster in first..first + count {
            self.fat[cluster as usize] = if cluster + 1 == first + count {
                FAT32_EOC
            } else {
                cluster + 1
            };
        }
    }

    fn write_clusters(&mut self, device: &mut dyn BlockDevice, cluster: u32, data: &[u8]) -> Result<()> {
        let lba = self.partition_start + self.params.cluster_sector(cluster);
        device.write_sectors(lba, data)?;
        self.record.record(lba, data, self.params.bytes_per_sector);
        Ok(())
    }

    fn dir_clusters(&self, dir: usize) -> u32 {
        let bytes = (self.dirs[dir].slots * DIR_ENTRY_LEN) as u64;
        bytes.div_ceil(self.params.cluster_bytes()).max(1) as u32
    }

    fn short_entry(&self, short: &[u8; 11], nt_flags: u8, attributes: u8, cluster: u32, size: u32) -> [u8; DIR_ENTRY_LEN] {
        let ts = self.options.timestamp;
        let mut entry = [0u8; DIR_ENTRY_LEN];
        entry[0..11].copy_from_slice(short);
        entry[11] = attributes;
        entry[12] = nt_flags;
        LittleEndian::write_u16(&mut entry[14..16], ts.time);
        LittleEndian::write_u16(&mut entry[16..18], ts.date);
        LittleEndian::write_u16(&mut entry[18..20], ts.date);
        LittleEndian::write_u16(&mut entry[20..22], (cluster >> 16) as u16);
        LittleEndian::write_u16(&mut entry[22..24], ts.time);
        LittleEndian::write_u16(&mut entry[24..26], ts.date);
        LittleEndian::write_u16(&mut entry[26..28], (cluster & 0xFFFF) as u16);
        LittleEndian::write_u32(&mut entry[28..32], size);
        entry
    }

    fn serialize_dir(&self, dir: usize) -> Vec<u8> {
        let directory = &self.dirs[dir];
        let mut table = Vec::with_capacity(directory.slots * DIR_ENTRY_LEN);
        match directory.parent {
            None => {
                let label = label_bytes(&self.options.label);
                table.extend_from_slice(&self.short_entry(&label, 0, ATTR_VOLUME_ID, 0, 0));
            }
            Some(parent) => {
                // ".." of a root child points at cluster 0
                let parent_cluster = if parent == 0 { 0 } else { self.dirs[parent].first_cluster };
                table.extend_from_slice(&self.short_entry(b".          ", 0, ATTR_DIRECTORY, directory.first_cluster, 0));
                table.extend_from_slice(&self.short_entry(b"..         ", 0, ATTR_DIRECTORY, parent_cluster, 0));
            }
        }
        for node in &directory.children {
            if node.needs_lfn {
                for lfn in lfn_entries(&node.name, &node.short) {
                    table.extend_from_slice(&lfn);
                }
            }
            let cluster = match node.kind {
                NodeKind::Directory(d) => self.dirs[d].first_cluster,
                NodeKind::File => node.first_cluster,
            };
            table.extend_from_slice(&self.short_entry(&node.short, node.nt_flags, node.attributes, cluster, node.size));
        }
        let padded = self.dir_clusters(dir) as u64 * self.params.cluster_bytes();
        table.resize(padded as usize, 0);
        table
    }

    fn write_fat_copies(&mut self, device: &mut dyn BlockDevice) -> Result<()> {
        let ss = self.params.bytes_per_sector as usize;
        let mut bytes = vec![0u8; self.params.sectors_per_fat as usize * ss];
        for (i, entry) in self.fat.iter().enumerate() {
            LittleEndian::write_u32(&mut bytes[i * 4..i * 4 + 4], *entry);
        }
        let batch = (self.options.batch_sectors.max(1) as usize) * ss;
        for copy in 0..FAT32_NUM_FATS {
            let base = self.partition_start + self.params.fat_start(copy);
            for (i, chunk) in bytes.chunks(batch).enumerate() {
                let lba = base + (i * batch / ss) as u64;
                device.write_sectors(lba, chunk)?;
                self.record.record(lba, chunk, self.params.bytes_per_sector);
            }
        }
        Ok(())
    }

    /// Write directory tables, both FATs and FSInfo. Returns the record of
    /// every extent written to this volume.
    pub fn finish(mut self, device: &mut dyn BlockDevice) -> Result<VerificationRecord> {
        // Root keeps cluster 2; any overflow continues elsewhere in the chain
        let root_clusters = self.dir_clusters(0);
        let root_tail = if root_clusters > 1 {
            Some(self.allocate(root_clusters - 1)?)
        } else {
            None
        };
        for dir in 1..self.dirs.len() {
            let count = self.dir_clusters(dir);
            let first = self.allocate(count)?;
            self.dirs[dir].first_cluster = first;
            self.link_chain(first, count);
        }
        if let Some(tail) = root_tail {
            self.fat[FAT32_ROOT_CLUSTER as usize] = tail;
            self.link_chain(tail, root_clusters - 1);
        }

        let cluster_bytes = self.params.cluster_bytes() as usize;
        for dir in 0..self.dirs.len() {
            let table = self.serialize_dir(dir);
            let first = self.dirs[dir].first_cluster;
            match (dir, root_tail) {
                (0, Some(tail)) => {
                    self.write_clusters(device, first, &table[..cluster_bytes])?;
                    self.write_clusters(device, tail, &table[cluster_bytes..])?;
                }
                _ => self.write_clusters(device, first, &table)?,
            }
        }
        debug!("Wrote {} directory tables", self.dirs.len());

        self.write_fat_copies(device)?;

        let fs_info = build_fs_info(self.params.bytes_per_sector, self.free_clusters(), self.next_free);
        for offset in [FAT32_FS_INFO_SECTOR as u64, FAT32_BACKUP_BOOT_SECTOR as u64 + 1] {
            let lba = self.partition_start + offset;
            device.write_sectors(lba, &fs_info)?;
            self.record.record(lba, &fs_info, self.params.bytes_per_sector);
        }
        info!(
            "FAT32 at LBA {} finished: {} of {} clusters used",
            self.partition_start,
            self.next_free - 2,
            self.params.cluster_count
        );
        Ok(self.record)
    }
}

/// Streams one file's data to consecutive clusters.
pub struct FileWriter<'a> {
    volume: &'a mut Fat32Volume,
    device: &'a mut dyn BlockDevice,
    path: String,
    dir: usize,
    index: usize,
    buffer: Vec<u8>,
    batch: usize,
    length: u64,
    first_cluster: u32,
    clusters: u32,
}

impl FileWriter<'_> {
    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let cluster_bytes = self.volume.params.cluster_bytes() as usize;
        let count = self.buffer.len().div_ceil(cluster_bytes) as u32;
        let start = self.volume.allocate(count)?;
        if self.first_cluster == 0 {
            self.first_cluster = start;
        }
        // Only the final flush can be short; pad it to whole sectors
        let ss = self.volume.params.bytes_per_sector as usize;
        let padded = self.buffer.len().div_ceil(ss) * ss;
        self.buffer.resize(padded, 0);
        let data = std::mem::take(&mut self.buffer);
        self.volume.write_clusters(self.device, start, &data)?;
        self.clusters += count;
        self.buffer = data;
        self.buffer.clear();
        Ok(())
    }

    /// Bytes accepted so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn finish(mut self) -> Result<FileExtent> {
        self.flush_buffer()?;
        if self.clusters > 0 {
            self.volume.link_chain(self.first_cluster, self.clusters);
        }
        let size = self.length as u32;
        let node = &mut self.volume.dirs[self.dir].children[self.index];
        node.first_cluster = self.first_cluster;
        node.size = size;

        let params = &self.volume.params;
        Ok(FileExtent {
            first_cluster: self.first_cluster,
            start_lba: if self.clusters > 0 {
                self.volume.partition_start + params.cluster_sector(self.first_cluster)
            } else {
                0
            },
            sectors: self.clusters as u64 * params.sectors_per_cluster as u64,
            size,
        })
    }
}

impl io::Write for FileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.length + buf.len() as u64 > MAX_FILE_SIZE {
            return Err(WinstickError::FileTooLarge {
                path: self.path.clone(),
                size: self.length + buf.len() as u64,
            }
            .into());
        }
        let take = buf.len().min(self.batch - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..take]);
        self.length += take as u64;
        if self.buffer.len() == self.batch {
            self.flush_buffer()?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
