//! Source installer images.
//!
//! An image is either a bare NTFS volume or a disk image (MBR or GPT) with
//! an NTFS partition. [`SourceImage`] finds the volume and scans its
//! metadata once. Content is then read one of two ways:
//!
//! - [`SourceImage::raw_range`] passes volume bytes through unchanged, used
//!   when the whole volume is copied into a data partition.
//! - [`SourceImage::entries`] consumes the image and yields every file and
//!   directory once, in parent-before-child order, with a lazy content stream.

use crate::fat32::{DosTimestamp, FileAttributes};
use crate::ntfs::{
    DataSource, NtfsBootSector, NtfsNode, NtfsVolume, StreamReader, FILE_ATTRIBUTE_ARCHIVE,
    FILE_ATTRIBUTE_HIDDEN, FILE_ATTRIBUTE_READONLY, FILE_ATTRIBUTE_SYSTEM, MFT_RECORD_ROOT,
};
use crate::partition::layout::FileDemand;
use crate::partition::{gpt, mbr};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use winstick_core::{Result, WinstickError};

/// Images are addressed in 512-byte sectors regardless of the target device.
const IMAGE_SECTOR: u64 = 512;

/// Deepest directory nesting accepted before a parent loop is assumed.
const MAX_DEPTH: usize = 256;

/// Root-level metadata that never belongs on installer media.
const SKIPPED_ROOT_NAMES: &[&str] = &["System Volume Information"];

/// Where the NTFS volume was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Container {
    /// The image is the volume.
    Bare,
    /// Partition `index` of an MBR disk image.
    Mbr { index: usize },
    /// Entry `index` of a GPT disk image.
    Gpt { index: usize },
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Container::Bare => write!(f, "bare NTFS volume"),
            Container::Mbr { index } => write!(f, "MBR partition {}", index + 1),
            Container::Gpt { index } => write!(f, "GPT entry {}", index + 1),
        }
    }
}

/// Metadata of one entry, available before any content is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub path: Vec<String>,
    pub size: u64,
    pub is_dir: bool,
    pub attributes: FileAttributes,
    pub modified: DosTimestamp,
    node: usize,
}

impl EntryInfo {
    /// Slash-joined path relative to the volume root.
    pub fn path_string(&self) -> String {
        self.path.join("/")
    }
}

pub struct SourceImage<R> {
    volume: NtfsVolume<R>,
    container: Container,
    volume_len: u64,
    nodes: Vec<NtfsNode>,
    manifest: Vec<EntryInfo>,
}

impl SourceImage<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            WinstickError::InvalidSource(format!("cannot open {}: {}", path.display(), e))
        })?;
        info!("Opening source image {}", path.display());
        Self::from_reader(BufReader::with_capacity(1024 * 1024, file))
    }
}

impl<R: Read + Seek> SourceImage<R> {
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let image_len = reader.seek(SeekFrom::End(0))?;
        let (container, base) = locate_volume(&mut reader, image_len)?;
        let mut volume = NtfsVolume::open(reader, base)?;
        let volume_len = volume
            .boot_sector()
            .volume_bytes()
            .min(image_len.saturating_sub(base));
        if volume_len < volume.boot_sector().volume_bytes() {
            warn!(
                "Image ends {} bytes before the volume does",
                volume.boot_sector().volume_bytes() - volume_len
            );
        }

        let nodes = volume.scan()?;
        let manifest = build_manifest(&nodes)?;
        info!(
            "Source {}: {} bytes of NTFS at offset {}, {} entries",
            container,
            volume_len,
            base,
            manifest.len()
        );
        Ok(Self {
            volume,
            container,
            volume_len,
            nodes,
            manifest,
        })
    }

    pub fn container(&self) -> Container {
        self.container
    }

    pub fn boot_sector(&self) -> &NtfsBootSector {
        self.volume.boot_sector()
    }

    /// Byte length of the NTFS volume, backup boot sector included.
    pub fn volume_len(&self) -> u64 {
        self.volume_len
    }

    pub fn serial(&self) -> u64 {
        self.volume.boot_sector().volume_serial
    }

    /// Modification time of the volume root, used as the stamp for
    /// directory entries the writer creates itself.
    pub fn timestamp(&self) -> DosTimestamp {
        self.nodes
            .iter()
            .find(|n| n.record == MFT_RECORD_ROOT)
            .map(|n| DosTimestamp::from_filetime(n.info.modified))
            .unwrap_or_default()
    }

    pub fn manifest(&self) -> &[EntryInfo] {
        &self.manifest
    }

    /// Sizes of every entry, for layout planning.
    pub fn demand(&self) -> Vec<FileDemand> {
        self.manifest
            .iter()
            .map(|e| FileDemand {
                path: e.path_string(),
                size: e.size,
                is_dir: e.is_dir,
            })
            .collect()
    }

    /// Volume bytes `offset..offset + len`, exactly as stored in the image.
    pub fn raw_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset.checked_add(len as u64).unwrap_or(u64::MAX);
        if end > self.volume_len {
            return Err(WinstickError::InvalidSource(format!(
                "range {}..{} lies outside the {}-byte volume",
                offset, end, self.volume_len
            )));
        }
        let mut buf = vec![0u8; len];
        self.volume.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Consume the image into a single pass over its entries.
    ///
    /// Compressed or encrypted files cannot be reproduced on FAT32 and are
    /// rejected here, before anything is read.
    pub fn entries(self) -> Result<SourceEntries<R>> {
        for entry in &self.manifest {
            if let Some(encoding) = self.nodes[entry.node]
                .data
                .as_ref()
                .and_then(DataSource::unsupported_encoding)
            {
                return Err(WinstickError::InvalidSource(format!(
                    "{} is {} on the source volume",
                    entry.path_string(),
                    encoding
                )));
            }
        }
        Ok(SourceEntries {
            volume: self.volume,
            nodes: self.nodes,
            manifest: self.manifest,
            next: 0,
        })
    }
}

/// Lending iterator over the entries of a consumed [`SourceImage`].
pub struct SourceEntries<R> {
    volume: NtfsVolume<R>,
    nodes: Vec<NtfsNode>,
    manifest: Vec<EntryInfo>,
    next: usize,
}

/// One file or directory. `content` is `None` for directories.
pub struct SourceEntry<'a, R> {
    pub info: &'a EntryInfo,
    pub content: Option<StreamReader<'a, R>>,
}

impl<R: Read + Seek> SourceEntries<R> {
    pub fn len(&self) -> usize {
        self.manifest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }

    /// Content bytes of every file, for progress totals.
    pub fn total_bytes(&self) -> u64 {
        self.manifest.iter().filter(|e| !e.is_dir).map(|e| e.size).sum()
    }

    pub fn remaining(&self) -> usize {
        self.manifest.len() - self.next
    }

    pub fn next_entry(&mut self) -> Option<SourceEntry<'_, R>> {
        let info = self.manifest.get(self.next)?;
        self.next += 1;
        let content = match &self.nodes[info.node].data {
            Some(data) if !info.is_dir => Some(self.volume.stream(data)),
            _ => None,
        };
        Some(SourceEntry { info, content })
    }
}

fn attributes_of(node: &NtfsNode) -> FileAttributes {
    let bits = node.info.file_attributes;
    FileAttributes {
        read_only: bits & FILE_ATTRIBUTE_READONLY != 0,
        hidden: bits & FILE_ATTRIBUTE_HIDDEN != 0,
        system: bits & FILE_ATTRIBUTE_SYSTEM != 0,
        archive: bits & FILE_ATTRIBUTE_ARCHIVE != 0,
    }
}

fn skipped_at_root(name: &str) -> bool {
    name.starts_with('$') || SKIPPED_ROOT_NAMES.iter().any(|s| s.eq_ignore_ascii_case(name))
}

/// Resolve full paths and order entries so parents precede children.
fn build_manifest(nodes: &[NtfsNode]) -> Result<Vec<EntryInfo>> {
    let by_record: HashMap<u64, usize> = nodes.iter().enumerate().map(|(i, n)| (n.record, i)).collect();
    let mut manifest = Vec::new();

    'nodes: for (index, node) in nodes.iter().enumerate() {
        if node.record == MFT_RECORD_ROOT {
            continue;
        }
        let mut path = vec![node.name.clone()];
        let mut parent = node.parent;
        while parent != MFT_RECORD_ROOT {
            let Some(&p) = by_record.get(&parent) else {
                debug!("Record {} ({}) has no reachable parent, skipping", node.record, node.name);
                continue 'nodes;
            };
            if path.len() > MAX_DEPTH {
                return Err(WinstickError::InvalidSource(format!(
                    "directory loop above record {}",
                    node.record
                )));
            }
            path.push(nodes[p].name.clone());
            parent = nodes[p].parent;
        }
        path.reverse();
        if skipped_at_root(&path[0]) {
            continue;
        }
        manifest.push(EntryInfo {
            path,
            size: node.size(),
            is_dir: node.is_dir,
            attributes: attributes_of(node),
            modified: DosTimestamp::from_filetime(node.info.modified),
            node: index,
        });
    }
    manifest.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(manifest)
}

fn read_sector<R: Read + Seek>(reader: &mut R, lba: u64) -> Result<Vec<u8>> {
    let mut sector = vec![0u8; IMAGE_SECTOR as usize];
    reader.seek(SeekFrom::Start(lba * IMAGE_SECTOR))?;
    reader.read_exact(&mut sector)?;
    Ok(sector)
}

fn holds_ntfs<R: Read + Seek>(reader: &mut R, image_len: u64, lba: u64) -> Result<bool> {
    if lba == 0 || (lba + 1) * IMAGE_SECTOR > image_len {
        return Ok(false);
    }
    Ok(NtfsBootSector::is_ntfs(&read_sector(reader, lba)?))
}

/// Find the NTFS volume and its byte offset inside the image.
fn locate_volume<R: Read + Seek>(reader: &mut R, image_len: u64) -> Result<(Container, u64)> {
    if image_len < IMAGE_SECTOR {
        return Err(WinstickError::InvalidSource(format!(
            "image is only {} bytes",
            image_len
        )));
    }
    let sector0 = read_sector(reader, 0)?;
    if NtfsBootSector::is_ntfs(&sector0) {
        return Ok((Container::Bare, 0));
    }
    let Ok((_, slots)) = mbr::decode(&sector0) else {
        return Err(WinstickError::InvalidSource(
            "image holds neither an NTFS volume nor a partition table".to_string(),
        ));
    };

    if slots.iter().any(|s| s.partition_type == mbr::PROTECTIVE_TYPE) {
        let header = read_sector(reader, 1)?;
        if &header[0..8] == gpt::SIGNATURE {
            let entries_lba = LittleEndian::read_u64(&header[72..80]);
            let count = LittleEndian::read_u32(&header[80..84]) as u64;
            let entry_len = LittleEndian::read_u32(&header[84..88]) as u64;
            if entry_len < 0x30 || count > 1024 {
                return Err(WinstickError::InvalidSource(format!(
                    "implausible GPT entry array: {} entries of {} bytes",
                    count, entry_len
                )));
            }
            let mut array = vec![0u8; (count * entry_len) as usize];
            reader.seek(SeekFrom::Start(entries_lba * IMAGE_SECTOR))?;
            reader.read_exact(&mut array)?;
            for (index, entry) in array.chunks_exact(entry_len as usize).enumerate() {
                if entry[0..16].iter().all(|b| *b == 0) {
                    continue;
                }
                let first_lba = LittleEndian::read_u64(&entry[0x20..0x28]);
                if holds_ntfs(reader, image_len, first_lba)? {
                    debug!("NTFS found in GPT entry {} at LBA {}", index, first_lba);
                    return Ok((Container::Gpt { index }, first_lba * IMAGE_SECTOR));
                }
            }
            return Err(WinstickError::InvalidSource(
                "no GPT partition holds an NTFS volume".to_string(),
            ));
        }
    }

    for (index, slot) in slots.iter().enumerate() {
        if slot.partition_type == mbr::PROTECTIVE_TYPE {
            continue;
        }
        let start = slot.start_lba as u64;
        if holds_ntfs(reader, image_len, start)? {
            debug!("NTFS found in MBR slot {} at LBA {}", index, start);
            return Ok((Container::Mbr { index }, start * IMAGE_SECTOR));
        }
    }
    Err(WinstickError::InvalidSource(
        "no partition in the image holds an NTFS volume".to_string(),
    ))
}
