//! Synthetic NTFS volumes for tests.
//!
//! Produces just enough NTFS for the reader: a boot sector and its backup,
//! an MFT whose record 0 maps itself, the root directory in record 5 and
//! one record per user entry from record 24 on. Directory indexes are not
//! written because the reader walks the MFT instead.

use crate::ntfs::runs::{encode_data_runs, DataRun};
use crate::ntfs::*;
use crate::partition::{gpt, mbr};
use byteorder::{ByteOrder, LittleEndian};
use std::io::{Seek, SeekFrom, Write};

const SECTOR: u64 = 512;
const CLUSTER: u64 = 4096;
const RECORD: usize = 1024;
const MFT_LCN: u64 = 4;
/// 2023-06-01T00:00:00Z
pub const FIXED_FILETIME: u64 = 133_300_512_000_000_000;

pub enum Content {
    /// Stored inside the MFT record.
    Resident(Vec<u8>),
    /// Stored in one run of clusters.
    Bytes(Vec<u8>),
    /// `head` and `tail` must be whole clusters unless empty.
    Sparse {
        head: Vec<u8>,
        hole_clusters: u64,
        tail: Vec<u8>,
    },
    /// Only the first `initialized` bytes count as written.
    Uninitialized { data: Vec<u8>, initialized: u64 },
    /// Data extents split between the base record and an extension
    /// record, tied together by an attribute list.
    Split(Vec<u8>),
    /// Marked compressed; the bytes are stored as they are.
    Compressed(Vec<u8>),
}

struct Entry {
    path: String,
    name: String,
    parent: Option<usize>,
    attributes: u32,
    content: Option<Content>,
}

pub struct NtfsImageBuilder {
    size: u64,
    serial: u64,
    entries: Vec<Entry>,
}

impl NtfsImageBuilder {
    /// An empty volume of `size` bytes, a multiple of the cluster size.
    pub fn new(size: u64) -> Self {
        assert_eq!(size % CLUSTER, 0, "volume size must be whole clusters");
        Self {
            size,
            serial: 0x0123_4567_89AB_CDEF,
            entries: Vec::new(),
        }
    }

    /// A small installer tree with boot files at the usual places and one
    /// large image file of `wim_bytes`.
    pub fn installer(size: u64, wim_bytes: usize) -> Self {
        let mut builder = Self::new(size);
        builder.file("bootmgr", Content::Bytes(pattern(5000, 1)));
        builder.attributes("bootmgr", FILE_ATTRIBUTE_HIDDEN | FILE_ATTRIBUTE_SYSTEM | FILE_ATTRIBUTE_READONLY);
        builder.file("autorun.inf", Content::Resident(b"[AutoRun]\r\nicon=setup.exe\r\n".to_vec()));
        builder.file("efi/boot/bootx64.efi", Content::Bytes(pattern(12_000, 2)));
        builder.file("efi/microsoft/boot/bcd", Content::Bytes(pattern(16_384, 3)));
        builder.file("sources/install.wim", Content::Bytes(pattern(wim_bytes, 4)));
        builder.file("setup.exe", Content::Bytes(pattern(7000, 5)));
        builder
    }

    pub fn serial(&mut self, serial: u64) -> &mut Self {
        self.serial = serial;
        self
    }

    fn find(&self, path: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.path == path)
    }

    fn ensure_dir(&mut self, path: &str) -> Option<usize> {
        let mut parent = None;
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            parent = Some(match self.find(&current) {
                Some(index) => index,
                None => {
                    self.entries.push(Entry {
                        path: current.clone(),
                        name: part.to_string(),
                        parent,
                        attributes: 0,
                        content: None,
                    });
                    self.entries.len() - 1
                }
            });
        }
        parent
    }

    pub fn directory(&mut self, path: &str) -> &mut Self {
        self.ensure_dir(path);
        self
    }

    pub fn file(&mut self, path: &str, content: Content) -> &mut Self {
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        let parent = self.ensure_dir(dir);
        self.entries.push(Entry {
            path: path.to_string(),
            name: name.to_string(),
            parent,
            attributes: FILE_ATTRIBUTE_ARCHIVE,
            content: Some(content),
        });
        self
    }

    pub fn attributes(&mut self, path: &str, bits: u32) -> &mut Self {
        let index = self.find(path).expect("attributes for an unknown path");
        self.entries[index].attributes = bits;
        self
    }

    /// The volume as one buffer.
    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.size as usize];
        for (offset, data) in self.layout() {
            image[offset as usize..offset as usize + data.len()].copy_from_slice(&data);
        }
        image
    }

    /// The volume as a sparse temporary file.
    pub fn build_file(&self) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(self.size).unwrap();
        for (offset, data) in self.layout() {
            file.seek(SeekFrom::Start(offset)).unwrap();
            file.write_all(&data).unwrap();
        }
        file.flush().unwrap();
        file
    }

    /// Put `volume` into an MBR disk image as partition 1 at `start_lba`.
    pub fn wrap_mbr(volume: &[u8], start_lba: u32) -> Vec<u8> {
        let mut image = vec![0u8; start_lba as usize * SECTOR as usize];
        let slot = mbr::MbrSlot {
            active: true,
            partition_type: 0x07,
            start_lba,
            sector_count: (volume.len() as u64 / SECTOR) as u32,
        };
        image[..512].copy_from_slice(&mbr::encode(&[slot], 0x1234_5678));
        image.extend_from_slice(volume);
        image
    }

    /// Put `volume` into a GPT disk image as entry 1 at `start_lba`.
    pub fn wrap_gpt(volume: &[u8], start_lba: u32) -> Vec<u8> {
        let total = start_lba as u64 + volume.len() as u64 / SECTOR;
        let mut image = vec![0u8; start_lba as usize * SECTOR as usize];
        let protective = mbr::MbrSlot {
            active: false,
            partition_type: mbr::PROTECTIVE_TYPE,
            start_lba: 1,
            sector_count: (total - 1) as u32,
        };
        image[..512].copy_from_slice(&mbr::encode(&[protective], 0));

        let header = &mut image[512..1024];
        header[0..8].copy_from_slice(gpt::SIGNATURE);
        LittleEndian::write_u64(&mut header[72..80], 2);
        LittleEndian::write_u32(&mut header[80..84], 128);
        LittleEndian::write_u32(&mut header[84..88], 128);

        let entry = &mut image[1024..1024 + 128];
        entry[0..16].copy_from_slice(&crate::partition::BASIC_DATA_TYPE_GUID.to_bytes_le());
        entry[16..32].copy_from_slice(&[0x42; 16]);
        LittleEndian::write_u64(&mut entry[0x20..0x28], start_lba as u64);
        LittleEndian::write_u64(&mut entry[0x28..0x30], total - 1);

        image.extend_from_slice(volume);
        image
    }

    /// Every (byte offset, bytes) the volume is made of.
    fn layout(&self) -> Vec<(u64, Vec<u8>)> {
        let total_clusters = self.size / CLUSTER;
        let extensions = self
            .entries
            .iter()
            .filter(|e| matches!(e.content, Some(Content::Split(_))))
            .count();
        let record_count = (FIRST_USER_RECORD as usize + self.entries.len() + extensions)
            .max(32)
            .div_ceil(4)
            * 4;
        let mft_clusters = (record_count * RECORD) as u64 / CLUSTER;
        let mut allocator = Allocator {
            next: MFT_LCN + mft_clusters,
            // The last cluster holds the backup boot sector
            limit: total_clusters - 1,
            writes: Vec::new(),
        };
        let mut records = vec![vec![0u8; RECORD]; record_count];

        let mut mft = RecordWriter::default();
        mft.resident(ATTR_TYPE_STANDARD_INFORMATION, &standard_information(FILE_ATTRIBUTE_HIDDEN | FILE_ATTRIBUTE_SYSTEM), 0);
        mft.resident(ATTR_TYPE_FILE_NAME, &file_name(MFT_RECORD_ROOT, "$MFT", FILE_NAME_WIN32_AND_DOS), 0);
        mft.non_resident(
            0,
            &[DataRun {
                lcn: Some(MFT_LCN),
                length: mft_clusters,
            }],
            (record_count * RECORD) as u64,
            (record_count * RECORD) as u64,
            0,
        );
        records[MFT_RECORD_MFT as usize] = mft.finish(MFT_RECORD_IN_USE, 0);

        let mut root = RecordWriter::default();
        root.resident(ATTR_TYPE_STANDARD_INFORMATION, &standard_information(FILE_ATTRIBUTE_HIDDEN | FILE_ATTRIBUTE_SYSTEM), 0);
        root.resident(ATTR_TYPE_FILE_NAME, &file_name(MFT_RECORD_ROOT, ".", FILE_NAME_WIN32_AND_DOS), 0);
        records[MFT_RECORD_ROOT as usize] = root.finish(MFT_RECORD_IN_USE | MFT_RECORD_IS_DIRECTORY, 0);

        let mut next_extension = FIRST_USER_RECORD as usize + self.entries.len();
        for (index, entry) in self.entries.iter().enumerate() {
            let number = FIRST_USER_RECORD as usize + index;
            let parent = entry
                .parent
                .map_or(MFT_RECORD_ROOT, |p| FIRST_USER_RECORD + p as u64);
            let mut record = RecordWriter::default();
            record.resident(ATTR_TYPE_STANDARD_INFORMATION, &standard_information(entry.attributes), 0);
            if let Some(alias) = dos_alias(&entry.name) {
                record.resident(ATTR_TYPE_FILE_NAME, &file_name(parent, &alias, FILE_NAME_DOS), 0);
                record.resident(ATTR_TYPE_FILE_NAME, &file_name(parent, &entry.name, FILE_NAME_WIN32), 0);
            } else {
                record.resident(ATTR_TYPE_FILE_NAME, &file_name(parent, &entry.name, FILE_NAME_WIN32_AND_DOS), 0);
            }

            let flags = match &entry.content {
                None => MFT_RECORD_IN_USE | MFT_RECORD_IS_DIRECTORY,
                Some(content) => {
                    match content {
                        Content::Resident(data) => record.resident(ATTR_TYPE_DATA, data, 0),
                        Content::Bytes(data) | Content::Compressed(data) => {
                            let runs = allocator.store(data);
                            let flags = match content {
                                Content::Compressed(_) => ATTR_FLAG_COMPRESSED,
                                _ => 0,
                            };
                            record.non_resident(0, &runs, data.len() as u64, data.len() as u64, flags);
                        }
                        Content::Sparse {
                            head,
                            hole_clusters,
                            tail,
                        } => {
                            let mut runs = allocator.store(head);
                            runs.push(DataRun {
                                lcn: None,
                                length: *hole_clusters,
                            });
                            runs.extend(allocator.store(tail));
                            let len = head.len() as u64 + hole_clusters * CLUSTER + tail.len() as u64;
                            record.non_resident(0, &runs, len, len, ATTR_FLAG_SPARSE);
                        }
                        Content::Uninitialized { data, initialized } => {
                            let runs = allocator.store(data);
                            record.non_resident(0, &runs, data.len() as u64, *initialized, 0);
                        }
                        Content::Split(data) => {
                            let runs = allocator.store(data);
                            assert_eq!(runs.len(), 1);
                            let clusters = runs[0].length;
                            let first = clusters / 2;
                            let lcn = runs[0].lcn.unwrap_or_default();
                            let head = [DataRun { lcn: Some(lcn), length: first }];
                            let tail = [DataRun {
                                lcn: Some(lcn + first),
                                length: clusters - first,
                            }];
                            let extension = next_extension;
                            next_extension += 1;

                            let list = [
                                (ATTR_TYPE_STANDARD_INFORMATION, 0, number),
                                (ATTR_TYPE_FILE_NAME, 0, number),
                                (ATTR_TYPE_DATA, 0, number),
                                (ATTR_TYPE_DATA, first, extension),
                            ];
                            record.resident(ATTR_TYPE_ATTRIBUTE_LIST, &attribute_list(&list), 0);
                            record.non_resident(0, &head, data.len() as u64, data.len() as u64, 0);

                            let mut ext = RecordWriter::default();
                            ext.non_resident(first, &tail, 0, 0, 0);
                            records[extension] = ext.finish(MFT_RECORD_IN_USE, number as u64);
                        }
                    }
                    MFT_RECORD_IN_USE
                }
            };
            records[number] = record.finish(flags, 0);
        }

        let mut writes = allocator.writes;
        writes.push((MFT_LCN * CLUSTER, records.concat()));
        let boot = self.boot_sector(mft_clusters);
        writes.push((self.size - SECTOR, boot.clone()));
        writes.push((0, boot));
        writes
    }

    fn boot_sector(&self, mft_clusters: u64) -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR as usize];
        sector[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        sector[3..11].copy_from_slice(NTFS_OEM_ID);
        LittleEndian::write_u16(&mut sector[0x0B..], SECTOR as u16);
        sector[0x0D] = (CLUSTER / SECTOR) as u8;
        sector[0x15] = 0xF8;
        LittleEndian::write_u16(&mut sector[0x18..], 63);
        LittleEndian::write_u16(&mut sector[0x1A..], 255);
        LittleEndian::write_u64(&mut sector[0x28..], self.size / SECTOR - 1);
        LittleEndian::write_u64(&mut sector[0x30..], MFT_LCN);
        LittleEndian::write_u64(&mut sector[0x38..], MFT_LCN + mft_clusters);
        // 2^10 = 1024-byte records
        sector[0x40] = 0xF6;
        sector[0x44] = 1;
        LittleEndian::write_u64(&mut sector[0x48..], self.serial);
        sector[510] = 0x55;
        sector[511] = 0xAA;
        sector
    }
}

/// Deterministic test bytes that differ per `seed`.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 17) as u8 ^ (i >> 12) as u8)
        .collect()
}

struct Allocator {
    next: u64,
    limit: u64,
    writes: Vec<(u64, Vec<u8>)>,
}

impl Allocator {
    /// Place `data` in fresh clusters; empty data takes none.
    fn store(&mut self, data: &[u8]) -> Vec<DataRun> {
        if data.is_empty() {
            return Vec::new();
        }
        let clusters = (data.len() as u64).div_ceil(CLUSTER);
        assert!(self.next + clusters <= self.limit, "test volume is full");
        let lcn = self.next;
        self.next += clusters;
        self.writes.push((lcn * CLUSTER, data.to_vec()));
        vec![DataRun {
            lcn: Some(lcn),
            length: clusters,
        }]
    }
}

#[derive(Default)]
struct RecordWriter {
    attributes: Vec<u8>,
    next_id: u16,
}

impl RecordWriter {
    fn resident(&mut self, type_code: u32, value: &[u8], flags: u16) {
        let length = (0x18 + value.len()).div_ceil(8) * 8;
        let mut attr = vec![0u8; length];
        LittleEndian::write_u32(&mut attr[0x00..], type_code);
        LittleEndian::write_u32(&mut attr[0x04..], length as u32);
        LittleEndian::write_u16(&mut attr[0x0A..], 0x18);
        LittleEndian::write_u16(&mut attr[0x0C..], flags);
        LittleEndian::write_u16(&mut attr[0x0E..], self.next_id);
        LittleEndian::write_u32(&mut attr[0x10..], value.len() as u32);
        LittleEndian::write_u16(&mut attr[0x14..], 0x18);
        attr[0x18..0x18 + value.len()].copy_from_slice(value);
        self.push(attr);
    }

    fn non_resident(&mut self, start_vcn: u64, runs: &[DataRun], data_size: u64, initialized: u64, flags: u16) {
        let runlist = encode_data_runs(runs);
        let length = (0x40 + runlist.len()).div_ceil(8) * 8;
        let clusters: u64 = runs.iter().map(|r| r.length).sum();
        let mut attr = vec![0u8; length];
        LittleEndian::write_u32(&mut attr[0x00..], ATTR_TYPE_DATA);
        LittleEndian::write_u32(&mut attr[0x04..], length as u32);
        attr[0x08] = 1;
        LittleEndian::write_u16(&mut attr[0x0A..], 0x40);
        LittleEndian::write_u16(&mut attr[0x0C..], flags);
        LittleEndian::write_u16(&mut attr[0x0E..], self.next_id);
        LittleEndian::write_u64(&mut attr[0x10..], start_vcn);
        LittleEndian::write_u64(&mut attr[0x18..], (start_vcn + clusters).saturating_sub(1));
        LittleEndian::write_u16(&mut attr[0x20..], 0x40);
        if start_vcn == 0 {
            LittleEndian::write_u64(&mut attr[0x28..], clusters * CLUSTER);
            LittleEndian::write_u64(&mut attr[0x30..], data_size);
            LittleEndian::write_u64(&mut attr[0x38..], initialized);
        }
        attr[0x40..0x40 + runlist.len()].copy_from_slice(&runlist);
        self.push(attr);
    }

    fn push(&mut self, attr: Vec<u8>) {
        self.attributes.extend_from_slice(&attr);
        self.next_id += 1;
    }

    /// Lay out the record and protect it with an update sequence array.
    fn finish(self, flags: u16, base: u64) -> Vec<u8> {
        const USA_OFFSET: usize = 0x30;
        const FIRST_ATTRIBUTE: usize = 0x38;
        let usa_count = RECORD / USA_STRIDE + 1;
        let used = FIRST_ATTRIBUTE + self.attributes.len() + 8;
        assert!(used <= RECORD, "attributes overflow the record");

        let mut record = vec![0u8; RECORD];
        record[0..4].copy_from_slice(MFT_RECORD_SIGNATURE);
        LittleEndian::write_u16(&mut record[0x04..], USA_OFFSET as u16);
        LittleEndian::write_u16(&mut record[0x06..], usa_count as u16);
        LittleEndian::write_u16(&mut record[0x10..], 1);
        LittleEndian::write_u16(&mut record[0x12..], 1);
        LittleEndian::write_u16(&mut record[0x14..], FIRST_ATTRIBUTE as u16);
        LittleEndian::write_u16(&mut record[0x16..], flags);
        LittleEndian::write_u32(&mut record[0x18..], used as u32);
        LittleEndian::write_u32(&mut record[0x1C..], RECORD as u32);
        if base != 0 {
            LittleEndian::write_u64(&mut record[0x20..], base | (1 << 48));
        }
        LittleEndian::write_u16(&mut record[0x28..], self.next_id);
        record[FIRST_ATTRIBUTE..FIRST_ATTRIBUTE + self.attributes.len()].copy_from_slice(&self.attributes);
        let end = FIRST_ATTRIBUTE + self.attributes.len();
        LittleEndian::write_u32(&mut record[end..], ATTR_TYPE_END);

        let usn = [0x01, 0x00];
        record[USA_OFFSET..USA_OFFSET + 2].copy_from_slice(&usn);
        for i in 1..usa_count {
            let tail = i * USA_STRIDE - 2;
            let saved = USA_OFFSET + i * 2;
            record[saved] = record[tail];
            record[saved + 1] = record[tail + 1];
            record[tail..tail + 2].copy_from_slice(&usn);
        }
        record
    }
}

fn standard_information(attributes: u32) -> Vec<u8> {
    let mut value = vec![0u8; 0x48];
    for offset in [0x00, 0x08, 0x10, 0x18] {
        LittleEndian::write_u64(&mut value[offset..], FIXED_FILETIME);
    }
    LittleEndian::write_u32(&mut value[0x20..], attributes);
    value
}

fn file_name(parent: u64, name: &str, namespace: u8) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut value = vec![0u8; 0x42 + units.len() * 2];
    LittleEndian::write_u64(&mut value[0x00..], parent | (1 << 48));
    for offset in [0x08, 0x10, 0x18, 0x20] {
        LittleEndian::write_u64(&mut value[offset..], FIXED_FILETIME);
    }
    value[0x40] = units.len() as u8;
    value[0x41] = namespace;
    for (i, unit) in units.iter().enumerate() {
        LittleEndian::write_u16(&mut value[0x42 + i * 2..], *unit);
    }
    value
}

/// An 8.3 alias for names that do not fit 8.3 themselves.
fn dos_alias(name: &str) -> Option<String> {
    let (base, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    if base.len() <= 8 && ext.len() <= 3 && !name.contains(' ') {
        return None;
    }
    let stem: String = base
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(6)
        .collect::<String>()
        .to_ascii_uppercase();
    let ext: String = ext.chars().take(3).collect::<String>().to_ascii_uppercase();
    Some(if ext.is_empty() {
        format!("{}~1", stem)
    } else {
        format!("{}~1.{}", stem, ext)
    })
}

fn attribute_list(entries: &[(u32, u64, usize)]) -> Vec<u8> {
    let mut value = Vec::new();
    for (id, (type_code, start_vcn, record)) in entries.iter().enumerate() {
        let mut entry = [0u8; 0x20];
        LittleEndian::write_u32(&mut entry[0x00..], *type_code);
        LittleEndian::write_u16(&mut entry[0x04..], 0x20);
        entry[0x07] = 0x1A;
        LittleEndian::write_u64(&mut entry[0x08..], *start_vcn);
        LittleEndian::write_u64(&mut entry[0x10..], *record as u64 | (1 << 48));
        LittleEndian::write_u16(&mut entry[0x18..], id as u16);
        value.extend_from_slice(&entry);
    }
    value
}
