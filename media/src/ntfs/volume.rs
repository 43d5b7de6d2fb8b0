//! Read-only view of an NTFS volume inside a source image.
//!
//! [`NtfsVolume::scan`] walks the MFT once and returns every in-use file
//! and directory with its parent, name, attributes and data location.
//! [`StreamReader`] then reads a file's unnamed data stream lazily.

use super::record::{parse_attribute_list, AttributeBody, FileName, MftRecord, StandardInformation};
use super::runs::DataRun;
use super::*;
use log::{debug, info, warn};
use std::io::{self, Read, Seek, SeekFrom};
use winstick_core::{Result, WinstickError};

/// Where a file's unnamed data stream lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Resident(Vec<u8>),
    NonResident {
        runs: Vec<DataRun>,
        data_size: u64,
        initialized_size: u64,
        flags: u16,
    },
}

impl DataSource {
    pub fn len(&self) -> u64 {
        match self {
            DataSource::Resident(data) => data.len() as u64,
            DataSource::NonResident { data_size, .. } => *data_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compressed and encrypted streams cannot be read back as plain bytes.
    pub fn unsupported_encoding(&self) -> Option<&'static str> {
        match self {
            DataSource::NonResident { flags, .. } if flags & ATTR_FLAG_ENCRYPTED != 0 => {
                Some("encrypted")
            }
            DataSource::NonResident { flags, .. } if flags & ATTR_FLAG_COMPRESSED != 0 => {
                Some("compressed")
            }
            _ => None,
        }
    }
}

/// A file or directory found in the MFT.
#[derive(Debug, Clone)]
pub struct NtfsNode {
    pub record: u64,
    pub parent: u64,
    pub name: String,
    pub is_dir: bool,
    pub info: StandardInformation,
    pub data: Option<DataSource>,
}

impl NtfsNode {
    pub fn size(&self) -> u64 {
        self.data.as_ref().map_or(0, DataSource::len)
    }
}

pub struct NtfsVolume<R> {
    reader: R,
    /// Byte offset of the volume inside the image.
    base: u64,
    boot: NtfsBootSector,
    mft_runs: Vec<DataRun>,
    mft_size: u64,
}

impl<R: Read + Seek> NtfsVolume<R> {
    /// Open the volume whose boot sector sits at byte `base` of `reader`.
    pub fn open(mut reader: R, base: u64) -> Result<Self> {
        let mut sector = vec![0u8; 512];
        reader.seek(SeekFrom::Start(base))?;
        reader.read_exact(&mut sector)?;
        let boot = NtfsBootSector::parse(&sector)?;
        info!(
            "NTFS volume at byte {}: {} sectors of {} bytes, {}-byte clusters, serial {:016X}",
            base,
            boot.total_sectors,
            boot.bytes_per_sector,
            boot.cluster_bytes(),
            boot.volume_serial
        );

        let mut volume = Self {
            reader,
            base,
            boot,
            // Enough clusters to reach record 0 until its runlist is known
            mft_runs: vec![DataRun {
                lcn: Some(boot.mft_lcn),
                length: (boot.mft_record_size as u64).div_ceil(boot.cluster_bytes()),
            }],
            mft_size: boot.mft_record_size as u64,
        };

        // Record 0 describes the MFT itself
        let mft = volume
            .read_record(MFT_RECORD_MFT)?
            .ok_or_else(|| WinstickError::InvalidSource("$MFT record is missing".to_string()))?;
        let data = mft
            .attributes
            .iter()
            .find(|a| a.is_unnamed_data())
            .ok_or_else(|| WinstickError::InvalidSource("$MFT has no data".to_string()))?;
        match &data.body {
            AttributeBody::NonResident {
                runs, data_size, ..
            } => {
                volume.mft_runs = runs.clone();
                volume.mft_size = *data_size;
            }
            AttributeBody::Resident(_) => {
                return Err(WinstickError::InvalidSource(
                    "$MFT data cannot be resident".to_string(),
                ))
            }
        }
        debug!(
            "MFT holds {} records in {} runs",
            volume.record_count(),
            volume.mft_runs.len()
        );
        Ok(volume)
    }

    pub fn boot_sector(&self) -> &NtfsBootSector {
        &self.boot
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn record_count(&self) -> u64 {
        self.mft_size / self.boot.mft_record_size as u64
    }

    /// Read `buf.len()` bytes at a volume-relative offset.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let at = self.base.checked_add(offset).ok_or_else(|| {
            WinstickError::InvalidSource(format!("offset {} lies past the end of the image", offset))
        })?;
        self.reader.seek(SeekFrom::Start(at))?;
        self.reader.read_exact(buf)?;
        Ok(())
    }

    /// Bytes of a non-resident stream, zero-filling sparse runs.
    fn read_runs(&mut self, runs: &[DataRun], offset: u64, buf: &mut [u8]) -> Result<()> {
        let cluster = self.boot.cluster_bytes();
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let (run, run_start) = locate(runs, pos / cluster).ok_or_else(|| {
                WinstickError::InvalidSource(format!("offset {} lies past the runlist", pos))
            })?;
            let overflow = || WinstickError::InvalidSource(format!("run at VCN {} overflows", run_start));
            let run_end = (run_start + run.length)
                .checked_mul(cluster)
                .ok_or_else(overflow)?;
            let take = (run_end - pos).min((buf.len() - done) as u64) as usize;
            let out = &mut buf[done..done + take];
            match run.lcn {
                None => out.fill(0),
                Some(lcn) => {
                    let at = lcn
                        .checked_mul(cluster)
                        .and_then(|start| start.checked_add(pos - run_start * cluster))
                        .ok_or_else(overflow)?;
                    self.read_at(at, out)?
                }
            }
            done += take;
        }
        Ok(())
    }

    pub fn read_record(&mut self, number: u64) -> Result<Option<MftRecord>> {
        let size = self.boot.mft_record_size as usize;
        let mut data = vec![0u8; size];
        let runs = self.mft_runs.clone();
        self.read_runs(&runs, number * size as u64, &mut data)?;
        MftRecord::parse(number, data)
    }

    /// Full contents of an attribute value, resident or not.
    fn attribute_value(&mut self, body: &AttributeBody) -> Result<Vec<u8>> {
        match body {
            AttributeBody::Resident(value) => Ok(value.clone()),
            AttributeBody::NonResident {
                runs, data_size, ..
            } => {
                let mut value = vec![0u8; *data_size as usize];
                self.read_runs(runs, 0, &mut value)?;
                Ok(value)
            }
        }
    }

    /// Base record plus the attributes its attribute list places in
    /// extension records.
    fn load_file(&mut self, mut record: MftRecord) -> Result<MftRecord> {
        let Some(list) = record.find(ATTR_TYPE_ATTRIBUTE_LIST).next().cloned() else {
            return Ok(record);
        };
        let value = self.attribute_value(&list.body)?;
        let mut extensions: Vec<u64> = parse_attribute_list(&value)?
            .into_iter()
            .map(|entry| entry.record)
            .filter(|n| *n != record.number)
            .collect();
        extensions.sort_unstable();
        extensions.dedup();
        for number in extensions {
            let extension = self.read_record(number)?.ok_or_else(|| {
                WinstickError::InvalidSource(format!(
                    "record {} lists missing extension record {}",
                    record.number, number
                ))
            })?;
            if extension.base_record != record.number {
                return Err(WinstickError::InvalidSource(format!(
                    "extension record {} belongs to {}, not {}",
                    number, extension.base_record, record.number
                )));
            }
            record.attributes.extend(extension.attributes);
        }
        Ok(record)
    }

    /// Walk the MFT and collect every in-use user file and directory, plus the root.
    pub fn scan(&mut self) -> Result<Vec<NtfsNode>> {
        let mut nodes = Vec::new();
        for number in 0..self.record_count() {
            if number < FIRST_USER_RECORD && number != MFT_RECORD_ROOT {
                continue;
            }
            let Some(record) = self.read_record(number)? else {
                continue;
            };
            if !record.in_use() || record.base_record != 0 {
                continue;
            }
            let record = self.load_file(record)?;
            if let Some(node) = node_from_record(&record)? {
                nodes.push(node);
            }
        }
        info!("Scanned {} MFT records, {} entries", self.record_count(), nodes.len());
        Ok(nodes)
    }

    /// A reader over one data stream.
    pub fn stream<'a>(&'a mut self, source: &'a DataSource) -> StreamReader<'a, R> {
        StreamReader {
            volume: self,
            source,
            position: 0,
        }
    }
}

impl<R> NtfsVolume<R> {
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// The run containing `vcn` and the VCN that run starts at.
fn locate(runs: &[DataRun], vcn: u64) -> Option<(DataRun, u64)> {
    let mut start = 0u64;
    for run in runs {
        if vcn < start + run.length {
            return Some((*run, start));
        }
        start += run.length;
    }
    None
}

fn pick_name(names: &[FileName]) -> Option<&FileName> {
    // Win32 names over DOS 8.3 aliases
    names
        .iter()
        .find(|n| n.namespace == FILE_NAME_WIN32 || n.namespace == FILE_NAME_WIN32_AND_DOS)
        .or_else(|| names.iter().find(|n| n.namespace == FILE_NAME_POSIX))
        .or_else(|| names.first())
}

fn node_from_record(record: &MftRecord) -> Result<Option<NtfsNode>> {
    let names = record
        .find(ATTR_TYPE_FILE_NAME)
        .filter_map(|a| a.resident_value())
        .map(FileName::parse)
        .collect::<Result<Vec<_>>>()?;
    let Some(name) = pick_name(&names) else {
        warn!("Record {} has no file name, skipping", record.number);
        return Ok(None);
    };
    let info = record
        .find(ATTR_TYPE_STANDARD_INFORMATION)
        .next()
        .and_then(|a| a.resident_value())
        .map(StandardInformation::parse)
        .transpose()?
        .unwrap_or_default();

    let is_dir = record.is_directory();
    let data = if is_dir {
        None
    } else {
        Some(data_source(record)?)
    };
    Ok(Some(NtfsNode {
        record: record.number,
        parent: name.parent,
        name: name.name.clone(),
        is_dir,
        info,
        data,
    }))
}

/// Merge the unnamed $DATA extents (possibly spread over extension records).
fn data_source(record: &MftRecord) -> Result<DataSource> {
    let mut extents: Vec<_> = record.attributes.iter().filter(|a| a.is_unnamed_data()).collect();
    if extents.is_empty() {
        return Ok(DataSource::Resident(Vec::new()));
    }
    if let AttributeBody::Resident(value) = &extents[0].body {
        return Ok(DataSource::Resident(value.clone()));
    }

    extents.sort_by_key(|a| match a.body {
        AttributeBody::NonResident { start_vcn, .. } => start_vcn,
        AttributeBody::Resident(_) => 0,
    });
    let mut runs = Vec::new();
    let mut sizes = None;
    for extent in &extents {
        match &extent.body {
            AttributeBody::NonResident {
                start_vcn,
                runs: extent_runs,
                data_size,
                initialized_size,
                ..
            } => {
                if *start_vcn == 0 {
                    sizes = Some((*data_size, *initialized_size, extent.flags));
                }
                runs.extend_from_slice(extent_runs);
            }
            AttributeBody::Resident(_) => {
                return Err(WinstickError::InvalidSource(format!(
                    "record {} mixes resident and non-resident data",
                    record.number
                )))
            }
        }
    }
    let (data_size, initialized_size, flags) = sizes.ok_or_else(|| {
        WinstickError::InvalidSource(format!("record {} lacks its first data extent", record.number))
    })?;
    Ok(DataSource::NonResident {
        runs,
        data_size,
        initialized_size: initialized_size.min(data_size),
        flags,
    })
}

/// Lazily reads a data stream. Sparse runs and bytes past the initialized
/// size read as zeros.
pub struct StreamReader<'a, R> {
    volume: &'a mut NtfsVolume<R>,
    source: &'a DataSource,
    position: u64,
}

impl<R: Read + Seek> Read for StreamReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.source.len().saturating_sub(self.position);
        let take = (buf.len() as u64).min(remaining) as usize;
        if take == 0 {
            return Ok(0);
        }
        let out = &mut buf[..take];
        match self.source {
            DataSource::Resident(data) => {
                let start = self.position as usize;
                out.copy_from_slice(&data[start..start + take]);
            }
            DataSource::NonResident {
                runs,
                initialized_size,
                ..
            } => {
                let initialized = initialized_size.saturating_sub(self.position).min(take as u64) as usize;
                if initialized > 0 {
                    self.volume
                        .read_runs(runs, self.position, &mut out[..initialized])
                        .map_err(io::Error::from)?;
                }
                out[initialized..].fill(0);
            }
        }
        self.position += take as u64;
        Ok(take)
    }
}
