// NTFS data run (runlist) decoding

use winstick_core::{Result, WinstickError};

/// One run of a non-resident attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    /// Logical cluster number; `None` for a sparse run.
    pub lcn: Option<u64>,
    /// Length in clusters.
    pub length: u64,
}

/// Decode a runlist. Offsets are signed and relative to the previous run.
pub fn decode_data_runs(data: &[u8]) -> Result<Vec<DataRun>> {
    let mut runs = Vec::new();
    let mut pos = 0;
    let mut prev_lcn = 0i64;
    let mut total_clusters = 0u64;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }
        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        pos += 1;

        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(WinstickError::InvalidSource(format!(
                "Malformed data run header 0x{:02X}",
                header
            )));
        }
        if pos + length_size + offset_size > data.len() {
            return Err(WinstickError::InvalidSource(
                "Data run extends beyond buffer".to_string(),
            ));
        }

        let length = read_le_unsigned(&data[pos..pos + length_size]);
        pos += length_size;
        total_clusters = total_clusters.checked_add(length).ok_or_else(|| {
            WinstickError::InvalidSource("Data runs cover more than 2^64 clusters".to_string())
        })?;

        if offset_size == 0 {
            runs.push(DataRun { lcn: None, length });
            continue;
        }
        let offset = read_le_signed(&data[pos..pos + offset_size]);
        pos += offset_size;
        let lcn = prev_lcn
            .checked_add(offset)
            .filter(|lcn| *lcn >= 0)
            .ok_or_else(|| {
                WinstickError::InvalidSource(format!(
                    "Invalid LCN: {} {:+}",
                    prev_lcn, offset
                ))
            })?;
        prev_lcn = lcn;
        runs.push(DataRun {
            lcn: Some(lcn as u64),
            length,
        });
    }
    Ok(runs)
}

fn read_le_unsigned(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .enumerate()
        .fold(0u64, |value, (i, &byte)| value | (byte as u64) << (i * 8))
}

fn read_le_signed(bytes: &[u8]) -> i64 {
    let value = read_le_unsigned(bytes) as i64;
    let bits = bytes.len() * 8;
    if bits < 64 && value & (1 << (bits - 1)) != 0 {
        value | !((1i64 << bits) - 1)
    } else {
        value
    }
}

/// Encode a runlist; used to build test volumes.
#[cfg(test)]
pub fn encode_data_runs(runs: &[DataRun]) -> Vec<u8> {
    fn unsigned_len(value: u64) -> usize {
        (1..=8).find(|n| *n == 8 || value >> (n * 8) == 0).unwrap_or(8)
    }
    fn signed_len(value: i64) -> usize {
        (1..=8)
            .find(|n| {
                let bits = n * 8;
                bits == 64 || (value >= -(1i64 << (bits - 1)) && value < (1i64 << (bits - 1)))
            })
            .unwrap_or(8)
    }

    let mut out = Vec::new();
    let mut prev_lcn = 0i64;
    for run in runs {
        let length_size = unsigned_len(run.length);
        match run.lcn {
            None => {
                out.push(length_size as u8);
                out.extend_from_slice(&run.length.to_le_bytes()[..length_size]);
            }
            Some(lcn) => {
                let delta = lcn as i64 - prev_lcn;
                prev_lcn = lcn as i64;
                let offset_size = signed_len(delta);
                out.push((offset_size << 4 | length_size) as u8);
                out.extend_from_slice(&run.length.to_le_bytes()[..length_size]);
                out.extend_from_slice(&delta.to_le_bytes()[..offset_size]);
            }
        }
    }
    out.push(0);
    out
}
