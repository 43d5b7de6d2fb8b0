// Long and short (8.3) directory entry names

use super::constants::*;
use std::collections::HashSet;
use winstick_core::{Result, WinstickError};

const ILLEGAL_CHARS: &[char] = &['"', '*', '/', ':', '<', '>', '?', '\\', '|'];

// Character positions within an LFN entry: 5 at 1, 6 at 14, 2 at 28
const LFN_OFFSETS: [usize; LFN_CHARS_PER_ENTRY] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// Reject names FAT32 cannot store.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |why: &str| Err(WinstickError::InvalidName(format!("'{}' {}", name, why)));
    if name.is_empty() {
        return invalid("is empty");
    }
    if name == "." || name == ".." {
        return invalid("is reserved");
    }
    if let Some(c) = name.chars().find(|c| ILLEGAL_CHARS.contains(c) || (*c as u32) < 0x20) {
        return invalid(&format!("contains illegal character {:?}", c));
    }
    if name.ends_with(' ') || name.ends_with('.') {
        return invalid("ends with a space or dot");
    }
    if name.encode_utf16().count() > MAX_LFN_UNITS {
        return invalid(&format!("is longer than {} UTF-16 units", MAX_LFN_UNITS));
    }
    Ok(())
}

/// Check if a character is valid for 8.3 filenames
fn is_valid_83_char(c: u8) -> bool {
    matches!(c,
        b'A'..=b'Z' | b'0'..=b'9' | b'!' | b'#' | b'$' | b'%' | b'&' |
        b'\'' | b'(' | b')' | b'-' | b'@' | b'^' | b'_' | b'`' |
        b'{' | b'}' | b'~')
}

/// Case of one 8.3 component: `Some(true)` all lower, `Some(false)` upper or
/// caseless, `None` mixed.
fn component_case(part: &str) -> Option<bool> {
    let lower = part.chars().any(|c| c.is_ascii_lowercase());
    let upper = part.chars().any(|c| c.is_ascii_uppercase());
    match (lower, upper) {
        (true, true) => None,
        (true, false) => Some(true),
        _ => Some(false),
    }
}

/// The 8.3 form of a name that needs no long entry, with the NT case flags
/// that restore its lower-case parts.
pub fn plain_short_name(name: &str) -> Option<([u8; 11], u8)> {
    let (base, ext) = match name.split_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 || ext.contains('.') {
        return None;
    }
    let valid = |part: &str| {
        part.is_ascii() && part.bytes().all(|b| is_valid_83_char(b.to_ascii_uppercase()))
    };
    if !valid(base) || !valid(ext) {
        return None;
    }

    let mut flags = 0u8;
    if component_case(base)? {
        flags |= NT_LOWER_BASE;
    }
    if component_case(ext)? {
        flags |= NT_LOWER_EXT;
    }

    let mut short = [b' '; 11];
    for (slot, b) in short[..8].iter_mut().zip(base.bytes()) {
        *slot = b.to_ascii_uppercase();
    }
    for (slot, b) in short[8..].iter_mut().zip(ext.bytes()) {
        *slot = b.to_ascii_uppercase();
    }
    Some((short, flags))
}

fn basis_chars(part: &str) -> Vec<u8> {
    part.chars()
        .filter(|c| *c != ' ' && *c != '.')
        .map(|c| {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii() && is_valid_83_char(upper as u8) {
                upper as u8
            } else {
                b'_'
            }
        })
        .collect()
}

/// Generate a unique `BASIS~N.EXT` alias for a long name.
pub fn generate_alias(long_name: &str, existing: &HashSet<[u8; 11]>) -> Result<[u8; 11]> {
    let trimmed = long_name.trim_start_matches('.');
    let (base, ext) = match trimmed.rfind('.') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => (trimmed, ""),
    };
    let mut base = basis_chars(base);
    if base.is_empty() {
        base.push(b'_');
    }
    let ext: Vec<u8> = basis_chars(ext).into_iter().take(3).collect();

    // Add numeric tail ~1 through ~999999
    for n in 1..=999_999u32 {
        let tail = format!("~{}", n);
        let keep = (8 - tail.len()).min(base.len());
        let mut candidate = [b' '; 11];
        candidate[..keep].copy_from_slice(&base[..keep]);
        candidate[keep..keep + tail.len()].copy_from_slice(tail.as_bytes());
        candidate[8..8 + ext.len()].copy_from_slice(&ext);
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(WinstickError::InvalidName(format!(
        "no free 8.3 alias for '{}'",
        long_name
    )))
}

pub fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    let mut sum = 0u8;
    for &byte in short_name {
        sum = ((sum >> 1) | ((sum & 1) << 7)).wrapping_add(byte);
    }
    sum
}

/// Number of LFN entries a name needs.
pub fn lfn_entry_count(name: &str) -> usize {
    name.encode_utf16().count().div_ceil(LFN_CHARS_PER_ENTRY)
}

/// Directory slots (32-byte entries) a name occupies.
pub fn slots_for_name(name: &str) -> usize {
    match plain_short_name(name) {
        Some(_) => 1,
        None => 1 + lfn_entry_count(name),
    }
}

/// LFN entries in on-disk order: the highest ordinal (flagged 0x40) first,
/// ordinal 1 directly before the short entry.
pub fn lfn_entries(long_name: &str, short_name: &[u8; 11]) -> Vec<[u8; DIR_ENTRY_LEN]> {
    let checksum = lfn_checksum(short_name);
    let count = lfn_entry_count(long_name);

    // Name, one NUL terminator if it fits, then 0xFFFF padding
    let mut padded: Vec<u16> = long_name.encode_utf16().collect();
    if padded.len() < count * LFN_CHARS_PER_ENTRY {
        padded.push(0x0000);
    }
    padded.resize(count * LFN_CHARS_PER_ENTRY, 0xFFFF);

    (1..=count)
        .rev()
        .map(|ordinal| {
            let mut entry = [0u8; DIR_ENTRY_LEN];
            entry[0] = ordinal as u8 | if ordinal == count { LFN_LAST_ENTRY } else { 0 };
            entry[11] = ATTR_LONG_NAME;
            entry[13] = checksum;
            let chunk = &padded[(ordinal - 1) * LFN_CHARS_PER_ENTRY..ordinal * LFN_CHARS_PER_ENTRY];
            for (unit, offset) in chunk.iter().zip(LFN_OFFSETS) {
                entry[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
            }
            entry
        })
        .collect()
}

/// Reassemble a long name from LFN entries given in on-disk order.
pub fn decode_lfn(entries: &[[u8; DIR_ENTRY_LEN]]) -> String {
    let mut units = Vec::new();
    for entry in entries.iter().rev() {
        for offset in LFN_OFFSETS {
            units.push(u16::from_le_bytes([entry[offset], entry[offset + 1]]));
        }
    }
    let end = units.iter().position(|u| *u == 0x0000 || *u == 0xFFFF).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

/// Display form of an 8.3 name, honoring the NT case flags.
pub fn format_short_name(short: &[u8; 11], nt_flags: u8) -> String {
    let mut base = String::from_utf8_lossy(&short[..8]).trim_end().to_string();
    let mut ext = String::from_utf8_lossy(&short[8..]).trim_end().to_string();
    if nt_flags & NT_LOWER_BASE != 0 {
        base = base.to_ascii_lowercase();
    }
    if nt_flags & NT_LOWER_EXT != 0 {
        ext = ext.to_ascii_lowercase();
    }
    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}
