// MS-DOS date/time handling for directory entries

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET: i64 = 11_644_473_600;

/// FAT date: bits 15-9 year (0=1980), 8-5 month, 4-0 day.
/// FAT time: bits 15-11 hours, 10-5 minutes, 4-0 seconds/2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosTimestamp {
    pub date: u16,
    pub time: u16,
}

impl DosTimestamp {
    /// 1980-01-01 00:00:00, the earliest expressible moment.
    pub const EPOCH: DosTimestamp = DosTimestamp {
        date: (1 << 5) | 1,
        time: 0,
    };

    pub fn from_unix(seconds: i64) -> Self {
        let Some(datetime) = DateTime::<Utc>::from_timestamp(seconds, 0) else {
            return Self::EPOCH;
        };
        // Clamp year to FAT range (1980-2107)
        if datetime.year() < 1980 {
            return Self::EPOCH;
        }
        if datetime.year() > 2107 {
            return Self {
                date: (127 << 9) | (12 << 5) | 31,
                time: (23 << 11) | (59 << 5) | 29,
            };
        }
        let date = (((datetime.year() - 1980) as u16) << 9)
            | ((datetime.month() as u16) << 5)
            | datetime.day() as u16;
        let time = ((datetime.hour() as u16) << 11)
            | ((datetime.minute() as u16) << 5)
            | (datetime.second() / 2) as u16;
        Self { date, time }
    }

    /// From an NTFS FILETIME (100ns intervals since 1601-01-01).
    pub fn from_filetime(filetime: u64) -> Self {
        Self::from_unix((filetime / 10_000_000) as i64 - FILETIME_UNIX_OFFSET)
    }
}

impl Default for DosTimestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}
