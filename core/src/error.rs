use crate::progress::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::ops::Range;
use thiserror::Error;

pub type Result<T, E = WinstickError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum WinstickError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Device is not removable: {0}")]
    NotRemovable(String),

    #[error("Misaligned write: {len} bytes is not a multiple of the {sector_size}-byte sector size")]
    MisalignedWrite { len: usize, sector_size: u32 },

    #[error("Insufficient space: {required} sectors required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("File too large for FAT32: {path} is {size} bytes")]
    FileTooLarge { path: String, size: u64 },

    #[error("No compatible driver: {0}")]
    DriverIncompatible(String),

    #[error("Driver payload needs {required} bytes but only {reserved} are reserved")]
    PayloadTooLarge { required: u64, reserved: u64 },

    #[error(
        "Verification mismatch in sectors {}: expected crc {expected:08x}, read back {actual:08x}",
        span(.sectors)
    )]
    VerificationMismatch {
        sectors: Range<u64>,
        expected: u32,
        actual: u32,
    },

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("I/O failure{}: {source}", suffix(.sectors))]
    Io {
        sectors: Option<Range<u64>>,
        #[source]
        source: io::Error,
    },

    #[error("Invalid source image: {0}")]
    InvalidSource(String),

    #[error("Invalid partition layout: {0}")]
    InvalidLayout(String),

    #[error("Other error: {0}")]
    Other(String),
}

fn span(sectors: &Range<u64>) -> String {
    format!("{}..{}", sectors.start, sectors.end)
}

fn suffix(sectors: &Option<Range<u64>>) -> String {
    match sectors {
        Some(range) => format!(" in sectors {}", span(range)),
        None => String::new(),
    }
}

impl WinstickError {
    /// I/O failure tied to a range of device sectors.
    pub fn io_at(sectors: Range<u64>, source: io::Error) -> Self {
        WinstickError::Io {
            sectors: Some(sectors),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WinstickError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            WinstickError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            WinstickError::NotRemovable(_) => ErrorKind::NotRemovable,
            WinstickError::MisalignedWrite { .. } => ErrorKind::MisalignedWrite,
            WinstickError::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            WinstickError::InvalidName(_) => ErrorKind::InvalidName,
            WinstickError::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            WinstickError::DriverIncompatible(_) => ErrorKind::DriverIncompatible,
            WinstickError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            WinstickError::VerificationMismatch { .. } => ErrorKind::VerificationMismatch,
            WinstickError::Cancelled => ErrorKind::Cancelled,
            WinstickError::Io { .. } => ErrorKind::IoFailure,
            WinstickError::InvalidSource(_) => ErrorKind::InvalidSource,
            WinstickError::InvalidLayout(_) => ErrorKind::InvalidLayout,
            WinstickError::Other(_) => ErrorKind::Other,
        }
    }

    /// Device sectors involved in the failure, when known.
    pub fn sectors(&self) -> Option<Range<u64>> {
        match self {
            WinstickError::VerificationMismatch { sectors, .. } => Some(sectors.clone()),
            WinstickError::Io { sectors, .. } => sectors.clone(),
            _ => None,
        }
    }

    /// Attach a sector range to an I/O failure that has none yet.
    pub fn with_sectors(self, range: Range<u64>) -> Self {
        match self {
            WinstickError::Io {
                sectors: None,
                source,
            } => WinstickError::io_at(range, source),
            other => other,
        }
    }
}

impl From<io::Error> for WinstickError {
    fn from(err: io::Error) -> Self {
        // Errors raised inside io::Write adapters travel wrapped in an io::Error.
        if err
            .get_ref()
            .map_or(false, |inner| inner.is::<WinstickError>())
        {
            if let Some(Ok(inner)) = err.into_inner().map(|e| e.downcast::<WinstickError>()) {
                return *inner;
            }
            return WinstickError::Other("lost wrapped error".to_string());
        }
        WinstickError::Io {
            sectors: None,
            source: err,
        }
    }
}

impl From<WinstickError> for io::Error {
    fn from(err: WinstickError) -> Self {
        match err {
            WinstickError::Io {
                sectors: None,
                source,
            } => source,
            other => {
                let kind = match other.kind() {
                    ErrorKind::InvalidName | ErrorKind::MisalignedWrite => io::ErrorKind::InvalidInput,
                    ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
                    ErrorKind::Cancelled => io::ErrorKind::Interrupted,
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

impl From<serde_json::Error> for WinstickError {
    fn from(err: serde_json::Error) -> Self {
        WinstickError::Other(format!("Serialization error: {}", err))
    }
}

/// Fieldless classification of a [`WinstickError`], used in terminal results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PermissionDenied,
    DeviceBusy,
    NotRemovable,
    MisalignedWrite,
    InsufficientSpace,
    InvalidName,
    FileTooLarge,
    DriverIncompatible,
    PayloadTooLarge,
    VerificationMismatch,
    Cancelled,
    #[serde(rename = "IOFailure")]
    IoFailure,
    InvalidSource,
    InvalidLayout,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::IoFailure => write!(f, "IOFailure"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Reason carried by a failed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: ErrorKind,
    pub phase: Phase,
    pub sectors: Option<Range<u64>>,
    pub message: String,
}

impl SessionFailure {
    pub fn new(err: &WinstickError, phase: Phase) -> Self {
        Self {
            kind: err.kind(),
            phase,
            sectors: err.sectors(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} during {}: {}", self.kind, self.phase, self.message)
    }
}
