// Everything that turns a source image into bootable media: partition
// tables, the FAT32 builder, the NTFS reader, driver injection and the
// session that drives them against a locked device.

pub mod fat32;
pub mod inject;
pub mod ntfs;
pub mod partition;
pub mod session;
pub mod source;
pub mod verify;

#[cfg(test)]
mod testing;

pub use fat32::{Fat32Params, Fat32Reader, Fat32Volume};
pub use inject::{inject, BootConfig, DriverCatalog, DriverVariant, InjectionReport};
pub use partition::{plan, read_table, write_table, Layout, PartitionTable, Scheme};
pub use session::{
    plan_session, spawn_session, MeteredDevice, Outcome, SessionHandle, SessionReport, WriteSession,
};
pub use source::{Container, EntryInfo, SourceImage};
pub use verify::{verify_records, VerificationRecord};
