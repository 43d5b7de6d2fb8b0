// FAT32 module - constructor and reader

pub mod boot_sector;
pub mod constants;
pub mod names;
pub mod params;
pub mod reader;
pub mod timestamps;
pub mod volume;

pub use params::Fat32Params;
pub use reader::{FatDirEntry, Fat32Reader};
pub use timestamps::DosTimestamp;
pub use volume::{Fat32Volume, FileAttributes, FileExtent, FileWriter, FormatOptions};
