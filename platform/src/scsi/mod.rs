//! Raw access to USB mass-storage devices over the bulk-only transport, for
//! hosts where the operating system's block layer cannot be used.

pub mod command;
pub mod device;

pub use device::{BulkTransport, ScsiBlockDevice};
