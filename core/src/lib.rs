pub mod boot;
pub mod config;
pub mod device;
pub mod error;
pub mod progress;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use boot::BootMode;
pub use config::SessionConfig;
pub use device::{BlockDevice, Device, DeviceManager, DeviceType, Geometry, LockState};
pub use error::{ErrorKind, Result, SessionFailure, WinstickError};
pub use progress::{CancelToken, NullProgress, Phase, ProgressEvent, ProgressSink};
