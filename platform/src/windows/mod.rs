pub mod device;
pub mod elevation;

pub use device::WindowsDeviceManager;
pub use elevation::is_elevated;
