pub mod device;

pub use device::MacOSDeviceManager;
