pub mod file;
pub mod scsi;
pub mod usb;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "macos")]
pub mod macos;

pub use file::{FileBlockDevice, ReleaseGuard};
pub use scsi::{BulkTransport, ScsiBlockDevice};
pub use usb::UsbDeviceManager;

#[cfg(target_os = "linux")]
pub use linux::LinuxDeviceManager as PlatformDeviceManager;

#[cfg(target_os = "windows")]
pub use windows::WindowsDeviceManager as PlatformDeviceManager;

#[cfg(target_os = "macos")]
pub use macos::MacOSDeviceManager as PlatformDeviceManager;
