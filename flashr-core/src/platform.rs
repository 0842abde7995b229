//! Provides platform-specific device discovery.
//!
//! Each submodule splits its work in two: a thin layer that captures raw data
//! from the operating system (sysfs, `diskutil`, `Get-Disk`), and pure
//! classification functions over that data. The classification functions are
//! compiled on every host so that each platform's system-disk policy is
//! tested everywhere.
//!
//! The rest of the library reaches the host through the [`DeviceEnumerator`]
//! trait, which lets the engine run against a fake device table in tests.

use crate::device::BlockDevice;
use crate::error::Result;

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub mod linux;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub mod macos;
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub mod windows;

/// A source of block devices.
pub trait DeviceEnumerator: Send + Sync {
    fn list_devices(&self) -> Result<Vec<BlockDevice>>;
}

/// Enumerates the devices of the running host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnumerator;

impl DeviceEnumerator for SystemEnumerator {
    fn list_devices(&self) -> Result<Vec<BlockDevice>> {
        list_devices()
    }
}

/// Lists every block device attached to the host, system disks included.
///
/// No elevation is needed. Devices that cannot be read are skipped with a
/// warning rather than failing the whole listing.
pub fn list_devices() -> Result<Vec<BlockDevice>> {
    #[cfg(target_os = "linux")]
    {
        linux::list_devices()
    }
    #[cfg(target_os = "macos")]
    {
        macos::list_devices()
    }
    #[cfg(target_os = "windows")]
    {
        windows::list_devices()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        log::warn!("Device enumeration is not supported on this platform");
        Ok(Vec::new())
    }
}
