//! Obtains permission to write to a raw device.
//!
//! Each host has exactly one [`Authorizer`], chosen once by
//! [`platform_authorizer`]. Authorization is per device path; callers must not
//! reuse a positive answer for another path.
//!
//! Outcomes:
//! - `Ok(true)`: access granted, the device can be opened for writing.
//! - `Ok(false)`: the user dismissed the prompt.
//! - `Err(Error::AuthorizationDenied)`: the host refused.
//! - `Err(Error::RelaunchRequired)`: an elevated copy of the process was
//!   started and this one should exit.
//!
//! A grant lives until [`Authorizer::revoke`]. In between, the flash releases
//! the device's mounts and opens it through the same authorizer, so any
//! privilege the host handed out is used for exactly one write.

use crate::error::Result;
use crate::os_options::{self, MountRelease};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

#[cfg(unix)]
mod descriptor;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

pub trait Authorizer: Send + Sync {
    fn authorize(&self, device: &Path) -> Result<bool>;

    /// Unmounts everything on `device`. The returned value must be held
    /// until the write is over.
    fn release_mounts(&self, device: &Path) -> MountRelease {
        os_options::release_mounts(device)
    }

    /// Opens `device` for writing with the granted privilege. `Ok(None)`
    /// means the process can open it itself.
    fn open_device(&self, device: &Path) -> Result<Option<File>> {
        let _ = device;
        Ok(None)
    }

    /// Gives back whatever [`authorize`](Self::authorize) obtained for
    /// `device`. Safe to call when nothing was granted.
    fn revoke(&self, device: &Path) -> Result<()> {
        let _ = device;
        Ok(())
    }

    /// A short name for logs, e.g. `polkit`.
    fn mechanism(&self) -> &'static str;
}

/// Returns the authorizer for the running host.
pub fn platform_authorizer() -> Arc<dyn Authorizer> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::PolkitAuthorizer::default())
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(macos::SecurityAuthorizer::default())
    }
    #[cfg(target_os = "windows")]
    {
        Arc::new(windows::UacAuthorizer)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Arc::new(Unsupported)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
struct Unsupported;

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
impl Authorizer for Unsupported {
    fn authorize(&self, device: &Path) -> Result<bool> {
        Err(crate::error::Error::AuthorizationDenied {
            path: device.to_path_buf(),
            reason: "no authorization mechanism on this platform".to_string(),
        })
    }

    fn mechanism(&self) -> &'static str {
        "unsupported"
    }
}
