use super::{Authorizer, descriptor};
use crate::error::{Error, Result};
use log::{debug, info, warn};
use nix::unistd::geteuid;
use std::collections::HashMap;
use std::ffi::{CString, c_char, c_void};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::ptr;
use std::sync::{Mutex, MutexGuard};

type AuthorizationRef = *mut c_void;
type OsStatus = i32;

#[repr(C)]
struct AuthorizationItem {
    name: *const c_char,
    value_length: usize,
    value: *mut c_void,
    flags: u32,
}

#[repr(C)]
struct AuthorizationRights {
    count: u32,
    items: *mut AuthorizationItem,
}

const EXTERNAL_FORM_LEN: usize = 32;

#[repr(C)]
struct AuthorizationExternalForm {
    bytes: [u8; EXTERNAL_FORM_LEN],
}

const ERR_AUTHORIZATION_SUCCESS: OsStatus = 0;
const ERR_AUTHORIZATION_CANCELED: OsStatus = -60006;

const FLAG_INTERACTION_ALLOWED: u32 = 1 << 0;
const FLAG_EXTEND_RIGHTS: u32 = 1 << 1;
const FLAG_PREAUTHORIZE: u32 = 1 << 4;
const FLAG_DEFAULTS: u32 = 0;

const AUTHOPEN: &str = "/usr/libexec/authopen";

#[link(name = "Security", kind = "framework")]
unsafe extern "C" {
    fn AuthorizationCreate(
        rights: *const AuthorizationRights,
        environment: *const AuthorizationRights,
        flags: u32,
        authorization: *mut AuthorizationRef,
    ) -> OsStatus;

    fn AuthorizationMakeExternalForm(
        authorization: AuthorizationRef,
        external: *mut AuthorizationExternalForm,
    ) -> OsStatus;

    fn AuthorizationFree(authorization: AuthorizationRef, flags: u32) -> OsStatus;
}

/// A live authorization for one raw disk, freed on drop.
struct Grant {
    auth: AuthorizationRef,
    external: [u8; EXTERNAL_FORM_LEN],
}

// SAFETY: an AuthorizationRef may be used and freed from any thread.
unsafe impl Send for Grant {}

impl Drop for Grant {
    fn drop(&mut self) {
        // SAFETY: `auth` came from AuthorizationCreate and is freed once.
        unsafe {
            AuthorizationFree(self.auth, FLAG_DEFAULTS);
        }
    }
}

/// Administrator (or Touch ID) consent through the Security framework.
///
/// The right `sys.openfile.readwrite./dev/rdiskN` is kept per device until
/// [`revoke`](Authorizer::revoke); the device itself is opened by `authopen`,
/// which checks that right and passes the descriptor back over a socket.
#[derive(Default)]
pub struct SecurityAuthorizer {
    grants: Mutex<HashMap<PathBuf, Grant>>,
}

impl SecurityAuthorizer {
    fn grants(&self) -> MutexGuard<'_, HashMap<PathBuf, Grant>> {
        self.grants.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Authorizer for SecurityAuthorizer {
    fn authorize(&self, device: &Path) -> Result<bool> {
        if geteuid().is_root() {
            return Ok(true);
        }

        let raw = crate::os_options::raw_device_path(device);
        let right = format!("sys.openfile.readwrite.{}", raw.display());
        let denied = |reason: String| Error::AuthorizationDenied {
            path: device.to_path_buf(),
            reason,
        };
        let name = CString::new(right).map_err(|e| denied(e.to_string()))?;

        let mut item = AuthorizationItem {
            name: name.as_ptr(),
            value_length: 0,
            value: ptr::null_mut(),
            flags: 0,
        };
        let rights = AuthorizationRights {
            count: 1,
            items: &mut item,
        };
        let mut auth: AuthorizationRef = ptr::null_mut();

        info!("Requesting administrator consent for {}", raw.display());
        // SAFETY: `rights` and `item` outlive the call.
        let status = unsafe {
            AuthorizationCreate(
                &rights,
                ptr::null(),
                FLAG_INTERACTION_ALLOWED | FLAG_EXTEND_RIGHTS | FLAG_PREAUTHORIZE,
                &mut auth,
            )
        };
        if auth.is_null() {
            return match status {
                ERR_AUTHORIZATION_CANCELED => Ok(false),
                status => Err(denied(format!("Security framework status {}", status))),
            };
        }

        let mut grant = Grant {
            auth,
            external: [0; EXTERNAL_FORM_LEN],
        };
        match status {
            ERR_AUTHORIZATION_SUCCESS => {}
            ERR_AUTHORIZATION_CANCELED => return Ok(false),
            status => return Err(denied(format!("Security framework status {}", status))),
        }

        let mut external = AuthorizationExternalForm {
            bytes: [0; EXTERNAL_FORM_LEN],
        };
        // SAFETY: `grant.auth` is live and `external` is writable.
        let status = unsafe { AuthorizationMakeExternalForm(grant.auth, &mut external) };
        if status != ERR_AUTHORIZATION_SUCCESS {
            return Err(denied(format!(
                "could not externalize the authorization: status {}",
                status
            )));
        }
        grant.external = external.bytes;

        self.grants().insert(device.to_path_buf(), grant);
        Ok(true)
    }

    fn open_device(&self, device: &Path) -> Result<Option<File>> {
        let external = match self.grants().get(device) {
            Some(grant) => grant.external,
            None => return Ok(None),
        };
        let raw = crate::os_options::raw_device_path(device);
        debug!("Opening {} through authopen", raw.display());
        open_with_authopen(&raw, &external)
            .map(Some)
            .map_err(|e| Error::AuthorizationDenied {
                path: device.to_path_buf(),
                reason: format!("authopen could not open {}: {}", raw.display(), e),
            })
    }

    fn revoke(&self, device: &Path) -> Result<()> {
        if self.grants().remove(device).is_some() {
            debug!("Released the authorization for {}", device.display());
        }
        Ok(())
    }

    fn mechanism(&self) -> &'static str {
        "security-framework"
    }
}

/// Runs `authopen -stdoutpipe -extauth`, hands it the external form on
/// stdin and receives the opened descriptor on its stdout socket.
fn open_with_authopen(raw: &Path, external: &[u8; EXTERNAL_FORM_LEN]) -> io::Result<File> {
    let (ours, theirs) = UnixStream::pair()?;
    let mut child = Command::new(AUTHOPEN)
        .arg("-stdoutpipe")
        .arg("-extauth")
        .arg("-o")
        .arg(libc::O_RDWR.to_string())
        .arg(raw)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(OwnedFd::from(theirs)))
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(external)?;
    }
    let received = descriptor::receive(&ours);
    let status = child.wait()?;
    if !status.success() {
        warn!("authopen exited with {}", status);
        return Err(io::Error::other(format!("authopen exited with {}", status)));
    }
    received
}
