use super::Authorizer;
use crate::error::{Error, Result};
use log::info;
use std::ffi::OsStr;
use std::iter;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use windows_sys::Win32::UI::Shell::{IsUserAnAdmin, ShellExecuteW};
use windows_sys::Win32::UI::WindowsAndMessaging::SW_SHOWNORMAL;

/// `ShellExecuteW` result when the user declined the UAC prompt.
const SE_ERR_ACCESSDENIED: isize = 5;

/// Elevation by relaunching the executable through UAC.
///
/// Windows cannot elevate a running process, so an unelevated process starts
/// an elevated copy of itself with the same arguments and reports
/// [`Error::RelaunchRequired`].
pub struct UacAuthorizer;

impl Authorizer for UacAuthorizer {
    fn authorize(&self, device: &Path) -> Result<bool> {
        // SAFETY: IsUserAnAdmin takes no arguments.
        if unsafe { IsUserAnAdmin() } != 0 {
            return Ok(true);
        }

        let exe = std::env::current_exe()?;
        let params = std::env::args()
            .skip(1)
            .map(|a| quote(&a))
            .collect::<Vec<_>>()
            .join(" ");

        let verb = wide(OsStr::new("runas"));
        let file = wide(exe.as_os_str());
        let params = wide(OsStr::new(&params));

        info!("Relaunching elevated to write {}", device.display());
        // SAFETY: every pointer is a NUL-terminated UTF-16 buffer alive for the call.
        let result = unsafe {
            ShellExecuteW(
                0,
                verb.as_ptr(),
                file.as_ptr(),
                params.as_ptr(),
                ptr::null(),
                SW_SHOWNORMAL,
            )
        } as isize;

        match result {
            r if r > 32 => Err(Error::RelaunchRequired),
            SE_ERR_ACCESSDENIED => Ok(false),
            r => Err(Error::AuthorizationDenied {
                path: device.to_path_buf(),
                reason: format!("ShellExecuteW failed with code {}", r),
            }),
        }
    }

    fn mechanism(&self) -> &'static str {
        "uac"
    }
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(iter::once(0)).collect()
}

fn quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('"', "\\\""))
}
