use super::Authorizer;
use crate::error::{Error, Result};
use crate::os_options::{self, MountRelease};
use log::{debug, info, warn};
use nix::unistd::{getuid, geteuid};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{OwnedFd, Value};

const UDISKS_DESTINATION: &str = "org.freedesktop.UDisks2";
const UDISKS_BLOCK_ROOT: &str = "/org/freedesktop/UDisks2/block_devices";
const BLOCK_INTERFACE: &str = "org.freedesktop.UDisks2.Block";
const FILESYSTEM_INTERFACE: &str = "org.freedesktop.UDisks2.Filesystem";
const NOT_AUTHORIZED: &str = "org.freedesktop.UDisks2.Error.NotAuthorized";
const DISMISSED: &str = "org.freedesktop.UDisks2.Error.NotAuthorizedDismissed";

enum Grant {
    /// Opened by UDisks2 after polkit consent; taken by the flash.
    Descriptor(File),
    /// An ACL entry for the invoking user, added through pkexec.
    Acl,
}

/// Elevation through polkit.
///
/// UDisks2 is asked to open the device, which prompts through polkit and
/// hands back a descriptor; nothing on the node itself changes. Without
/// UDisks2, `pkexec setfacl` grants the invoking user an ACL entry on the one
/// node, and [`revoke`](Authorizer::revoke) removes it again.
#[derive(Default)]
pub struct PolkitAuthorizer {
    grants: Mutex<HashMap<PathBuf, Grant>>,
}

impl PolkitAuthorizer {
    fn grants(&self) -> MutexGuard<'_, HashMap<PathBuf, Grant>> {
        self.grants.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Authorizer for PolkitAuthorizer {
    fn authorize(&self, device: &Path) -> Result<bool> {
        if geteuid().is_root() {
            return Ok(true);
        }
        if OpenOptions::new().read(true).write(true).open(device).is_ok() {
            debug!("{} is already writable", device.display());
            return Ok(true);
        }

        info!("Requesting write access to {} through UDisks2", device.display());
        let opened = Connection::system()
            .map_err(UdisksFailure::from)
            .and_then(|conn| open_through_udisks(&conn, device));
        match opened {
            Ok(file) => {
                self.grants()
                    .insert(device.to_path_buf(), Grant::Descriptor(file));
                return Ok(true);
            }
            Err(UdisksFailure::Dismissed) => return Ok(false),
            Err(UdisksFailure::NotAuthorized(reason)) => {
                return Err(Error::AuthorizationDenied {
                    path: device.to_path_buf(),
                    reason,
                });
            }
            Err(UdisksFailure::Unavailable(reason)) => {
                debug!("UDisks2 could not open {}: {}", device.display(), reason);
            }
        }

        info!("Requesting write access to {} through pkexec", device.display());
        let acl = acl_entry(getuid().as_raw(), true);
        let granted = interpret_pkexec(
            pkexec(device, &[OsStr::new("setfacl"), OsStr::new("-m"), OsStr::new(&acl)])?,
            device,
        )?;
        if granted {
            self.grants().insert(device.to_path_buf(), Grant::Acl);
        }
        Ok(granted)
    }

    fn release_mounts(&self, device: &Path) -> MountRelease {
        if geteuid().is_root() {
            return os_options::release_mounts(device);
        }

        let conn = Connection::system().ok();
        for source in os_options::mounted_partitions(device) {
            let unmounted = match &conn {
                Some(conn) => unmount_through_udisks(conn, Path::new(&source)),
                None => Err(UdisksFailure::Unavailable("no system bus".to_string())),
            };
            match unmounted {
                Ok(()) => debug!("UDisks2 unmounted {}", source),
                Err(e) => {
                    warn!("UDisks2 could not unmount {}: {}", source, e);
                    match pkexec(Path::new(&source), &[OsStr::new("umount")]) {
                        Ok(Some(0)) => {}
                        Ok(code) => warn!("pkexec umount {} exited with {:?}", source, code),
                        Err(e) => warn!("Could not unmount {}: {}", source, e),
                    }
                }
            }
        }
        MountRelease::default()
    }

    fn open_device(&self, device: &Path) -> Result<Option<File>> {
        let mut grants = self.grants();
        match grants.remove(device) {
            Some(Grant::Descriptor(file)) => Ok(Some(file)),
            Some(Grant::Acl) => {
                grants.insert(device.to_path_buf(), Grant::Acl);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn revoke(&self, device: &Path) -> Result<()> {
        let grant = self.grants().remove(device);
        match grant {
            Some(Grant::Acl) => {
                info!("Removing the ACL entry on {}", device.display());
                let acl = acl_entry(getuid().as_raw(), false);
                match pkexec(device, &[OsStr::new("setfacl"), OsStr::new("-x"), OsStr::new(&acl)])? {
                    Some(0) => Ok(()),
                    code => Err(Error::AuthorizationDenied {
                        path: device.to_path_buf(),
                        reason: format!("removing the ACL entry failed with {:?}", code),
                    }),
                }
            }
            Some(Grant::Descriptor(_)) => {
                debug!("Closing the unused descriptor for {}", device.display());
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn mechanism(&self) -> &'static str {
        "polkit"
    }
}

/// Runs `pkexec <args...> <target>` and returns its exit code.
fn pkexec(target: &Path, args: &[&OsStr]) -> Result<Option<i32>> {
    let status = Command::new("pkexec")
        .args(args)
        .arg(target)
        .status()
        .map_err(|e| Error::AuthorizationDenied {
            path: target.to_path_buf(),
            reason: match e.kind() {
                io::ErrorKind::NotFound => "pkexec is not installed".to_string(),
                _ => format!("failed to run pkexec: {}", e),
            },
        })?;
    Ok(status.code())
}

/// `u:<uid>:rw` to grant, `u:<uid>` to remove.
fn acl_entry(uid: u32, grant: bool) -> String {
    if grant {
        format!("u:{}:rw", uid)
    } else {
        format!("u:{}", uid)
    }
}

/// Maps a pkexec exit code. 126 means the dialog was dismissed, 127 that
/// polkit refused or could not authenticate.
fn interpret_pkexec(code: Option<i32>, device: &Path) -> Result<bool> {
    let denied = |reason: String| Error::AuthorizationDenied {
        path: device.to_path_buf(),
        reason,
    };
    match code {
        Some(0) => Ok(true),
        Some(126) => Ok(false),
        Some(127) => Err(denied("not authorized by polkit".to_string())),
        Some(code) => Err(denied(format!("setfacl exited with status {}", code))),
        None => Err(denied("pkexec was terminated by a signal".to_string())),
    }
}

#[derive(Debug)]
enum UdisksFailure {
    Dismissed,
    NotAuthorized(String),
    /// UDisks2 is missing, does not know the device, or failed otherwise.
    Unavailable(String),
}

impl std::fmt::Display for UdisksFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UdisksFailure::Dismissed => f.write_str("authentication dismissed"),
            UdisksFailure::NotAuthorized(reason) | UdisksFailure::Unavailable(reason) => {
                f.write_str(reason)
            }
        }
    }
}

impl From<zbus::Error> for UdisksFailure {
    fn from(e: zbus::Error) -> Self {
        let name = match &e {
            zbus::Error::MethodError(name, _, _) => Some(name.as_str()),
            _ => None,
        };
        classify_udisks_error(name, e.to_string())
    }
}

fn classify_udisks_error(name: Option<&str>, reason: String) -> UdisksFailure {
    match name {
        Some(DISMISSED) => UdisksFailure::Dismissed,
        Some(name) if name.starts_with(NOT_AUTHORIZED) => UdisksFailure::NotAuthorized(reason),
        _ => UdisksFailure::Unavailable(reason),
    }
}

/// The UDisks2 object for a `/dev` node. Bytes outside `[A-Za-z0-9_]` are
/// escaped as `_xx`, as UDisks2 does.
fn block_object_path(device: &Path) -> Option<String> {
    let name = device.strip_prefix("/dev").ok()?.to_str()?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    let mut path = format!("{}/", UDISKS_BLOCK_ROOT);
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' {
            path.push(byte as char);
        } else {
            let _ = write!(path, "_{:02x}", byte);
        }
    }
    Some(path)
}

fn udisks_proxy<'a>(
    conn: &'a Connection,
    device: &Path,
    interface: &'static str,
) -> std::result::Result<Proxy<'a>, UdisksFailure> {
    let path = block_object_path(device).ok_or_else(|| {
        UdisksFailure::Unavailable(format!("{} is not a /dev node", device.display()))
    })?;
    Ok(Proxy::new(conn, UDISKS_DESTINATION, path, interface)?)
}

/// `Block.OpenDevice("rw")` with unbuffered I/O. Not exclusive: the
/// device's partitions may still be mounted at this point.
fn open_through_udisks(conn: &Connection, device: &Path) -> std::result::Result<File, UdisksFailure> {
    let proxy = udisks_proxy(conn, device, BLOCK_INTERFACE)?;
    let mut options: HashMap<&str, Value<'_>> = HashMap::new();
    options.insert("flags", Value::from(libc::O_DIRECT));
    let fd: OwnedFd = proxy.call("OpenDevice", &("rw", options))?;
    Ok(File::from(std::os::fd::OwnedFd::from(fd)))
}

fn unmount_through_udisks(conn: &Connection, partition: &Path) -> std::result::Result<(), UdisksFailure> {
    let proxy = udisks_proxy(conn, partition, FILESYSTEM_INTERFACE)?;
    let options: HashMap<&str, Value<'_>> = HashMap::new();
    let () = proxy.call("Unmount", &(options,))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::Arc;
    use zbus::blocking::ConnectionBuilder;
    use zbus::interface;
    use zbus::zvariant::OwnedValue;

    #[test]
    fn pkexec_exit_codes() {
        let dev = Path::new("/dev/sdb");
        assert!(interpret_pkexec(Some(0), dev).unwrap());
        assert!(!interpret_pkexec(Some(126), dev).unwrap());
        assert!(matches!(
            interpret_pkexec(Some(127), dev),
            Err(Error::AuthorizationDenied { .. })
        ));
        assert!(interpret_pkexec(Some(1), dev).is_err());
        assert!(interpret_pkexec(None, dev).is_err());
    }

    #[test]
    fn writable_node_needs_no_prompt() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let authorizer = PolkitAuthorizer::default();
        assert!(authorizer.authorize(file.path()).unwrap());
        assert!(authorizer.open_device(file.path()).unwrap().is_none());
        authorizer.revoke(file.path()).unwrap();
    }

    #[test]
    fn acl_entries_grant_and_remove_the_same_user() {
        assert_eq!(acl_entry(1000, true), "u:1000:rw");
        assert_eq!(acl_entry(1000, false), "u:1000");
    }

    #[test]
    fn udisks_object_paths() {
        assert_eq!(
            block_object_path(Path::new("/dev/sdb")).unwrap(),
            "/org/freedesktop/UDisks2/block_devices/sdb"
        );
        assert_eq!(
            block_object_path(Path::new("/dev/mmcblk0p1")).unwrap(),
            "/org/freedesktop/UDisks2/block_devices/mmcblk0p1"
        );
        assert_eq!(
            block_object_path(Path::new("/dev/dm-0")).unwrap(),
            "/org/freedesktop/UDisks2/block_devices/dm_2d0"
        );
        assert!(block_object_path(Path::new("/dev/disk/by-id/usb")).is_none());
        assert!(block_object_path(Path::new("/tmp/disk")).is_none());
    }

    #[test]
    fn udisks_errors_map_to_outcomes() {
        assert!(matches!(
            classify_udisks_error(Some(DISMISSED), String::new()),
            UdisksFailure::Dismissed
        ));
        assert!(matches!(
            classify_udisks_error(
                Some("org.freedesktop.UDisks2.Error.NotAuthorizedCanObtain"),
                String::new()
            ),
            UdisksFailure::NotAuthorized(_)
        ));
        assert!(matches!(
            classify_udisks_error(
                Some("org.freedesktop.DBus.Error.ServiceUnknown"),
                String::new()
            ),
            UdisksFailure::Unavailable(_)
        ));
        assert!(matches!(
            classify_udisks_error(None, String::new()),
            UdisksFailure::Unavailable(_)
        ));
    }

    #[test]
    fn granted_descriptor_is_handed_over_once() {
        let mut backing = tempfile::tempfile().unwrap();
        let device = Path::new("/dev/sdz");
        let authorizer = PolkitAuthorizer::default();
        authorizer.grants().insert(
            device.to_path_buf(),
            Grant::Descriptor(backing.try_clone().unwrap()),
        );

        let mut file = authorizer.open_device(device).unwrap().unwrap();
        file.write_all(b"image").unwrap();
        assert!(authorizer.open_device(device).unwrap().is_none());
        authorizer.revoke(device).unwrap();

        let mut written = String::new();
        backing.seek(SeekFrom::Start(0)).unwrap();
        backing.read_to_string(&mut written).unwrap();
        assert_eq!(written, "image");
    }

    #[derive(Clone, Default)]
    struct CallLog {
        entries: Arc<Mutex<Vec<String>>>,
    }

    impl CallLog {
        fn push(&self, entry: String) {
            self.entries.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.entries.lock().unwrap().clone()
        }
    }

    struct MockBlock {
        log: CallLog,
        backing: PathBuf,
    }

    #[interface(name = "org.freedesktop.UDisks2.Block")]
    impl MockBlock {
        fn open_device(
            &self,
            mode: &str,
            options: HashMap<String, OwnedValue>,
        ) -> zbus::fdo::Result<OwnedFd> {
            let mut keys: Vec<_> = options.keys().cloned().collect();
            keys.sort();
            self.log.push(format!("OpenDevice:{}:{}", mode, keys.join(",")));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.backing)
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
            Ok(OwnedFd::from(std::os::fd::OwnedFd::from(file)))
        }
    }

    struct MockFilesystem {
        log: CallLog,
    }

    #[interface(name = "org.freedesktop.UDisks2.Filesystem")]
    impl MockFilesystem {
        fn unmount(&self, _options: HashMap<String, OwnedValue>) {
            self.log.push("Unmount".to_string());
        }
    }

    fn setup_mock_udisks(backing: &Path) -> Option<(Connection, CallLog)> {
        let log = CallLog::default();
        let connection = ConnectionBuilder::session()
            .ok()?
            .name(UDISKS_DESTINATION)
            .ok()?
            .serve_at(
                format!("{}/sdz", UDISKS_BLOCK_ROOT),
                MockBlock {
                    log: log.clone(),
                    backing: backing.to_path_buf(),
                },
            )
            .ok()?
            .serve_at(
                format!("{}/sdz1", UDISKS_BLOCK_ROOT),
                MockFilesystem { log: log.clone() },
            )
            .ok()?
            .build()
            .ok()?;
        Some((connection, log))
    }

    #[test]
    fn udisks_opens_the_device_and_unmounts_partitions() {
        let backing = tempfile::NamedTempFile::new().unwrap();
        let Some((conn, log)) = setup_mock_udisks(backing.path()) else {
            return;
        };

        let mut file = open_through_udisks(&conn, Path::new("/dev/sdz")).unwrap();
        file.write_all(b"through udisks").unwrap();
        unmount_through_udisks(&conn, Path::new("/dev/sdz1")).unwrap();

        assert_eq!(
            log.entries(),
            vec![
                "OpenDevice:rw:flags".to_string(),
                "Unmount".to_string()
            ]
        );
        assert_eq!(
            std::fs::read_to_string(backing.path()).unwrap(),
            "through udisks"
        );
    }
}
