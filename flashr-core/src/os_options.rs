//! Platform-specific handling of flash targets: opening for raw I/O,
//! capacity queries, page-cache control and releasing mounts.

use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(windows)]
use std::os::windows::fs::OpenOptionsExt;

#[cfg(target_os = "linux")]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
#[cfg(target_os = "linux")]
nix::ioctl_read_bad!(blksszget, 0x1268, libc::c_int);

/// What sits behind a target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    BlockDevice,
    RegularFile,
    /// Character devices, FIFOs and the like.
    Other,
}

impl TargetKind {
    /// Whether I/O must come in whole, aligned sectors. True for block
    /// devices, which are opened unbuffered or through their raw node.
    pub fn needs_whole_sectors(self) -> bool {
        self == TargetKind::BlockDevice
    }

    /// Whether `fdatasync` is meaningful for the target.
    pub fn supports_sync(self) -> bool {
        matches!(self, TargetKind::BlockDevice | TargetKind::RegularFile)
    }
}

pub fn target_kind(path: &Path) -> io::Result<TargetKind> {
    #[cfg(windows)]
    if path.to_string_lossy().starts_with(r"\\.\") {
        return Ok(TargetKind::BlockDevice);
    }

    let file_type = std::fs::metadata(path)?.file_type();
    if file_type.is_file() {
        return Ok(TargetKind::RegularFile);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_block_device() {
            return Ok(TargetKind::BlockDevice);
        }
    }

    Ok(TargetKind::Other)
}

/// Opens a target for writing, exclusively and unbuffered where the
/// platform allows. Regular files are neither created nor truncated.
pub fn open_for_write(path: &Path, kind: TargetKind) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);

    if kind == TargetKind::BlockDevice {
        #[cfg(target_os = "linux")]
        options.custom_flags(libc::O_DIRECT | libc::O_EXCL);

        #[cfg(windows)]
        {
            use windows_sys::Win32::Storage::FileSystem::{
                FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH,
            };
            options
                .read(true)
                .custom_flags(FILE_FLAG_NO_BUFFERING | FILE_FLAG_WRITE_THROUGH);
        }
    }

    let file = options.open(path)?;

    #[cfg(target_os = "macos")]
    if kind == TargetKind::BlockDevice {
        set_nocache(&file);
    }

    Ok(file)
}

pub fn open_for_read(path: &Path, kind: TargetKind) -> io::Result<File> {
    let file = File::open(path)?;

    #[cfg(target_os = "macos")]
    if kind == TargetKind::BlockDevice {
        set_nocache(&file);
    }
    #[cfg(not(target_os = "macos"))]
    let _ = kind;

    Ok(file)
}

#[cfg(target_os = "macos")]
fn set_nocache(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: F_NOCACHE only toggles caching on a valid descriptor.
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
        warn!("F_NOCACHE failed: {}", io::Error::last_os_error());
    }
}

/// Asks the kernel to forget cached pages of `file`, so that a following
/// read really comes from the medium.
pub fn drop_cached_pages(file: &File, len: u64) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: posix_fadvise only reads its scalar arguments.
        let rc = unsafe {
            libc::posix_fadvise(
                file.as_raw_fd(),
                0,
                len as libc::off_t,
                libc::POSIX_FADV_DONTNEED,
            )
        };
        if rc != 0 {
            debug!("posix_fadvise(DONTNEED) returned {}", rc);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (file, len);
}

/// The size of the medium behind `file`, when the OS can tell.
pub fn device_capacity(file: &File, kind: TargetKind) -> io::Result<Option<u64>> {
    match kind {
        #[cfg(target_os = "linux")]
        TargetKind::BlockDevice => {
            use std::os::unix::io::AsRawFd;
            let mut size: u64 = 0;
            // SAFETY: BLKGETSIZE64 writes one u64 into `size`.
            unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(io::Error::from)?;
            Ok(Some(size))
        }
        _ => {
            let _ = file;
            Ok(None)
        }
    }
}

/// Held while a target is written. On Windows it keeps every volume of the
/// target disk locked and dismounted until dropped; elsewhere it is empty.
#[derive(Default)]
pub struct MountRelease {
    #[cfg(windows)]
    locks: Vec<volumes::VolumeLock>,
}

impl MountRelease {
    /// Number of volumes held locked.
    pub fn locked_volumes(&self) -> usize {
        #[cfg(windows)]
        {
            self.locks.len()
        }
        #[cfg(not(windows))]
        {
            0
        }
    }
}

/// Unmounts every filesystem living on `device` so it can be opened
/// exclusively. Failures are logged; the open that follows reports the
/// real problem.
pub fn release_mounts(device: &Path) -> MountRelease {
    #[cfg(target_os = "linux")]
    for source in mounted_partitions(device) {
        unmount(&source);
    }
    #[cfg(target_os = "macos")]
    {
        match std::process::Command::new("diskutil")
            .arg("unmountDisk")
            .arg(device)
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("diskutil unmountDisk exited with {}", status),
            Err(e) => warn!("Failed to run diskutil: {}", e),
        }
    }
    #[cfg(windows)]
    {
        if let Some(disk) = disk_number(device) {
            return MountRelease {
                locks: volumes::lock_disk_volumes(disk),
            };
        }
        warn!("{} is not a physical drive path", device.display());
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    let _ = device;

    MountRelease::default()
}

/// Sources in `/proc/mounts` that live on `device`.
#[cfg(target_os = "linux")]
pub fn mounted_partitions(device: &Path) -> Vec<String> {
    match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounted_sources(&mounts, device),
        Err(e) => {
            warn!("Could not read /proc/mounts: {}", e);
            Vec::new()
        }
    }
}

/// Runs `umount` on one mount source.
#[cfg(target_os = "linux")]
pub fn unmount(source: &str) {
    debug!("Unmounting {}", source);
    match std::process::Command::new("umount").arg(source).status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("umount {} exited with {}", source, status),
        Err(e) => warn!("Failed to run umount for {}: {}", source, e),
    }
}

/// Mount sources in `/proc/mounts` content that live on `device`
/// (`/dev/sdb` matches `/dev/sdb` and `/dev/sdb1`).
pub fn mounted_sources(mounts: &str, device: &Path) -> Vec<String> {
    let device = device.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|source| {
            source
                .strip_prefix(device.as_ref())
                .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit() || c == 'p'))
        })
        .map(str::to_string)
        .collect()
}

/// The disk number in a `\\.\PhysicalDriveN` path.
pub fn disk_number(path: &Path) -> Option<u32> {
    let path = path.to_str()?;
    let prefix = r"\\.\PhysicalDrive";
    let head = path.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    path[prefix.len()..].parse().ok()
}

/// Accepts power-of-two sector sizes between 512 and 4096 bytes.
fn valid_sector_size(size: u32) -> Option<usize> {
    (size.is_power_of_two() && (512..=4096).contains(&size)).then_some(size as usize)
}

/// The logical sector size of the medium behind `file`, when the OS can
/// tell. Raw reads on such targets must be whole sectors.
pub fn sector_size(file: &File, kind: TargetKind) -> Option<usize> {
    if kind != TargetKind::BlockDevice {
        return None;
    }
    #[cfg(windows)]
    {
        volumes::drive_sector_size(file).and_then(valid_sector_size)
    }
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let mut size: libc::c_int = 0;
        // SAFETY: BLKSSZGET writes one int into `size`.
        unsafe { blksszget(file.as_raw_fd(), &mut size) }.ok()?;
        u32::try_from(size).ok().and_then(valid_sector_size)
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        let _ = file;
        None
    }
}

/// Applies the raw-I/O settings of [`open_for_write`] to a descriptor some
/// other party opened on our behalf.
pub fn adopt_granted(file: File, kind: TargetKind) -> File {
    #[cfg(target_os = "macos")]
    if kind == TargetKind::BlockDevice {
        set_nocache(&file);
    }
    #[cfg(not(target_os = "macos"))]
    let _ = kind;
    file
}

/// The raw (unbuffered) node for a device: `/dev/diskN` becomes
/// `/dev/rdiskN` on macOS; other platforms use the path as is.
pub fn raw_device_path(path: &Path) -> PathBuf {
    if cfg!(target_os = "macos") {
        if let Some(rest) = path.to_str().and_then(|p| p.strip_prefix("/dev/disk")) {
            return PathBuf::from(format!("/dev/rdisk{}", rest));
        }
    }
    path.to_path_buf()
}

#[cfg(windows)]
mod volumes {
    use log::{debug, warn};
    use std::ffi::c_void;
    use std::mem;
    use std::os::windows::io::AsRawHandle;
    use std::ptr;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, FILE_GENERIC_READ, FILE_GENERIC_WRITE, FILE_SHARE_READ, FILE_SHARE_WRITE,
        FindFirstVolumeW, FindNextVolumeW, FindVolumeClose, OPEN_EXISTING,
    };
    use windows_sys::Win32::System::IO::DeviceIoControl;
    use windows_sys::Win32::System::Ioctl::{
        DISK_GEOMETRY, FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME, IOCTL_DISK_GET_DRIVE_GEOMETRY,
        IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS, VOLUME_DISK_EXTENTS,
    };

    const VOLUME_NAME_LEN: usize = 64;

    /// An open, locked and dismounted volume. The lock lasts until the
    /// handle is closed.
    pub struct VolumeLock {
        handle: HANDLE,
        name: String,
    }

    // SAFETY: the handle is owned by this value and only closed in `drop`.
    unsafe impl Send for VolumeLock {}

    impl Drop for VolumeLock {
        fn drop(&mut self) {
            debug!("Unlocking volume {}", self.name);
            // SAFETY: `handle` came from CreateFileW and is closed once.
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(Some(0)).collect()
    }

    fn open_volume(name: &str, access: u32) -> Option<HANDLE> {
        let path = wide(name);
        // SAFETY: `path` is NUL-terminated and alive for the call.
        let handle = unsafe {
            CreateFileW(
                path.as_ptr(),
                access,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                ptr::null(),
                OPEN_EXISTING,
                0,
                0,
            )
        };
        (handle != INVALID_HANDLE_VALUE).then_some(handle)
    }

    fn control(handle: HANDLE, code: u32, out: *mut c_void, out_len: u32) -> bool {
        let mut returned = 0u32;
        // SAFETY: `out` is either null or points to `out_len` writable bytes.
        unsafe {
            DeviceIoControl(
                handle,
                code,
                ptr::null(),
                0,
                out,
                out_len,
                &mut returned,
                ptr::null_mut(),
            ) != 0
        }
    }

    /// Whether the first extent of the volume lies on `disk`. Volumes that
    /// span several disks report `ERROR_MORE_DATA` and are skipped.
    fn volume_on_disk(name: &str, disk: u32) -> bool {
        let Some(handle) = open_volume(name, FILE_GENERIC_READ) else {
            return false;
        };
        // SAFETY: VOLUME_DISK_EXTENTS is plain data.
        let mut extents: VOLUME_DISK_EXTENTS = unsafe { mem::zeroed() };
        let found = control(
            handle,
            IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS,
            &mut extents as *mut _ as *mut c_void,
            mem::size_of::<VOLUME_DISK_EXTENTS>() as u32,
        ) && extents.NumberOfDiskExtents > 0
            && extents.Extents[0].DiskNumber == disk;
        // SAFETY: `handle` came from CreateFileW.
        unsafe {
            CloseHandle(handle);
        }
        found
    }

    fn lock_volume(name: &str) -> Option<VolumeLock> {
        let handle = open_volume(name, FILE_GENERIC_READ | FILE_GENERIC_WRITE)?;
        let lock = VolumeLock {
            handle,
            name: name.to_string(),
        };
        if !control(handle, FSCTL_LOCK_VOLUME, ptr::null_mut(), 0) {
            warn!(
                "Could not lock volume {}: {}",
                name,
                std::io::Error::last_os_error()
            );
        }
        if !control(handle, FSCTL_DISMOUNT_VOLUME, ptr::null_mut(), 0) {
            warn!(
                "Could not dismount volume {}: {}",
                name,
                std::io::Error::last_os_error()
            );
        }
        Some(lock)
    }

    /// Locks and dismounts every volume whose data lives on physical drive
    /// `disk`.
    pub fn lock_disk_volumes(disk: u32) -> Vec<VolumeLock> {
        let mut locks = Vec::new();
        let mut buffer = [0u16; VOLUME_NAME_LEN];
        // SAFETY: `buffer` holds VOLUME_NAME_LEN UTF-16 units.
        let find = unsafe { FindFirstVolumeW(buffer.as_mut_ptr(), VOLUME_NAME_LEN as u32) };
        if find == INVALID_HANDLE_VALUE {
            warn!(
                "Could not enumerate volumes: {}",
                std::io::Error::last_os_error()
            );
            return locks;
        }

        loop {
            let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
            let name = String::from_utf16_lossy(&buffer[..len]);
            // CreateFileW opens the volume itself only without the trailing backslash.
            let name = name.trim_end_matches('\\');
            if volume_on_disk(name, disk) {
                debug!("Locking volume {} on disk {}", name, disk);
                locks.extend(lock_volume(name));
            }
            // SAFETY: `find` is a live search handle; `buffer` as above.
            if unsafe { FindNextVolumeW(find, buffer.as_mut_ptr(), VOLUME_NAME_LEN as u32) } == 0
            {
                break;
            }
        }
        // SAFETY: `find` came from FindFirstVolumeW.
        unsafe {
            FindVolumeClose(find);
        }
        locks
    }

    pub fn drive_sector_size(file: &std::fs::File) -> Option<u32> {
        // SAFETY: DISK_GEOMETRY is plain data.
        let mut geometry: DISK_GEOMETRY = unsafe { mem::zeroed() };
        control(
            file.as_raw_handle() as HANDLE,
            IOCTL_DISK_GET_DRIVE_GEOMETRY,
            &mut geometry as *mut _ as *mut c_void,
            mem::size_of::<DISK_GEOMETRY>() as u32,
        )
        .then_some(geometry.BytesPerSector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_file_targets() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let kind = target_kind(file.path()).unwrap();
        assert_eq!(kind, TargetKind::RegularFile);
        assert!(!kind.needs_whole_sectors());
        assert!(kind.supports_sync());
        assert!(open_for_write(file.path(), kind).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn dev_null_is_not_syncable() {
        let kind = target_kind(Path::new("/dev/null")).unwrap();
        assert_eq!(kind, TargetKind::Other);
        assert!(!kind.supports_sync());
    }

    #[test]
    fn finds_partitions_of_device() {
        let mounts = "\
/dev/sdb1 /media/user/boot vfat rw 0 0
/dev/sdb2 /media/user/root ext4 rw 0 0
/dev/sdbb1 /mnt/other ext4 rw 0 0
/dev/mmcblk0p1 /boot/firmware vfat rw 0 0
tmpfs /run tmpfs rw 0 0
";
        assert_eq!(
            mounted_sources(mounts, Path::new("/dev/sdb")),
            vec!["/dev/sdb1", "/dev/sdb2"]
        );
        assert_eq!(
            mounted_sources(mounts, Path::new("/dev/mmcblk0")),
            vec!["/dev/mmcblk0p1"]
        );
    }

    #[test]
    fn physical_drive_numbers() {
        assert_eq!(disk_number(Path::new(r"\\.\PhysicalDrive3")), Some(3));
        assert_eq!(disk_number(Path::new(r"\\.\physicaldrive12")), Some(12));
        assert_eq!(disk_number(Path::new(r"\\.\PhysicalDrive")), None);
        assert_eq!(disk_number(Path::new(r"\\.\C:")), None);
        assert_eq!(disk_number(Path::new("/dev/sdb")), None);
    }

    #[test]
    fn sector_sizes_outside_the_usual_range_are_ignored() {
        assert_eq!(valid_sector_size(512), Some(512));
        assert_eq!(valid_sector_size(4096), Some(4096));
        assert_eq!(valid_sector_size(0), None);
        assert_eq!(valid_sector_size(520), None);
        assert_eq!(valid_sector_size(8192), None);
    }

    #[test]
    fn regular_files_report_no_sector_size() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(sector_size(file.as_file(), TargetKind::RegularFile), None);
        assert_eq!(MountRelease::default().locked_volumes(), 0);
    }
}
