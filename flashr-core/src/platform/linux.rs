//! Linux device discovery over sysfs.
//!
//! Discovery walks `/sys/block`. The system disk set is built from the
//! devices backing `/`, `/boot`, `/boot/efi` and `/boot/firmware`; partitions
//! are mapped to their parent disk and device-mapper or md devices are
//! followed through their `slaves/` directory down to the physical disks.

use crate::device::{BlockDevice, BusType, format_size};
use crate::error::Result;
#[cfg(target_os = "linux")]
use log::debug;
use log::warn;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
const SYS_BLOCK: &str = "/sys/block";
#[cfg(target_os = "linux")]
const SYSTEM_MOUNTS: &[&str] = &["/", "/boot", "/boot/efi", "/boot/firmware"];

/// Kernel name prefixes of devices that are never flash targets.
const SKIPPED_PREFIXES: &[&str] = &["loop", "ram", "zram", "sr", "fd", "dm-", "md", "nbd"];

/// Helper to read a specific attribute file of a block device.
fn read_sys_file(sys_block: &Path, device_name: &str, file: &str) -> io::Result<String> {
    let path = sys_block.join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

#[cfg(target_os = "linux")]
pub fn list_devices() -> Result<Vec<BlockDevice>> {
    let sys_block = Path::new(SYS_BLOCK);
    let system = system_disk_names(sys_block);
    if system.is_none() {
        warn!("Could not determine the root disk; every device is treated as a system disk");
    }
    enumerate(sys_block, system.as_ref())
}

/// Builds a [`BlockDevice`] for every eligible entry of `sys_block`.
///
/// `system` holds the kernel names of the disks backing the running system.
/// `None` means the root disk could not be determined, in which case every
/// device is flagged as system.
pub fn enumerate(sys_block: &Path, system: Option<&HashSet<String>>) -> Result<Vec<BlockDevice>> {
    let mut devices = Vec::new();

    for entry in fs::read_dir(sys_block)?.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if is_skipped(&name) {
            continue;
        }

        match read_device(sys_block, &name, system) {
            Ok(Some(device)) => devices.push(device),
            Ok(None) => {}
            Err(e) => warn!("Skipping {}: {}", name, e),
        }
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

fn is_skipped(name: &str) -> bool {
    SKIPPED_PREFIXES.iter().any(|p| name.starts_with(p))
        || (name.starts_with("mmcblk") && name.contains("boot"))
        || name.ends_with("rpmb")
}

fn read_device(
    sys_block: &Path,
    name: &str,
    system: Option<&HashSet<String>>,
) -> io::Result<Option<BlockDevice>> {
    let sectors: u64 = read_sys_file(sys_block, name, "size")?
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed size attribute"))?;
    // Empty card readers report a size of zero.
    if sectors == 0 {
        return Ok(None);
    }
    let size = sectors * 512;

    let removable_flag = read_sys_file(sys_block, name, "removable")
        .map(|s| s == "1")
        .unwrap_or(false);
    let bus_type = bus_type(sys_block, name);
    let is_removable = removable_flag || bus_type.is_removable_bus();

    let in_system_set = system.is_none_or(|set| set.contains(name));
    let is_system = in_system_set || (!is_removable && bus_type == BusType::Unknown);

    Ok(Some(BlockDevice {
        path: PathBuf::from("/dev").join(name),
        name: name.to_string(),
        model: model(sys_block, name),
        size,
        size_formatted: format_size(size),
        is_removable,
        is_system,
        bus_type,
    }))
}

fn model(sys_block: &Path, name: &str) -> String {
    let vendor = read_sys_file(sys_block, name, "device/vendor").unwrap_or_default();
    let model = read_sys_file(sys_block, name, "device/model")
        .or_else(|_| read_sys_file(sys_block, name, "device/name"))
        .unwrap_or_default();

    match (vendor.is_empty(), model.is_empty()) {
        (false, false) if !model.starts_with(&vendor) => format!("{} {}", vendor, model),
        (_, false) => model,
        (false, true) => vendor,
        (true, true) => String::new(),
    }
}

/// Classifies the bus from the device's position in the sysfs device tree,
/// falling back to the kernel name.
pub fn bus_type(sys_block: &Path, name: &str) -> BusType {
    if let Ok(real) = fs::canonicalize(sys_block.join(name)) {
        let real = real.to_string_lossy();
        if real.contains("/usb") {
            return BusType::Usb;
        }
        if real.contains("/mmc") {
            return BusType::Sd;
        }
        if real.contains("/nvme") {
            return BusType::Nvme;
        }
        if real.contains("/end_device") || real.contains("/sas_") {
            return BusType::Sas;
        }
        if real.contains("/ata") {
            return BusType::Sata;
        }
    }

    if let Ok(transport) = read_sys_file(sys_block, name, "device/transport") {
        let bus = BusType::from_transport(&transport);
        if bus != BusType::Unknown {
            return bus;
        }
    }

    if name.starts_with("mmcblk") {
        BusType::Sd
    } else if name.starts_with("nvme") {
        BusType::Nvme
    } else {
        BusType::Unknown
    }
}

/// Resolves the kernel names of the disks holding the system mounts.
///
/// Returns `None` when the device behind `/` cannot be resolved.
#[cfg(target_os = "linux")]
fn system_disk_names(sys_block: &Path) -> Option<HashSet<String>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut sources = Vec::new();

    for mount in SYSTEM_MOUNTS {
        let mount = Path::new(mount);
        if !mount.exists() {
            continue;
        }
        let source = kernel_name_of_mount(mount).or_else(|| {
            disks
                .iter()
                .find(|d| d.mount_point() == mount)
                .and_then(|d| kernel_name_of_device(Path::new(d.name())))
        });
        match source {
            Some(name) => {
                debug!("{} is backed by {}", mount.display(), name);
                sources.push(name);
            }
            None if mount == Path::new("/") => return None,
            None => {}
        }
    }

    let set = resolve_disks(sys_block, &sources);
    if set.is_empty() { None } else { Some(set) }
}

/// Finds the block device behind a mount point from its device number.
#[cfg(target_os = "linux")]
fn kernel_name_of_mount(mount: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;

    let dev = fs::metadata(mount).ok()?.dev();
    let (major, minor) = (nix::sys::stat::major(dev), nix::sys::stat::minor(dev));
    // Major 0 is an anonymous device (btrfs subvolumes, overlayfs).
    if major == 0 {
        return None;
    }
    let link = PathBuf::from(format!("/sys/dev/block/{}:{}", major, minor));
    let real = fs::canonicalize(link).ok()?;
    real.file_name().map(|n| n.to_string_lossy().to_string())
}

#[cfg(target_os = "linux")]
fn kernel_name_of_device(device: &Path) -> Option<String> {
    let device = if device.is_absolute() {
        device.to_path_buf()
    } else {
        Path::new("/dev").join(device)
    };
    let real = fs::canonicalize(device).ok()?;
    real.file_name().map(|n| n.to_string_lossy().to_string())
}

/// Maps kernel names (partitions, dm or md devices, whole disks) to the set
/// of whole disks they live on, following `slaves/` recursively.
pub fn resolve_disks(sys_block: &Path, names: &[String]) -> HashSet<String> {
    let mut disks = HashSet::new();
    let mut pending: Vec<String> = names.to_vec();
    let mut seen = HashSet::new();

    while let Some(name) = pending.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }

        let disk = if sys_block.join(&name).exists() {
            name.clone()
        } else {
            parent_disk(sys_block, &name)
        };

        let slaves = sys_block.join(&disk).join("slaves");
        let mut has_slaves = false;
        if let Ok(entries) = fs::read_dir(&slaves) {
            for entry in entries.filter_map(|e| e.ok()) {
                has_slaves = true;
                pending.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        if !has_slaves {
            disks.insert(disk);
        }
    }

    disks
}

/// Finds the whole disk a partition belongs to.
fn parent_disk(sys_block: &Path, partition: &str) -> String {
    if let Ok(entries) = fs::read_dir(sys_block) {
        for entry in entries.filter_map(|e| e.ok()) {
            let disk = entry.file_name().to_string_lossy().to_string();
            if sys_block.join(&disk).join(partition).exists() {
                return disk;
            }
        }
    }
    parent_disk_by_name(partition)
}

/// Strips the partition suffix from a kernel name: `sda1` -> `sda`,
/// `mmcblk0p2` -> `mmcblk0`, `nvme0n1p3` -> `nvme0n1`.
fn parent_disk_by_name(partition: &str) -> String {
    if partition.starts_with("mmcblk") || partition.starts_with("nvme") {
        if let Some(index) = partition.rfind('p') {
            if index > 0 && partition[index + 1..].chars().all(|c| c.is_ascii_digit()) {
                return partition[..index].to_string();
            }
        }
        return partition.to_string();
    }
    partition
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    /// A fake `/sys` with `block/<name>` symlinks into a device tree.
    struct FakeSysfs {
        root: TempDir,
    }

    impl FakeSysfs {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            fs::create_dir_all(root.path().join("block")).unwrap();
            Self { root }
        }

        fn sys_block(&self) -> PathBuf {
            self.root.path().join("block")
        }

        fn add_disk(&self, topology: &str, name: &str, sectors: u64, removable: bool) -> PathBuf {
            let dir = self
                .root
                .path()
                .join("devices")
                .join(topology)
                .join("block")
                .join(name);
            fs::create_dir_all(dir.join("device")).unwrap();
            fs::write(dir.join("size"), format!("{}\n", sectors)).unwrap();
            fs::write(dir.join("removable"), if removable { "1\n" } else { "0\n" }).unwrap();
            symlink(&dir, self.sys_block().join(name)).unwrap();
            dir
        }

        fn add_partition(&self, disk_dir: &Path, name: &str) {
            fs::create_dir_all(disk_dir.join(name)).unwrap();
        }
    }

    fn names(devices: &[BlockDevice]) -> Vec<&str> {
        devices.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn classifies_bus_and_system_flag() {
        let sys = FakeSysfs::new();
        let nvme = sys.add_disk("pci0000:00/0000:00:1d.0/nvme/nvme0", "nvme0n1", 1_000_000, false);
        sys.add_partition(&nvme, "nvme0n1p2");
        let usb = sys.add_disk("pci0000:00/usb1/1-2/1-2:1.0/host6/target6:0:0/6:0:0:0", "sdb", 60_000_000, false);
        fs::write(usb.join("device/vendor"), "SanDisk \n").unwrap();
        fs::write(usb.join("device/model"), "Ultra\n").unwrap();
        sys.add_disk("platform/fe320000.mmc/mmc_host/mmc1/mmc1:aaaa", "mmcblk0", 62_333_952, false);

        let system = resolve_disks(&sys.sys_block(), &["nvme0n1p2".to_string()]);
        let devices = enumerate(&sys.sys_block(), Some(&system)).unwrap();
        assert_eq!(names(&devices), vec!["mmcblk0", "nvme0n1", "sdb"]);

        let nvme = &devices[1];
        assert_eq!(nvme.bus_type, BusType::Nvme);
        assert!(nvme.is_system);

        let usb = &devices[2];
        assert_eq!(usb.bus_type, BusType::Usb);
        assert!(usb.is_removable, "USB disks count as removable even with removable=0");
        assert!(!usb.is_system);
        assert_eq!(usb.model, "SanDisk Ultra");
        assert_eq!(usb.size, 60_000_000 * 512);

        assert_eq!(devices[0].bus_type, BusType::Sd);
        assert!(!devices[0].is_system);
    }

    #[test]
    fn unresolved_root_marks_everything_system() {
        let sys = FakeSysfs::new();
        sys.add_disk("pci0000:00/usb1/1-1", "sdc", 1024, true);

        let devices = enumerate(&sys.sys_block(), None).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].is_system);
    }

    #[test]
    fn fixed_disk_with_unknown_bus_is_system() {
        let sys = FakeSysfs::new();
        sys.add_disk("virtual/mystery", "vda", 4096, false);

        let devices = enumerate(&sys.sys_block(), Some(&HashSet::new())).unwrap();
        assert_eq!(devices[0].bus_type, BusType::Unknown);
        assert!(devices[0].is_system);
    }

    #[test]
    fn skips_virtual_and_empty_devices() {
        let sys = FakeSysfs::new();
        sys.add_disk("virtual/loop", "loop0", 2048, false);
        sys.add_disk("virtual/zram", "zram0", 2048, false);
        sys.add_disk("platform/mmc_host/mmc0", "mmcblk0boot0", 8192, false);
        sys.add_disk("pci0000:00/usb2/2-1", "sdd", 0, true);
        sys.add_disk("pci0000:00/usb2/2-2", "sde", 2048, true);

        let devices = enumerate(&sys.sys_block(), Some(&HashSet::new())).unwrap();
        assert_eq!(names(&devices), vec!["sde"]);
    }

    #[test]
    fn device_with_unreadable_size_is_skipped() {
        let sys = FakeSysfs::new();
        let dir = sys.add_disk("pci0000:00/usb3/3-1", "sdf", 2048, true);
        fs::write(dir.join("size"), "garbage").unwrap();
        sys.add_disk("pci0000:00/usb3/3-2", "sdg", 2048, true);

        let devices = enumerate(&sys.sys_block(), Some(&HashSet::new())).unwrap();
        assert_eq!(names(&devices), vec!["sdg"]);
    }

    #[test]
    fn device_mapper_root_resolves_to_physical_disk() {
        let sys = FakeSysfs::new();
        let ssd = sys.add_disk("pci0000:00/ata1/host0/target0:0:0", "sda", 1_000_000, false);
        sys.add_partition(&ssd, "sda3");
        let dm = sys.add_disk("virtual", "dm-0", 900_000, false);
        fs::create_dir_all(dm.join("slaves/sda3")).unwrap();

        let system = resolve_disks(&sys.sys_block(), &["dm-0".to_string()]);
        assert_eq!(system, HashSet::from(["sda".to_string()]));
    }

    #[test]
    fn partition_names_strip_to_parent() {
        assert_eq!(parent_disk_by_name("sda1"), "sda");
        assert_eq!(parent_disk_by_name("mmcblk0p2"), "mmcblk0");
        assert_eq!(parent_disk_by_name("nvme0n1p3"), "nvme0n1");
        assert_eq!(parent_disk_by_name("nvme0n1"), "nvme0n1");
    }
}
