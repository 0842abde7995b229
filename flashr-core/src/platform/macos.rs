//! macOS device discovery through `diskutil`.

use crate::device::{BlockDevice, BusType, format_size};
use crate::error::{Error, Result};
use log::warn;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

pub type DiskInfo = HashMap<String, String>;

#[cfg(target_os = "macos")]
pub fn list_devices() -> Result<Vec<BlockDevice>> {
    let root = root_disk();
    if root.is_none() {
        warn!("Could not determine the boot disk; every device is treated as a system disk");
    }

    let listing = diskutil(&["list"])?;
    let mut devices = Vec::new();
    for id in parse_disk_list(&listing) {
        match diskutil(&["info", &id]) {
            Ok(output) => {
                if let Some(device) = classify(&id, &parse_info(&output), root.as_deref()) {
                    devices.push(device);
                }
            }
            Err(e) => warn!("Skipping {}: {}", id, e),
        }
    }
    Ok(devices)
}

fn diskutil(args: &[&str]) -> Result<String> {
    let output = Command::new("diskutil").args(args).output()?;
    if !output.status.success() {
        return Err(Error::Io(std::io::Error::other(format!(
            "diskutil {} exited with {}",
            args.join(" "),
            output.status
        ))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Resolves the physical disk holding the boot volume, looking through the
/// APFS container to its physical store.
#[cfg(target_os = "macos")]
fn root_disk() -> Option<String> {
    let root = parse_info(&diskutil(&["info", "/"]).ok()?);
    let whole = root.get("Part of Whole")?.clone();
    let container = diskutil(&["info", &whole]).ok().map(|o| parse_info(&o));
    Some(root_disk_from(&whole, container.as_ref()))
}

pub fn root_disk_from(whole: &str, container: Option<&DiskInfo>) -> String {
    match container.and_then(|c| c.get("APFS Physical Store")) {
        Some(store) => whole_disk(store),
        None => whole.to_string(),
    }
}

/// Physical disk identifiers from `diskutil list`, e.g. `disk0`.
pub fn parse_disk_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.starts_with("/dev/disk") && line.contains("physical"))
        .filter_map(|line| line.split_whitespace().next())
        .map(|dev| dev.trim_start_matches("/dev/").to_string())
        .collect()
}

/// Parses the `Key: Value` lines of `diskutil info`.
pub fn parse_info(output: &str) -> DiskInfo {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// `disk0s2` -> `disk0`.
fn whole_disk(id: &str) -> String {
    let id = id.trim();
    match id.strip_prefix("disk").and_then(|rest| rest.find('s')) {
        Some(index) => id[..4 + index].to_string(),
        None => id.to_string(),
    }
}

/// Parses the byte count out of `31.9 GB (31914983424 Bytes) (...)`.
fn parse_bytes(size: &str) -> Option<u64> {
    let start = size.find('(')? + 1;
    let rest = &size[start..];
    let end = rest.find(" Bytes")?;
    rest[..end].trim().parse().ok()
}

pub fn classify(id: &str, info: &DiskInfo, root: Option<&str>) -> Option<BlockDevice> {
    let size = info
        .get("Disk Size")
        .or_else(|| info.get("Total Size"))
        .and_then(|s| parse_bytes(s))
        .unwrap_or(0);
    if size == 0 {
        return None;
    }

    let bus_type = info
        .get("Protocol")
        .map(|p| BusType::from_transport(p))
        .unwrap_or(BusType::Unknown);
    let removable_media = info
        .get("Removable Media")
        .is_some_and(|v| v.eq_ignore_ascii_case("Removable"));
    let external = info
        .get("Device Location")
        .is_some_and(|v| v.eq_ignore_ascii_case("External"));
    let is_removable = removable_media || external || bus_type.is_removable_bus();

    let is_root = root.is_none_or(|r| r == id);
    let internal_fixed = !is_removable;
    let is_system = is_root || internal_fixed;

    Some(BlockDevice {
        path: PathBuf::from("/dev").join(id),
        name: id.to_string(),
        model: info.get("Device / Media Name").cloned().unwrap_or_default(),
        size,
        size_formatted: format_size(size),
        is_removable,
        is_system,
        bus_type,
    })
}
