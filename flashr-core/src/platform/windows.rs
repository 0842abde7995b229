//! Windows device discovery through the Storage PowerShell module.
//!
//! `Get-Disk` is asked for a JSON snapshot together with the number of the
//! disk holding drive `C:`. Disks flagged boot or system by Windows, and the
//! disk behind `C:`, are system disks.

use crate::device::{BlockDevice, BusType, format_size};
use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
#[cfg(target_os = "windows")]
use std::process::Command;

const SNAPSHOT_SCRIPT: &str = "\
$disks = @(Get-Disk | Select-Object Number, FriendlyName, Size, BusType, IsBoot, IsSystem); \
$sys = (Get-Partition -DriveLetter C -ErrorAction SilentlyContinue).DiskNumber; \
[pscustomobject]@{ Disks = $disks; SystemDisk = $sys } | ConvertTo-Json -Depth 3 -Compress";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskRecord {
    number: u32,
    friendly_name: Option<String>,
    size: Option<u64>,
    #[serde(default)]
    bus_type: Value,
    is_boot: Option<bool>,
    is_system: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Snapshot {
    disks: Option<OneOrMany<DiskRecord>>,
    system_disk: Option<u32>,
}

#[cfg(target_os = "windows")]
pub fn list_devices() -> Result<Vec<BlockDevice>> {
    let output = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", SNAPSHOT_SCRIPT])
        .output()?;
    if !output.status.success() {
        return Err(Error::Io(std::io::Error::other(format!(
            "Get-Disk exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }
    parse_snapshot(&String::from_utf8_lossy(&output.stdout))
}

/// Builds the device list from the JSON printed by [`SNAPSHOT_SCRIPT`].
pub fn parse_snapshot(json: &str) -> Result<Vec<BlockDevice>> {
    let snapshot: Snapshot = serde_json::from_str(json.trim())
        .map_err(|e| Error::Io(std::io::Error::other(format!("malformed Get-Disk output: {}", e))))?;

    if snapshot.system_disk.is_none() {
        log::warn!("Could not determine the disk holding C:; every disk is treated as a system disk");
    }

    let mut devices: Vec<BlockDevice> = snapshot
        .disks
        .map(OneOrMany::into_vec)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|disk| classify(disk, snapshot.system_disk))
        .collect();
    devices.sort_by_key(|d| d.name.clone());
    Ok(devices)
}

fn classify(disk: DiskRecord, system_disk: Option<u32>) -> Option<BlockDevice> {
    let size = disk.size.unwrap_or(0);
    if size == 0 {
        return None;
    }

    let bus_type = bus_type(&disk.bus_type);
    let is_removable = bus_type.is_removable_bus();
    let is_system = system_disk.is_none_or(|n| n == disk.number)
        || disk.is_boot.unwrap_or(true)
        || disk.is_system.unwrap_or(true)
        || (!is_removable && bus_type == BusType::Unknown);

    Some(BlockDevice {
        path: PathBuf::from(format!(r"\\.\PhysicalDrive{}", disk.number)),
        name: format!("PhysicalDrive{}", disk.number),
        model: disk.friendly_name.unwrap_or_default().trim().to_string(),
        size,
        size_formatted: format_size(size),
        is_removable,
        is_system,
        bus_type,
    })
}

/// Maps `MSFT_Disk.BusType`, which PowerShell emits as a number or, with
/// `-EnumsAsStrings`, as a name.
fn bus_type(value: &Value) -> BusType {
    match value {
        Value::Number(n) => match n.as_u64() {
            Some(7) => BusType::Usb,
            Some(12) | Some(13) => BusType::Sd,
            Some(2) | Some(3) | Some(11) => BusType::Sata,
            Some(10) => BusType::Sas,
            Some(17) => BusType::Nvme,
            _ => BusType::Unknown,
        },
        Value::String(s) => BusType::from_transport(s),
        _ => BusType::Unknown,
    }
}
