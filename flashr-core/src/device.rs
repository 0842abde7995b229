use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The bus a block device is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusType {
    #[serde(rename = "SD")]
    Sd,
    #[serde(rename = "USB")]
    Usb,
    #[serde(rename = "SATA")]
    Sata,
    #[serde(rename = "SAS")]
    Sas,
    #[serde(rename = "NVMe")]
    Nvme,
    #[serde(rename = "unknown")]
    Unknown,
}

impl BusType {
    /// Buses whose devices are removable media in practice, regardless of
    /// what the kernel's removable flag says (many USB SSDs report 0).
    pub fn is_removable_bus(self) -> bool {
        matches!(self, BusType::Sd | BusType::Usb)
    }

    /// Maps a transport or protocol name reported by the OS.
    pub fn from_transport(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "usb" => BusType::Usb,
            "sd" | "mmc" | "secure digital" | "sdio" => BusType::Sd,
            "sata" | "ata" | "atapi" | "pata" => BusType::Sata,
            "sas" => BusType::Sas,
            "nvme" | "pci-express" | "pcie" => BusType::Nvme,
            _ => BusType::Unknown,
        }
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusType::Sd => "SD",
            BusType::Usb => "USB",
            BusType::Sata => "SATA",
            BusType::Sas => "SAS",
            BusType::Nvme => "NVMe",
            BusType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Represents a block device discovered on the system.
///
/// Populated by the platform-specific enumerators in [`crate::platform`] and
/// recomputed on every enumeration. The `is_system` flag is conservative: a
/// device is only cleared when the enumerator could prove it does not hold
/// the running system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// The system path to the device (e.g., `/dev/sda` or `\\.\PhysicalDrive1`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// Vendor and model, when the platform reports them.
    pub model: String,
    /// Size in bytes.
    pub size: u64,
    pub size_formatted: String,
    pub is_removable: bool,
    pub is_system: bool,
    pub bus_type: BusType,
}

impl BlockDevice {
    /// Whether the device may be offered as a flash target.
    pub fn is_flashable(&self) -> bool {
        !self.is_system
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let model = if self.model.is_empty() {
            "Unknown device"
        } else {
            self.model.as_str()
        };
        let flag = if self.is_system { " [SYSTEM]" } else { "" };

        write!(
            f,
            "{:<22} {:>10}  {:<7} {}{}",
            self.path.display(),
            self.size_formatted,
            self.bus_type.to_string(),
            model,
            flag
        )
    }
}

/// Formats a byte count with binary units, e.g. `29.7 GiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(4096), "4.0 KiB");
        assert_eq!(format_size(31_914_983_424), "29.7 GiB");
    }

    #[test]
    fn transports_map_to_bus_types() {
        assert_eq!(BusType::from_transport("usb"), BusType::Usb);
        assert_eq!(BusType::from_transport("Secure Digital"), BusType::Sd);
        assert_eq!(BusType::from_transport("PCI-Express"), BusType::Nvme);
        assert_eq!(BusType::from_transport("firewire"), BusType::Unknown);
        assert!(BusType::Sd.is_removable_bus());
        assert!(!BusType::Sata.is_removable_bus());
    }

    #[test]
    fn bus_type_serializes_with_display_names() {
        let json = serde_json::to_string(&BusType::Nvme).unwrap();
        assert_eq!(json, "\"NVMe\"");
        let back: BusType = serde_json::from_str("\"SD\"").unwrap();
        assert_eq!(back, BusType::Sd);
    }

    #[test]
    fn system_devices_are_flagged_in_listing() {
        let device = BlockDevice {
            path: PathBuf::from("/dev/nvme0n1"),
            name: "nvme0n1".into(),
            model: "Samsung SSD 980".into(),
            size: 500_107_862_016,
            size_formatted: format_size(500_107_862_016),
            is_removable: false,
            is_system: true,
            bus_type: BusType::Nvme,
        };
        assert!(!device.is_flashable());
        assert!(device.to_string().ends_with("[SYSTEM]"));
    }
}
