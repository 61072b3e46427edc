//! `lsblk --json` listings, used to find the NVMe disks fio can own.

use serde::Deserialize;

use crate::error::ParseError;

#[derive(Debug, Deserialize)]
struct Listing {
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    name: String,
    /// Partitions or holders; absent on an unused disk
    children: Option<serde_json::Value>,
}

/// Device paths of NVMe disks with no partitions or holders, in listing order.
pub fn free_nvme_disks(content: &str) -> Result<Vec<String>, ParseError> {
    let listing: Listing = serde_json::from_str(content)
        .map_err(|e| ParseError::MalformedDeviceListing(e.to_string()))?;

    Ok(listing
        .blockdevices
        .into_iter()
        .filter(|device| device.name.starts_with("nvme") && device.children.is_none())
        .map(|device| format!("/dev/{}", device.name))
        .collect())
}
