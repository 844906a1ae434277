//! USB interface presence and recovery
//!
//! KNX-USB sticks wedge. Presence is read from sysfs (cheap, ~5 ms);
//! recovery shells out to the `usbreset` utility keyed by vendor:product.
//! A failed reset is logged and never fatal.

use std::path::Path;

use crate::error::{Error, Result};

const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";
const USBRESET_BINARY: &str = "usbreset";

/// Whether a USB device with the given vendor/product id is enumerated
pub async fn device_present(vendor_id: &str, product_id: &str) -> Result<bool> {
    device_present_in(Path::new(SYSFS_USB_DEVICES), vendor_id, product_id).await
}

pub(crate) async fn device_present_in(
    root: &Path,
    vendor_id: &str,
    product_id: &str,
) -> Result<bool> {
    let mut entries = tokio::fs::read_dir(root).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();

        let vendor = match tokio::fs::read_to_string(path.join("idVendor")).await {
            Ok(v) => v,
            Err(_) => continue, // interfaces and hubs without id files
        };
        if !vendor.trim().eq_ignore_ascii_case(vendor_id) {
            continue;
        }

        let product = match tokio::fs::read_to_string(path.join("idProduct")).await {
            Ok(p) => p,
            Err(_) => continue,
        };
        if product.trim().eq_ignore_ascii_case(product_id) {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Reset the USB device via the out-of-process `usbreset` utility
pub async fn reset_device(vendor_id: &str, product_id: &str) -> Result<()> {
    reset_device_with(USBRESET_BINARY, vendor_id, product_id).await
}

pub(crate) async fn reset_device_with(
    binary: &str,
    vendor_id: &str,
    product_id: &str,
) -> Result<()> {
    let target = format!("{}:{}", vendor_id, product_id);
    tracing::info!(device = %target, "resetting usb interface");

    let status = tokio::process::Command::new(binary)
        .arg(&target)
        .status()
        .await
        .map_err(|e| Error::Supervisor(format!("usbreset spawn failed: {}", e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::Supervisor(format!(
            "usbreset {} exited with {}",
            target, status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_sysfs(devices: &[(&str, &str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, vendor, product) in devices {
            let device = dir.path().join(name);
            tokio::fs::create_dir(&device).await.unwrap();
            tokio::fs::write(device.join("idVendor"), format!("{}\n", vendor))
                .await
                .unwrap();
            tokio::fs::write(device.join("idProduct"), format!("{}\n", product))
                .await
                .unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_device_present() {
        let sysfs = fake_sysfs(&[("1-1", "0e77", "0104"), ("1-2", "1d6b", "0002")]).await;

        assert!(device_present_in(sysfs.path(), "0e77", "0104")
            .await
            .unwrap());
        // Case-insensitive id match
        assert!(device_present_in(sysfs.path(), "0E77", "0104")
            .await
            .unwrap());
        assert!(!device_present_in(sysfs.path(), "0e77", "ffff")
            .await
            .unwrap());
        assert!(!device_present_in(sysfs.path(), "dead", "beef")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_device_present_skips_entries_without_ids() {
        let sysfs = fake_sysfs(&[]).await;
        tokio::fs::create_dir(sysfs.path().join("usb1")).await.unwrap();

        assert!(!device_present_in(sysfs.path(), "0e77", "0104")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reset_reports_exit_status() {
        assert!(reset_device_with("/bin/true", "0e77", "0104").await.is_ok());
        assert!(reset_device_with("/bin/false", "0e77", "0104")
            .await
            .is_err());
        assert!(reset_device_with("/nonexistent/usbreset", "0e77", "0104")
            .await
            .is_err());
    }
}
