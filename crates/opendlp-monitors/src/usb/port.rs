//! Platform port for USB device control.
//!
//! The core stays platform-agnostic: arrival notifications, storage
//! disable/enable, and volume ejection go through [`UsbControlPort`], and
//! removable-drive enumeration through [`RemovableDriveProvider`]. The
//! production build wires OS-specific implementations; tests use the
//! mocks, and platforms without a blocker get [`NullUsbPort`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;

/// Device arrival/removal notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Arrived { device_id: String },
    Removed { device_id: String },
}

/// Control surface over the platform's USB storage stack. Every call is
/// best-effort; `Ok(false)` means "nothing to do", `Err` means the
/// operation was attempted and failed (typically missing privileges).
pub trait UsbControlPort: Send + Sync {
    /// Set the mass-storage service start-type to disabled and stop it.
    fn disable_storage_service(&self) -> Result<bool>;
    /// Restore the mass-storage service start-type.
    fn restore_storage_service(&self) -> Result<bool>;
    /// Disable every USB-storage device node.
    fn disable_storage_devices(&self) -> Result<bool>;
    /// Re-enable previously disabled USB-storage device nodes.
    fn enable_storage_devices(&self) -> Result<bool>;
    /// Issue an eject to each removable volume; returns the count ejected.
    fn eject_removable_drives(&self) -> Result<usize>;
    /// Friendly device name from the OS device database.
    fn friendly_name(&self, device_id: &str) -> Option<String>;
}

/// Enumeration of mounted removable drives.
pub trait RemovableDriveProvider: Send + Sync {
    fn mounted_drives(&self) -> Vec<PathBuf>;
    /// False for drives caught mid-eject; such drives are skipped.
    fn is_readable(&self, drive: &Path) -> bool;
}

/// No-op port for platforms without a storage blocker. Block stages all
/// report "nothing done".
#[derive(Default)]
pub struct NullUsbPort;

impl UsbControlPort for NullUsbPort {
    fn disable_storage_service(&self) -> Result<bool> {
        Ok(false)
    }
    fn restore_storage_service(&self) -> Result<bool> {
        Ok(false)
    }
    fn disable_storage_devices(&self) -> Result<bool> {
        Ok(false)
    }
    fn enable_storage_devices(&self) -> Result<bool> {
        Ok(false)
    }
    fn eject_removable_drives(&self) -> Result<usize> {
        Ok(0)
    }
    fn friendly_name(&self, _device_id: &str) -> Option<String> {
        None
    }
}

/// Drive provider for platforms without removable-media enumeration.
#[derive(Default)]
pub struct NullDriveProvider;

impl RemovableDriveProvider for NullDriveProvider {
    fn mounted_drives(&self) -> Vec<PathBuf> {
        Vec::new()
    }
    fn is_readable(&self, _drive: &Path) -> bool {
        false
    }
}

/// Recording mock port for tests.
#[derive(Default)]
pub struct MockUsbPort {
    pub service_disabled: AtomicBool,
    pub devices_disabled: AtomicBool,
    pub eject_count: AtomicUsize,
    pub restore_calls: AtomicUsize,
    /// When set, every control call fails as if unprivileged.
    pub deny_all: AtomicBool,
    names: Mutex<Vec<(String, String)>>,
}

impl MockUsbPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(self, device_id: &str, name: &str) -> Self {
        self.names
            .lock()
            .unwrap()
            .push((device_id.to_string(), name.to_string()));
        self
    }

    pub fn blocked(&self) -> bool {
        self.service_disabled.load(Ordering::SeqCst) || self.devices_disabled.load(Ordering::SeqCst)
    }
}

impl UsbControlPort for MockUsbPort {
    fn disable_storage_service(&self) -> Result<bool> {
        if self.deny_all.load(Ordering::SeqCst) {
            anyhow::bail!("access denied");
        }
        self.service_disabled.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn restore_storage_service(&self) -> Result<bool> {
        self.service_disabled.store(false, Ordering::SeqCst);
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn disable_storage_devices(&self) -> Result<bool> {
        if self.deny_all.load(Ordering::SeqCst) {
            anyhow::bail!("access denied");
        }
        self.devices_disabled.store(true, Ordering::SeqCst);
        Ok(true)
    }

    fn enable_storage_devices(&self) -> Result<bool> {
        self.devices_disabled.store(false, Ordering::SeqCst);
        Ok(true)
    }

    fn eject_removable_drives(&self) -> Result<usize> {
        if self.deny_all.load(Ordering::SeqCst) {
            anyhow::bail!("access denied");
        }
        self.eject_count.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    fn friendly_name(&self, device_id: &str) -> Option<String> {
        self.names
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == device_id)
            .map(|(_, name)| name.clone())
    }
}

/// Mock drive provider backed by plain directories (tempdirs in tests).
#[derive(Default)]
pub struct MockDriveProvider {
    drives: Mutex<Vec<PathBuf>>,
    unreadable: Mutex<Vec<PathBuf>>,
}

impl MockDriveProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&self, drive: &Path) {
        self.drives.lock().unwrap().push(drive.to_path_buf());
    }

    pub fn unmount(&self, drive: &Path) {
        self.drives.lock().unwrap().retain(|d| d != drive);
        self.unreadable.lock().unwrap().retain(|d| d != drive);
    }

    pub fn set_unreadable(&self, drive: &Path) {
        self.unreadable.lock().unwrap().push(drive.to_path_buf());
    }
}

impl RemovableDriveProvider for MockDriveProvider {
    fn mounted_drives(&self) -> Vec<PathBuf> {
        self.drives.lock().unwrap().clone()
    }

    fn is_readable(&self, drive: &Path) -> bool {
        !self.unreadable.lock().unwrap().iter().any(|d| d == drive)
    }
}

/// Extract `(vendor_id, product_id)` from a device-interface id such as
/// `USB\VID_0781&PID_5567\0401396DDD10F8F1`.
pub fn parse_vid_pid(device_id: &str) -> (String, String) {
    let upper = device_id.to_uppercase();
    let grab = |tag: &str| -> String {
        match upper.find(tag) {
            Some(pos) if upper.len() >= pos + tag.len() + 4 => {
                upper[pos + tag.len()..pos + tag.len() + 4].to_string()
            }
            _ => "unknown".to_string(),
        }
    };
    (grab("VID_"), grab("PID_"))
}

/// Fallback device name when the OS database has nothing.
pub fn fallback_device_name(vendor_id: &str, product_id: &str) -> String {
    format!("USB Device (VID:{vendor_id} PID:{product_id})")
}
