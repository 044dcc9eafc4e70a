//! Quarantine vault operations and the restore scheduler.
//!
//! Blocked content is never destroyed on the quarantine path: files move
//! into a vault directory under a timestamped name and come back after a
//! fixed interval. The scheduler owns every outstanding record so that
//! shutdown is deterministic -- there are no detached restore threads.

pub mod scheduler;

pub use scheduler::{QuarantineRecord, RestoreKind, RestoreScheduler};

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::fsutil::timestamp_nanos;

/// Vault filename for a filesystem quarantine: `{timestamp}_{filename}`.
pub fn fs_vault_path(vault_dir: &Path, original: &Path) -> PathBuf {
    let name = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    vault_dir.join(format!("{}_{}", timestamp_nanos(), name))
}

/// Vault filename for a USB-transfer quarantine: `{filename}_{timestamp}`.
pub fn usb_vault_path(vault_dir: &Path, file_name: &str) -> PathBuf {
    vault_dir.join(format!("{}_{}", file_name, timestamp_nanos()))
}

/// Move a live file into the vault by atomic rename.
pub fn move_to_vault(original: &Path, vault_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(vault_dir)
        .with_context(|| format!("creating vault dir {}", vault_dir.display()))?;
    let vault_path = fs_vault_path(vault_dir, original);
    std::fs::rename(original, &vault_path).with_context(|| {
        format!(
            "moving {} into vault {}",
            original.display(),
            vault_path.display()
        )
    })?;
    Ok(vault_path)
}

/// Write baseline bytes into the vault for a file whose original is
/// already gone (quarantine-on-delete).
pub fn write_baseline_to_vault(
    original: &Path,
    vault_dir: &Path,
    content: &[u8],
) -> Result<PathBuf> {
    std::fs::create_dir_all(vault_dir)
        .with_context(|| format!("creating vault dir {}", vault_dir.display()))?;
    let vault_path = fs_vault_path(vault_dir, original);
    std::fs::write(&vault_path, content)
        .with_context(|| format!("writing baseline to vault {}", vault_path.display()))?;
    Ok(vault_path)
}
