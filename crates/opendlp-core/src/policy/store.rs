//! Active policy set and atomic swap.
//!
//! Monitors never hold rules across iterations; they take an
//! `Arc<ActivePolicySet>` snapshot per evaluation. [`PolicyStore::apply`]
//! builds the derived state (merged file rules, monitored directories,
//! quarantine directories, the USB blocking flag) and swaps the whole set
//! in one step, so a half-applied bundle is never observable.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::info;

use super::{PolicyAction, PolicyBundle, PolicyClass, PolicyRule};

/// Immutable snapshot of the rules currently in force.
#[derive(Debug, Default)]
pub struct ActivePolicySet {
    pub version: String,
    /// file_system_monitoring plus file_transfer_monitoring rules.
    pub file_rules: Vec<PolicyRule>,
    pub clipboard_rules: Vec<PolicyRule>,
    pub usb_device_rules: Vec<PolicyRule>,
    pub usb_transfer_rules: Vec<PolicyRule>,
    /// De-duplicated monitored directories that exist on disk.
    pub monitored_directories: Vec<PathBuf>,
    /// Quarantine directories the agent must ensure exist.
    pub quarantine_directories: Vec<PathBuf>,
    /// True iff any enabled usb-device rule blocks on usb_connect.
    pub usb_blocking_active: bool,
}

impl ActivePolicySet {
    /// True when no rule of any class is active. The emitter drops all
    /// events in this state.
    pub fn is_empty(&self) -> bool {
        self.file_rules.is_empty()
            && self.clipboard_rules.is_empty()
            && self.usb_device_rules.is_empty()
            && self.usb_transfer_rules.is_empty()
    }

    pub fn has_file_rules(&self) -> bool {
        !self.file_rules.is_empty()
    }

    pub fn has_usb_transfer_rules(&self) -> bool {
        !self.usb_transfer_rules.is_empty()
    }

    fn from_bundle(bundle: &PolicyBundle) -> Self {
        let mut file_rules = bundle.rules(PolicyClass::FileSystemMonitoring).to_vec();
        // file_transfer_monitoring rules ride along with the filesystem set.
        file_rules.extend(bundle.rules(PolicyClass::FileTransferMonitoring).iter().cloned());

        let clipboard_rules = bundle.rules(PolicyClass::ClipboardMonitoring).to_vec();
        let usb_device_rules = bundle.rules(PolicyClass::UsbDeviceMonitoring).to_vec();
        let usb_transfer_rules = bundle.rules(PolicyClass::UsbFileTransferMonitoring).to_vec();

        let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
        for rule in &file_rules {
            for path in &rule.monitored_paths {
                if path.as_os_str().is_empty() || !path.exists() {
                    continue;
                }
                dirs.insert(path.clone());
            }
        }

        let mut vaults: BTreeSet<PathBuf> = BTreeSet::new();
        for rule in file_rules
            .iter()
            .chain(usb_transfer_rules.iter())
            .filter(|r| r.action == PolicyAction::Quarantine)
        {
            if let Some(q) = &rule.quarantine_path {
                vaults.insert(q.clone());
            }
        }

        let usb_blocking_active = usb_device_rules.iter().any(|r| {
            r.action == PolicyAction::Block && r.monitors_event("usb_connect")
        });

        Self {
            version: bundle.version.clone(),
            file_rules,
            clipboard_rules,
            usb_device_rules,
            usb_transfer_rules,
            monitored_directories: dirs.into_iter().collect(),
            quarantine_directories: vaults.into_iter().collect(),
            usb_blocking_active,
        }
    }
}

/// What changed across an apply, so the supervisor can react.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Blocking was off and is now on.
    pub blocking_activated: bool,
    /// Blocking was on and is now off; device access must be restored.
    pub blocking_deactivated: bool,
    /// File rules went from none to some; baseline seeding is due.
    pub file_rules_activated: bool,
    /// USB transfer rules went from none to some; tracking init is due.
    pub transfer_rules_activated: bool,
}

/// Holds the single active policy set behind a read-write lock.
pub struct PolicyStore {
    active: RwLock<Arc<ActivePolicySet>>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(ActivePolicySet::default())),
        }
    }

    /// Cheap consistent snapshot for one evaluation.
    pub fn snapshot(&self) -> Arc<ActivePolicySet> {
        self.active.read().expect("policy lock poisoned").clone()
    }

    /// Version of the active bundle, empty before the first apply.
    pub fn active_version(&self) -> String {
        self.snapshot().version.clone()
    }

    /// Replace the active set with one derived from `bundle`.
    ///
    /// The caller parses the bundle first; a parse failure means this is
    /// never reached and the previous set stays in force.
    pub fn apply(&self, bundle: &PolicyBundle) -> ApplyOutcome {
        let next = Arc::new(ActivePolicySet::from_bundle(bundle));

        let mut guard = self.active.write().expect("policy lock poisoned");
        let prev = guard.clone();
        let outcome = ApplyOutcome {
            blocking_activated: !prev.usb_blocking_active && next.usb_blocking_active,
            blocking_deactivated: prev.usb_blocking_active && !next.usb_blocking_active,
            file_rules_activated: !prev.has_file_rules() && next.has_file_rules(),
            transfer_rules_activated: !prev.has_usb_transfer_rules()
                && next.has_usb_transfer_rules(),
        };
        *guard = next.clone();
        drop(guard);

        info!(
            version = %next.version,
            file_rules = next.file_rules.len(),
            clipboard_rules = next.clipboard_rules.len(),
            usb_device_rules = next.usb_device_rules.len(),
            usb_transfer_rules = next.usb_transfer_rules.len(),
            monitored_dirs = next.monitored_directories.len(),
            usb_blocking = next.usb_blocking_active,
            "policy bundle applied"
        );

        outcome
    }
}
