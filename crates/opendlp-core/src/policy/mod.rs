//! Policy types and the active-set store.
//!
//! Policies arrive from the server as a versioned bundle grouped by policy
//! class. The bundle parser normalizes each entry into a [`PolicyRule`];
//! the [`store::PolicyStore`] swaps the active rule sets atomically so
//! monitors always evaluate against a consistent snapshot.

pub mod bundle;
pub mod store;

pub use bundle::{parse_bundle, PolicyBundle};
pub use store::{ActivePolicySet, ApplyOutcome, PolicyStore};

use std::path::PathBuf;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Policy class names as they appear in the server bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyClass {
    FileSystemMonitoring,
    ClipboardMonitoring,
    UsbDeviceMonitoring,
    UsbFileTransferMonitoring,
    FileTransferMonitoring,
}

impl PolicyClass {
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "file_system_monitoring" => Some(Self::FileSystemMonitoring),
            "clipboard_monitoring" => Some(Self::ClipboardMonitoring),
            "usb_device_monitoring" => Some(Self::UsbDeviceMonitoring),
            "usb_file_transfer_monitoring" => Some(Self::UsbFileTransferMonitoring),
            "file_transfer_monitoring" => Some(Self::FileTransferMonitoring),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::FileSystemMonitoring => "file_system_monitoring",
            Self::ClipboardMonitoring => "clipboard_monitoring",
            Self::UsbDeviceMonitoring => "usb_device_monitoring",
            Self::UsbFileTransferMonitoring => "usb_file_transfer_monitoring",
            Self::FileTransferMonitoring => "file_transfer_monitoring",
        }
    }

    /// USB classes expand boolean event flags instead of carrying an
    /// explicit monitored-events array.
    pub fn is_usb(&self) -> bool {
        matches!(
            self,
            Self::UsbDeviceMonitoring | Self::UsbFileTransferMonitoring
        )
    }
}

/// Action a rule dictates when it matches. Ordered by strength so the
/// classifier can pick the strongest action across matched rules.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    #[default]
    Log,
    Alert,
    Quarantine,
    Block,
}

impl PolicyAction {
    /// Parse a wire action string. Unknown values are an error; the caller
    /// rejects the whole bundle rather than defaulting silently.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "log" => Ok(Self::Log),
            "alert" => Ok(Self::Alert),
            "quarantine" => Ok(Self::Quarantine),
            "block" => Ok(Self::Block),
            other => bail!("unknown policy action '{other}', expected log/alert/quarantine/block"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Alert => "alert",
            Self::Quarantine => "quarantine",
            Self::Block => "block",
        }
    }
}

/// Severity attached to rules and emitted events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => bail!("unknown severity '{other}', expected low/medium/high/critical"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// A single normalized policy rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Unique id within a bundle.
    pub policy_id: String,
    /// Human-readable name from the server.
    pub name: String,
    /// Which monitor consumes this rule.
    pub class: PolicyClass,
    pub enabled: bool,
    pub action: PolicyAction,
    pub severity: Severity,
    /// Normalized detector ids the classifier runs for this rule.
    pub data_types: Vec<String>,
    /// Environment-expanded directory roots this rule covers.
    pub monitored_paths: Vec<PathBuf>,
    /// Lowercased extensions (with dot); empty means all files.
    pub file_extensions: Vec<String>,
    /// Event-kind tokens; empty means "match all kinds" for rules that
    /// carry any other configuration.
    pub monitored_events: Vec<String>,
    /// Minimum number of matched data *types* for the rule to fire.
    pub min_match_count: usize,
    /// Per-rule quarantine directory override.
    pub quarantine_path: Option<PathBuf>,
}

impl PolicyRule {
    /// Whether this rule monitors the given event kind.
    ///
    /// An empty list matches every kind (legacy bundles), and the `all`,
    /// `*`, and `clipboard` wildcard tokens are honored for compatibility
    /// with older server releases.
    pub fn monitors_event(&self, event_kind: &str) -> bool {
        if self.monitored_events.is_empty() {
            return true;
        }
        self.monitored_events.iter().any(|e| {
            e == event_kind || e == "all" || e == "*" || (e == "clipboard" && event_kind == "clipboard")
        })
    }

    /// Whether some monitored path of this rule is a prefix of `path`.
    pub fn covers_path(&self, path: &std::path::Path) -> bool {
        self.monitored_paths
            .iter()
            .any(|root| crate::pathutil::is_path_prefix(root, path))
    }

    /// Whether the rule's extension filter admits `path`. An empty filter
    /// admits everything.
    pub fn admits_extension(&self, path: &std::path::Path) -> bool {
        if self.file_extensions.is_empty() {
            return true;
        }
        match crate::pathutil::lowercase_extension(path) {
            Some(ext) => self.file_extensions.iter().any(|e| *e == ext),
            None => false,
        }
    }
}
