//! Policy bundle wire format and parsing.
//!
//! The server delivers a versioned JSON bundle grouping policies by class.
//! Parsing is all-or-nothing: any malformed policy (unknown action or
//! severity, bad structure) rejects the whole bundle so the previous
//! active set stays in force.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::{PolicyAction, PolicyClass, PolicyRule, Severity};
use crate::pathutil::expand_path_template;

/// Fixed alias table normalizing server pattern names to detector ids.
const DATA_TYPE_ALIASES: &[(&str, &str)] = &[
    ("aadhaar_number", "aadhaar"),
    ("pan_card", "pan"),
    ("ifsc_code", "ifsc"),
    ("email_address", "email"),
    ("indian_phone", "phone"),
    ("phone_number", "phone"),
    ("card_number", "credit_card"),
    ("social_security", "ssn"),
    ("secret_key", "api_key"),
    ("access_token", "api_key"),
    ("api_key_in_code", "api_key"),
    ("upi_id", "upi"),
    ("source_code_content", "source_code"),
    ("code", "source_code"),
    ("database_connection_string", "database_connection"),
    ("connection_string", "database_connection"),
    ("bank_account", "indian_bank_account"),
    ("micr_code", "micr"),
    ("dob", "indian_dob"),
    ("date_of_birth", "indian_dob"),
];

/// Normalize a server pattern name to a detector id.
pub fn normalize_data_type(name: &str) -> String {
    let lower = name.to_lowercase();
    for (alias, canonical) in DATA_TYPE_ALIASES {
        if lower == *alias {
            return (*canonical).to_string();
        }
    }
    lower
}

/// A parsed, normalized policy bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyBundle {
    /// Opaque version string from the server (content hash).
    pub version: String,
    /// Rules grouped by class; disabled rules are already dropped.
    pub policies: BTreeMap<PolicyClass, Vec<PolicyRule>>,
}

impl PolicyBundle {
    /// An empty bundle, useful for tests and for the initial agent state.
    pub fn empty(version: &str) -> Self {
        Self {
            version: version.to_string(),
            policies: BTreeMap::new(),
        }
    }

    pub fn rules(&self, class: PolicyClass) -> &[PolicyRule] {
        self.policies.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rule_count(&self) -> usize {
        self.policies.values().map(Vec::len).sum()
    }
}

// --- wire structures ---

#[derive(Debug, Deserialize)]
struct RawBundle {
    version: String,
    #[serde(default)]
    policies: BTreeMap<String, Vec<RawPolicy>>,
}

#[derive(Debug, Deserialize)]
struct RawPolicy {
    #[serde(default, alias = "policy_id")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    config: RawConfig,
    /// Server-side action bundle; only `quarantine.path` matters here.
    #[serde(default)]
    actions: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    patterns: Option<RawPatterns>,
    /// Legacy flat pattern list, used when `patterns` is absent.
    #[serde(default, rename = "dataTypes")]
    data_types: Vec<String>,
    #[serde(default, rename = "monitoredPaths")]
    monitored_paths: Vec<String>,
    #[serde(default, rename = "fileExtensions")]
    file_extensions: Vec<String>,
    #[serde(default, rename = "monitoredEvents")]
    monitored_events: Vec<String>,
    #[serde(default, rename = "minMatchCount")]
    min_match_count: Option<usize>,
    #[serde(default, rename = "quarantinePath")]
    quarantine_path: Option<String>,
    #[serde(default)]
    events: Option<RawUsbEvents>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPatterns {
    #[serde(default)]
    predefined: Vec<String>,
    #[serde(default)]
    custom: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUsbEvents {
    #[serde(default)]
    connect: bool,
    #[serde(default)]
    disconnect: bool,
    #[serde(default, rename = "fileTransfer")]
    file_transfer: bool,
}

fn default_true() -> bool {
    true
}

/// Parse a server bundle. Returns an error (and parses nothing) when any
/// contained policy is malformed.
pub fn parse_bundle(json: &str) -> Result<PolicyBundle> {
    let raw: RawBundle = serde_json::from_str(json).context("malformed policy bundle JSON")?;

    let mut policies: BTreeMap<PolicyClass, Vec<PolicyRule>> = BTreeMap::new();

    for (class_name, entries) in raw.policies {
        let Some(class) = PolicyClass::from_wire(&class_name) else {
            debug!(class = %class_name, "skipping unknown policy class");
            continue;
        };

        for entry in entries {
            let rule = normalize_policy(class, entry)
                .with_context(|| format!("invalid policy in class '{class_name}'"))?;
            // Disabled rules are dropped at parse time.
            if let Some(rule) = rule {
                policies.entry(class).or_default().push(rule);
            }
        }
    }

    Ok(PolicyBundle {
        version: raw.version,
        policies,
    })
}

fn normalize_policy(class: PolicyClass, raw: RawPolicy) -> Result<Option<PolicyRule>> {
    if !raw.enabled {
        return Ok(None);
    }

    // Missing action defaults to alert; unknown strings are an error.
    let action = match raw.config.action.as_deref() {
        None | Some("") => PolicyAction::Alert,
        Some(s) => PolicyAction::parse(s)?,
    };

    let severity = match raw.severity.as_deref() {
        None | Some("") => Severity::Medium,
        Some(s) => Severity::parse(s)?,
    };

    let mut data_types: Vec<String> = Vec::new();
    if let Some(patterns) = &raw.config.patterns {
        for id in &patterns.predefined {
            data_types.push(normalize_data_type(id));
        }
        for custom in &patterns.custom {
            // Custom entries are objects carrying an id or name; plain
            // strings are accepted as well.
            let id = custom
                .get("id")
                .or_else(|| custom.get("name"))
                .and_then(|v| v.as_str())
                .or_else(|| custom.as_str());
            if let Some(id) = id {
                data_types.push(normalize_data_type(id));
            }
        }
    }
    if data_types.is_empty() {
        for id in &raw.config.data_types {
            data_types.push(normalize_data_type(id));
        }
    }
    data_types.dedup();

    let mut monitored_events = raw.config.monitored_events.clone();
    if class.is_usb() {
        if let Some(events) = &raw.config.events {
            if events.connect {
                monitored_events.push("usb_connect".to_string());
            }
            if events.disconnect {
                monitored_events.push("usb_disconnect".to_string());
            }
            if events.file_transfer {
                monitored_events.push("usb_file_transfer".to_string());
            }
        }
    }

    let monitored_paths: Vec<PathBuf> = raw
        .config
        .monitored_paths
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| expand_path_template(p))
        .collect();

    let file_extensions: Vec<String> = raw
        .config
        .file_extensions
        .iter()
        .map(|e| e.to_lowercase())
        .collect();

    // The quarantine directory can live in config or under the server-side
    // actions object.
    let quarantine_path = raw
        .config
        .quarantine_path
        .clone()
        .filter(|p| !p.is_empty())
        .or_else(|| {
            raw.actions
                .get("quarantine")
                .and_then(|q| q.get("path"))
                .and_then(|p| p.as_str())
                .map(str::to_string)
        })
        .map(|p| expand_path_template(&p));

    Ok(Some(PolicyRule {
        policy_id: raw.id,
        name: raw.name,
        class,
        enabled: true,
        action,
        severity,
        data_types,
        monitored_paths,
        file_extensions,
        monitored_events,
        min_match_count: raw.config.min_match_count.unwrap_or(1).max(1),
        quarantine_path,
    }))
}
