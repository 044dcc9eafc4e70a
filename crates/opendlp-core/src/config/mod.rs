//! Agent configuration.
//!
//! A small JSON file identifies the agent and its server. Missing fields
//! default from the environment (`AGENT_SERVER_URL`) or from host-derived
//! values (hostname, a freshly generated UUID); when any default was
//! applied the file is rewritten so the identity is stable across runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Environment variable naming the server base URL.
pub const ENV_SERVER_URL: &str = "AGENT_SERVER_URL";
/// Environment variable naming the log/journal directory.
pub const ENV_LOG_DIR: &str = "AGENT_LOG_DIR";

fn default_server_url() -> String {
    std::env::var(ENV_SERVER_URL).unwrap_or_else(|_| "http://localhost:55000/api/v1".to_string())
}

fn default_agent_name() -> String {
    hostname()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_policy_sync_interval() -> u64 {
    60
}

fn default_quarantine() -> QuarantineConfig {
    QuarantineConfig::default()
}

fn default_classification() -> ClassificationConfig {
    ClassificationConfig::default()
}

/// Best-effort hostname: environment first, then the kernel file on Linux.
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    "unknown".to_string()
}

/// Current interactive user, best effort.
pub fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Quarantine vault settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantineConfig {
    #[serde(default = "QuarantineConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "QuarantineConfig::default_folder")]
    pub folder: PathBuf,
}

impl QuarantineConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_folder() -> PathBuf {
        PathBuf::from("/var/lib/opendlp/quarantine")
    }
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            folder: Self::default_folder(),
        }
    }
}

/// Content classification bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationConfig {
    #[serde(default = "ClassificationConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "ClassificationConfig::default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

impl ClassificationConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_max_file_size_mb() -> u64 {
        10
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            max_file_size_mb: Self::default_max_file_size_mb(),
        }
    }
}

/// Top-level agent configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Stable agent identity; generated on first run.
    #[serde(default)]
    pub agent_id: String,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    /// Seconds between heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Seconds between policy sync attempts.
    #[serde(default = "default_policy_sync_interval")]
    pub policy_sync_interval: u64,
    #[serde(default = "default_quarantine")]
    pub quarantine: QuarantineConfig,
    #[serde(default = "default_classification")]
    pub classification: ClassificationConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            agent_id: Uuid::new_v4().to_string(),
            agent_name: default_agent_name(),
            heartbeat_interval: default_heartbeat_interval(),
            policy_sync_interval: default_policy_sync_interval(),
            quarantine: QuarantineConfig::default(),
            classification: ClassificationConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from `path`, creating the file with defaults when missing.
    /// Partially specified files keep their values; defaulted fields are
    /// written back so the agent id survives restarts.
    pub fn load(path: &Path) -> Result<Self> {
        let (mut config, needs_rewrite) = match std::fs::read_to_string(path) {
            Ok(content) if !content.trim().is_empty() => {
                let parsed: AgentConfig = serde_json::from_str(&content)
                    .with_context(|| format!("malformed config file {}", path.display()))?;
                // Detect whether serialization differs from the input,
                // i.e. whether defaults were applied.
                let roundtrip = serde_json::to_value(&parsed)?;
                let original: serde_json::Value = serde_json::from_str(&content)?;
                (parsed, roundtrip != original)
            }
            _ => (AgentConfig::default(), true),
        };

        if config.agent_id.is_empty() {
            config.agent_id = Uuid::new_v4().to_string();
        }

        if needs_rewrite {
            config.save(path)?;
            info!(path = %path.display(), "configuration written with defaults");
        }

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating config dir {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing config file {}", path.display()))?;
        Ok(())
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    pub fn policy_sync_period(&self) -> Duration {
        Duration::from_secs(self.policy_sync_interval.max(1))
    }

    /// Directory for the agent's log and event journal.
    pub fn log_dir(&self) -> PathBuf {
        std::env::var(ENV_LOG_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
    }
}

/// Worker cadence and enforcement windows. Defaults follow the product
/// behavior; tests shorten them.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Identical (path, subtype) events inside this window collapse.
    pub dedup_window: Duration,
    /// Delay before a quarantined file is restored.
    pub restore_delay: Duration,
    /// Delay before a USB-quarantined file is restored.
    pub usb_restore_delay: Duration,
    /// Re-quarantine suppression after a restore.
    pub grace_window: Duration,
    /// Pause before reading a freshly created or modified file, so the
    /// writer can finish.
    pub write_settle: Duration,
    pub clipboard_poll: Duration,
    pub transfer_poll: Duration,
    pub supervisor_poll: Duration,
    pub refresher_poll: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(2),
            restore_delay: Duration::from_secs(600),
            usb_restore_delay: Duration::from_secs(120),
            grace_window: Duration::from_secs(30),
            write_settle: Duration::from_millis(500),
            clipboard_poll: Duration::from_secs(2),
            transfer_poll: Duration::from_secs(1),
            supervisor_poll: Duration::from_secs(5),
            refresher_poll: Duration::from_secs(2),
        }
    }
}

impl Timings {
    /// Aggressively shortened timings for integration tests.
    pub fn fast() -> Self {
        Self {
            dedup_window: Duration::from_millis(200),
            restore_delay: Duration::from_millis(400),
            usb_restore_delay: Duration::from_millis(400),
            grace_window: Duration::from_millis(600),
            write_settle: Duration::from_millis(20),
            clipboard_poll: Duration::from_millis(50),
            transfer_poll: Duration::from_millis(50),
            supervisor_poll: Duration::from_millis(100),
            refresher_poll: Duration::from_millis(100),
        }
    }
}
