//! # opendlp-monitors
//!
//! Detection and enforcement loops for OpenDLP: the filesystem monitor,
//! clipboard monitor, USB device monitor, USB file-transfer monitor, and
//! the quarantine restore scheduler. Every monitor is a worker loop with a
//! bounded sleep that re-reads the active policy snapshot each iteration
//! and checks the shared running flag.

pub mod clipboard;
pub mod dedup;
pub mod fs;
pub mod fsutil;
pub mod markers;
pub mod quarantine;
pub mod usb;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared shutdown flag. Workers exit at their next sleep boundary after
/// it clears.
#[derive(Clone, Default)]
pub struct Running(Arc<AtomicBool>);

impl Running {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Identity stamped onto every envelope a monitor emits.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: String,
    /// `user@hostname`.
    pub user_identity: String,
}

impl AgentIdentity {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            user_identity: format!(
                "{}@{}",
                opendlp_core::config::username(),
                opendlp_core::config::hostname()
            ),
        }
    }
}
