//! Enforcement markers shared between the filesystem monitor and the
//! restore scheduler.
//!
//! A path being moved into (or restored out of) the vault must not
//! generate cascaded enforcement events for itself, and a freshly
//! restored path stays exempt from re-quarantine for a grace window.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct EnforcementMarkers {
    grace_window: Duration,
    being_quarantined: Mutex<HashSet<PathBuf>>,
    recently_restored: Mutex<HashMap<PathBuf, Instant>>,
}

impl EnforcementMarkers {
    pub fn new(grace_window: Duration) -> Self {
        Self {
            grace_window,
            being_quarantined: Mutex::new(HashSet::new()),
            recently_restored: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a path as under quarantine movement. Returns false when the
    /// path is already marked.
    pub fn begin_quarantine(&self, path: &Path) -> bool {
        self.being_quarantined
            .lock()
            .expect("marker lock poisoned")
            .insert(path.to_path_buf())
    }

    pub fn end_quarantine(&self, path: &Path) {
        self.being_quarantined
            .lock()
            .expect("marker lock poisoned")
            .remove(path);
    }

    pub fn is_quarantining(&self, path: &Path) -> bool {
        self.being_quarantined
            .lock()
            .expect("marker lock poisoned")
            .contains(path)
    }

    /// Start the grace hold for a restored path.
    pub fn start_grace(&self, path: &Path) {
        self.recently_restored
            .lock()
            .expect("marker lock poisoned")
            .insert(path.to_path_buf(), Instant::now());
    }

    /// Whether the path is inside its grace window. Expired entries are
    /// pruned on the way.
    pub fn in_grace(&self, path: &Path) -> bool {
        let mut guard = self.recently_restored.lock().expect("marker lock poisoned");
        let now = Instant::now();
        let window = self.grace_window;
        guard.retain(|_, t| now.duration_since(*t) < window);
        guard.contains_key(path)
    }
}
