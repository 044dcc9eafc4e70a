//! Per-path event deduplication.
//!
//! Editors and copy tools fire bursts of identical change notifications;
//! identical (path, subtype) pairs inside the window collapse to one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Sliding-window table of recently seen (path, subtype) events.
pub struct RecentEvents {
    window: Duration,
    seen: HashMap<(PathBuf, String), Instant>,
}

impl RecentEvents {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Returns true when this event should be processed, recording it.
    /// A repeat inside the window returns false and does not refresh the
    /// window, so a steady stream still passes one event per window.
    pub fn should_process(&mut self, path: &std::path::Path, subtype: &str) -> bool {
        let now = Instant::now();
        self.prune(now);

        let key = (path.to_path_buf(), subtype.to_string());
        match self.seen.get(&key) {
            Some(first) if now.duration_since(*first) < self.window => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen.retain(|_, t| now.duration_since(*t) < window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn repeats_inside_window_collapse() {
        let mut table = RecentEvents::new(Duration::from_secs(2));
        let path = Path::new("/watched/a.txt");
        assert!(table.should_process(path, "file_modified"));
        assert!(!table.should_process(path, "file_modified"));
        assert!(!table.should_process(path, "file_modified"));
    }

    #[test]
    fn different_subtypes_are_independent() {
        let mut table = RecentEvents::new(Duration::from_secs(2));
        let path = Path::new("/watched/a.txt");
        assert!(table.should_process(path, "file_created"));
        assert!(table.should_process(path, "file_modified"));
    }

    #[test]
    fn different_paths_are_independent() {
        let mut table = RecentEvents::new(Duration::from_secs(2));
        assert!(table.should_process(Path::new("/a"), "file_created"));
        assert!(table.should_process(Path::new("/b"), "file_created"));
    }

    #[test]
    fn window_expiry_allows_reprocessing() {
        let mut table = RecentEvents::new(Duration::from_millis(30));
        let path = Path::new("/watched/a.txt");
        assert!(table.should_process(path, "file_modified"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(table.should_process(path, "file_modified"));
    }
}
