//! Bounded baseline store.
//!
//! The filesystem monitor captures a file's content at first observation
//! so quarantine and delete events remain recoverable. The store is an
//! insertion-ordered map with a hard capacity: when full, the oldest entry
//! is evicted. Lookups during restore must tolerate "absent" -- an evicted
//! or never-captured baseline degrades to the vault-rename fallback.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Default maximum number of baselines kept in memory.
pub const DEFAULT_BASELINE_CAPACITY: usize = 1000;

/// Bytes of content captured per file. Larger files are truncated at
/// capture time, matching the classifier's text-scan bound.
pub const BASELINE_MAX_BYTES: usize = 100_000;

/// Content captured at a path's first observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBaseline {
    pub content: Vec<u8>,
    pub size: u64,
    pub short_hash: String,
}

impl FileBaseline {
    fn new(content: Vec<u8>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&content);
        let digest = hasher.finalize();
        // First eight bytes of the digest are plenty for change detection.
        let short_hash = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        Self {
            size: content.len() as u64,
            content,
            short_hash,
        }
    }
}

/// Insertion-ordered, capacity-bounded path → baseline map.
pub struct BaselineStore {
    capacity: usize,
    entries: HashMap<PathBuf, FileBaseline>,
    order: VecDeque<PathBuf>,
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BASELINE_CAPACITY)
    }
}

impl BaselineStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Capture a baseline unless one already exists for this path.
    /// Returns true when a new baseline was stored. Subsequent writes for
    /// the same path never overwrite the original capture.
    pub fn capture_if_absent(&mut self, path: &Path, content: Vec<u8>) -> bool {
        if self.entries.contains_key(path) {
            return false;
        }
        while self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
        self.order.push_back(path.to_path_buf());
        self.entries.insert(path.to_path_buf(), FileBaseline::new(content));
        true
    }

    pub fn get(&self, path: &Path) -> Option<&FileBaseline> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Remove a consumed baseline (after a successful restore).
    pub fn remove(&mut self, path: &Path) -> Option<FileBaseline> {
        self.order.retain(|p| p != path);
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
