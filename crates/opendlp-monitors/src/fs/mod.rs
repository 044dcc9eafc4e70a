//! Filesystem monitor.
//!
//! A supervisor loop keeps one recursive `notify` watcher per monitored
//! directory from the active policy set. Change events are normalized to
//! `file_created` / `file_modified` / `file_deleted` / `file_renamed`,
//! deduplicated per (path, subtype) inside a short window, classified, and
//! enforced. Baselines are captured at first observation so quarantine and
//! delete enforcement stay recoverable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use opendlp_core::baseline::{BaselineStore, BASELINE_MAX_BYTES};
use opendlp_core::classify::{classify, Classification};
use opendlp_core::config::Timings;
use opendlp_core::event::{EventEnvelope, EventType};
use opendlp_core::policy::{ActivePolicySet, PolicyAction, PolicyRule, PolicyStore, Severity};

use crate::dedup::RecentEvents;
use crate::fsutil::{content_hash, read_capped, walk_files};
use crate::markers::EnforcementMarkers;
use crate::quarantine::{
    move_to_vault, write_baseline_to_vault, QuarantineRecord, RestoreKind, RestoreScheduler,
};
use crate::{AgentIdentity, Running};

/// A raw change notification from a directory watcher.
#[derive(Debug, Clone)]
struct RawFsEvent {
    path: PathBuf,
    subtype: &'static str,
}

fn convert_event_kind(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Create(_) => Some("file_created"),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => Some("file_renamed"),
        EventKind::Modify(_) => Some("file_modified"),
        EventKind::Remove(_) => Some("file_deleted"),
        _ => None,
    }
}

/// Filesystem monitor worker.
pub struct FsMonitor {
    policies: Arc<PolicyStore>,
    baselines: Arc<Mutex<BaselineStore>>,
    markers: Arc<EnforcementMarkers>,
    scheduler: RestoreScheduler,
    events: mpsc::Sender<EventEnvelope>,
    identity: AgentIdentity,
    timings: Timings,
    running: Running,
    /// Vault used when no matched rule overrides it.
    default_vault: PathBuf,
    max_classifiable_bytes: u64,
}

impl FsMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policies: Arc<PolicyStore>,
        baselines: Arc<Mutex<BaselineStore>>,
        markers: Arc<EnforcementMarkers>,
        scheduler: RestoreScheduler,
        events: mpsc::Sender<EventEnvelope>,
        identity: AgentIdentity,
        timings: Timings,
        running: Running,
        default_vault: PathBuf,
        max_classifiable_bytes: u64,
    ) -> Self {
        Self {
            policies,
            baselines,
            markers,
            scheduler,
            events,
            identity,
            timings,
            running,
            default_vault,
            max_classifiable_bytes,
        }
    }

    /// One-shot recursive walk seeding baselines for files that already
    /// exist under the monitored directories.
    pub fn seed_baselines(&self) {
        seed_baselines(&self.policies, &self.baselines, self.max_classifiable_bytes);
    }

    /// Run the supervisor + event-processing loop until shutdown.
    pub async fn run(self) {
        let (tx, mut rx) = mpsc::channel::<RawFsEvent>(256);
        let mut watchers: HashMap<PathBuf, RecommendedWatcher> = HashMap::new();
        let mut dedup = RecentEvents::new(self.timings.dedup_window);
        let mut last_refresh: Option<Instant> = None;

        info!("filesystem monitor started");

        while self.running.is_set() {
            let due = last_refresh
                .map(|t| t.elapsed() >= self.timings.supervisor_poll)
                .unwrap_or(true);
            if due {
                self.refresh_watchers(&mut watchers, &tx);
                last_refresh = Some(Instant::now());
            }

            tokio::select! {
                received = rx.recv() => {
                    if let Some(event) = received {
                        self.handle_event(&event.path, event.subtype, &mut dedup).await;
                    }
                }
                _ = tokio::time::sleep(self.timings.supervisor_poll) => {}
            }
        }

        info!("filesystem monitor stopped");
    }

    /// Start watchers for newly monitored directories and drop watchers
    /// whose directory left the active set.
    fn refresh_watchers(
        &self,
        watchers: &mut HashMap<PathBuf, RecommendedWatcher>,
        tx: &mpsc::Sender<RawFsEvent>,
    ) {
        let snapshot = self.policies.snapshot();
        let wanted = &snapshot.monitored_directories;

        watchers.retain(|dir, _| {
            let keep = wanted.contains(dir);
            if !keep {
                info!(dir = %dir.display(), "stopped watching directory");
            }
            keep
        });

        for dir in wanted {
            if watchers.contains_key(dir) {
                continue;
            }
            let tx = tx.clone();
            let watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
                match res {
                    Ok(event) => {
                        if let Some(subtype) = convert_event_kind(&event.kind) {
                            for path in &event.paths {
                                let _ = tx.try_send(RawFsEvent {
                                    path: path.clone(),
                                    subtype,
                                });
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "filesystem watcher error"),
                }
            });

            match watcher {
                Ok(mut w) => match w.watch(dir, RecursiveMode::Recursive) {
                    Ok(()) => {
                        info!(dir = %dir.display(), "watching directory");
                        watchers.insert(dir.clone(), w);
                    }
                    Err(e) => warn!(dir = %dir.display(), error = %e, "failed to watch directory"),
                },
                Err(e) => warn!(error = %e, "failed to create watcher"),
            }
        }
    }

    async fn handle_event(&self, path: &Path, subtype: &'static str, dedup: &mut RecentEvents) {
        // Our own vault moves and restores must not cascade.
        if self.markers.is_quarantining(path) {
            debug!(path = %path.display(), "ignoring event for file under quarantine movement");
            return;
        }

        let is_delete = subtype == "file_deleted";
        if !is_delete && !path.is_file() {
            return;
        }
        if !dedup.should_process(path, subtype) {
            return;
        }

        let snapshot = self.policies.snapshot();
        // Coverage (path prefix + extension filter) decides whether the
        // event is interesting at all; the event-kind filter only gates
        // classification and enforcement. Baselines are captured for every
        // covered creation so later delete rules stay recoverable.
        let covering: Vec<&PolicyRule> = snapshot
            .file_rules
            .iter()
            .filter(|r| r.covers_path(path) && r.admits_extension(path))
            .collect();
        if covering.is_empty() {
            return;
        }
        let relevant_owned: Vec<PolicyRule> = covering
            .iter()
            .filter(|r| r.monitors_event(subtype))
            .map(|r| (*r).clone())
            .collect();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (classification, file_size, file_hash) = if is_delete {
            if relevant_owned.is_empty() {
                return;
            }
            let baseline = {
                let guard = self.baselines.lock().expect("baseline lock poisoned");
                guard.get(path).cloned()
            };
            match baseline {
                Some(b) => {
                    let text = String::from_utf8_lossy(&b.content).into_owned();
                    (
                        classify(&text, &relevant_owned, subtype),
                        b.size,
                        Some(b.short_hash.clone()),
                    )
                }
                None => (Classification::default(), 0, None),
            }
        } else {
            // Give the writer a moment to finish before reading.
            tokio::time::sleep(self.timings.write_settle).await;
            let Ok(meta) = std::fs::metadata(path) else {
                return;
            };
            if meta.len() > self.max_classifiable_bytes {
                if relevant_owned.is_empty() {
                    return;
                }
                (Classification::too_large(), meta.len(), None)
            } else {
                let content = match read_capped(path, BASELINE_MAX_BYTES) {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "failed to read file");
                        return;
                    }
                };
                let hash = content_hash(&content);
                if subtype == "file_created" {
                    let mut guard = self.baselines.lock().expect("baseline lock poisoned");
                    if guard.capture_if_absent(path, content.clone()) {
                        debug!(path = %path.display(), "baseline captured");
                    }
                }
                if relevant_owned.is_empty() {
                    return;
                }
                let text = String::from_utf8_lossy(&content).into_owned();
                (
                    classify(&text, &relevant_owned, subtype),
                    meta.len(),
                    Some(hash),
                )
            }
        };

        let mut classification = classification;

        // A monitored deletion is enforceable even when the baseline holds
        // no detectable content: the rules asked to see deletions.
        if is_delete && !classification.matched() {
            let strongest = relevant_owned
                .iter()
                .map(|r| r.action)
                .max()
                .unwrap_or(PolicyAction::Log);
            classification.labels.push("MONITORED_DELETION".to_string());
            classification.matched_policies =
                relevant_owned.iter().map(|r| r.policy_id.clone()).collect();
            classification.suggested_action = strongest;
            classification.severity = match strongest {
                PolicyAction::Quarantine | PolicyAction::Block => Severity::Critical,
                _ => Severity::High,
            };
        }

        // No detections, no matched rules: nothing to report.
        if !is_delete && classification.detected.is_empty() {
            return;
        }

        let enforce = classification.matched();
        let verb = match (classification.suggested_action, enforce) {
            (PolicyAction::Quarantine, true) => {
                if is_delete {
                    self.quarantine_on_delete(path, &classification).await
                } else {
                    self.quarantine_live(path, &classification).await
                }
            }
            (PolicyAction::Block, true) => self.block(path),
            (PolicyAction::Alert, true) => "alerted",
            _ => {
                if !enforce && !classification.labels.is_empty() {
                    debug!(path = %path.display(), "sensitive content without matching rule, logging only");
                }
                "logged"
            }
        };

        let description = format!(
            "File {}: {}{}",
            subtype.trim_start_matches("file_"),
            file_name,
            classification.detected_summary()
        );

        let mut envelope = EventEnvelope::new(
            EventType::File,
            subtype,
            &self.identity.agent_id,
            &self.identity.user_identity,
            description,
            classification.severity,
            verb,
        )
        .with("file_path", path.display().to_string())
        .with("file_name", file_name)
        .with("file_size", file_size)
        .with_classification(&classification);
        if let Some(hash) = file_hash {
            envelope = envelope.with("file_hash", hash);
        }

        if self.events.send(envelope).await.is_err() {
            warn!("event channel closed, dropping file event");
        }
    }

    /// Quarantine a live file (create/modify): atomic rename into the
    /// vault plus a scheduled restore.
    async fn quarantine_live(&self, path: &Path, classification: &Classification) -> &'static str {
        if self.markers.in_grace(path) {
            info!(path = %path.display(), "inside grace window, skipping re-quarantine");
            return "logged";
        }
        if !self.markers.begin_quarantine(path) {
            return "logged";
        }

        let vault_dir = self.vault_for(classification);
        match move_to_vault(path, &vault_dir) {
            Ok(vault_path) => {
                self.scheduler.schedule(QuarantineRecord {
                    vault_path,
                    original_path: path.to_path_buf(),
                    restore_delay: self.timings.restore_delay,
                    matched_policies: classification.matched_policies.clone(),
                    kind: RestoreKind::OnModify,
                });
                "quarantined"
            }
            Err(e) => {
                // Release the marker so the path stays observable.
                warn!(path = %path.display(), error = %e, "quarantine move failed");
                self.markers.end_quarantine(path);
                "logged"
            }
        }
    }

    /// Quarantine a deleted file: the baseline is the only copy left, so
    /// it is written into the vault and restored from there.
    async fn quarantine_on_delete(
        &self,
        path: &Path,
        classification: &Classification,
    ) -> &'static str {
        if self.markers.in_grace(path) {
            info!(path = %path.display(), "inside grace window, skipping re-quarantine");
            return "logged";
        }

        let baseline = {
            let guard = self.baselines.lock().expect("baseline lock poisoned");
            guard.get(path).cloned()
        };
        let Some(baseline) = baseline else {
            warn!(
                path = %path.display(),
                "deletion is unrecoverable: no baseline stored for this path"
            );
            return "logged";
        };

        if !self.markers.begin_quarantine(path) {
            return "logged";
        }
        let vault_dir = self.vault_for(classification);
        match write_baseline_to_vault(path, &vault_dir, &baseline.content) {
            Ok(vault_path) => {
                self.scheduler.schedule(QuarantineRecord {
                    vault_path,
                    original_path: path.to_path_buf(),
                    restore_delay: self.timings.restore_delay,
                    matched_policies: classification.matched_policies.clone(),
                    kind: RestoreKind::OnDelete,
                });
                "quarantined_on_delete"
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "delete-quarantine failed");
                self.markers.end_quarantine(path);
                "logged"
            }
        }
    }

    fn block(&self, path: &Path) -> &'static str {
        match std::fs::remove_file(path) {
            Ok(()) => {
                warn!(path = %path.display(), "file deleted by block policy");
                "deleted"
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "block enforcement failed");
                "logged"
            }
        }
    }

    /// Vault directory for this enforcement: the first matched quarantine
    /// rule's override, else the configured default.
    fn vault_for(&self, classification: &Classification) -> PathBuf {
        let snapshot = self.policies.snapshot();
        for rule in &snapshot.file_rules {
            if rule.action == PolicyAction::Quarantine
                && classification.matched_policies.contains(&rule.policy_id)
            {
                if let Some(q) = &rule.quarantine_path {
                    return q.clone();
                }
            }
        }
        self.default_vault.clone()
    }
}

/// Seed baselines for files that already exist under the monitored
/// directories. Runs at startup and again when file rules first activate.
pub fn seed_baselines(
    policies: &Arc<PolicyStore>,
    baselines: &Arc<Mutex<BaselineStore>>,
    max_classifiable_bytes: u64,
) {
    let snapshot = policies.snapshot();
    let mut scanned = 0usize;
    let mut stored = 0usize;

    for dir in &snapshot.monitored_directories {
        for path in walk_files(dir) {
            scanned += 1;
            if !is_interesting(&snapshot, &path) {
                continue;
            }
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            if meta.len() > max_classifiable_bytes {
                continue;
            }
            let Ok(content) = read_capped(&path, BASELINE_MAX_BYTES) else {
                continue;
            };
            let mut guard = baselines.lock().expect("baseline lock poisoned");
            if guard.capture_if_absent(&path, content) {
                stored += 1;
            }
        }
    }
    info!(scanned, stored, "baseline seeding walk complete");
}

fn is_interesting(snapshot: &ActivePolicySet, path: &Path) -> bool {
    snapshot
        .file_rules
        .iter()
        .any(|r| r.covers_path(path) && r.admits_extension(path))
}
