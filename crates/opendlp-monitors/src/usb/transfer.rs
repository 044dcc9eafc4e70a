//! USB file-transfer monitor.
//!
//! Tracks every file under the transfer rules' monitored source paths and
//! polls mounted removable drives for their appearance. A tracked
//! filename showing up on a drive (false→true transition) is a new
//! transfer: copy when the source still exists, move when it is gone. The
//! matching rule's action then runs exactly once per transition. Files
//! already on a drive when it mounts are swept into the "present" state
//! so they never retroactively trigger enforcement.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use opendlp_core::config::Timings;
use opendlp_core::event::{EventEnvelope, EventType};
use opendlp_core::policy::{ActivePolicySet, PolicyAction, PolicyRule, PolicyStore};

use super::port::RemovableDriveProvider;
use crate::fsutil::walk_files;
use crate::quarantine::{usb_vault_path, QuarantineRecord, RestoreKind, RestoreScheduler};
use crate::{AgentIdentity, Running};

/// Per-(drive, tracked filename) presence state, shared with the device
/// monitor so disconnects can purge a drive wholesale.
#[derive(Default)]
pub struct TransferState {
    on_usb: Mutex<HashMap<(PathBuf, String), bool>>,
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_present(&self, drive: &Path, name: &str) {
        self.on_usb
            .lock()
            .expect("transfer state lock poisoned")
            .insert((drive.to_path_buf(), name.to_string()), true);
    }

    pub fn mark_absent(&self, drive: &Path, name: &str) {
        self.on_usb
            .lock()
            .expect("transfer state lock poisoned")
            .insert((drive.to_path_buf(), name.to_string()), false);
    }

    pub fn was_present(&self, drive: &Path, name: &str) -> bool {
        self.on_usb
            .lock()
            .expect("transfer state lock poisoned")
            .get(&(drive.to_path_buf(), name.to_string()))
            .copied()
            .unwrap_or(false)
    }

    /// Forget everything about a drive (disconnect).
    pub fn purge_drive(&self, drive: &Path) {
        self.on_usb
            .lock()
            .expect("transfer state lock poisoned")
            .retain(|(d, _), _| d != drive);
    }
}

/// A file enumerated under a transfer rule's monitored source path.
#[derive(Debug, Clone)]
pub struct TrackedFile {
    pub name: String,
    pub relative_path: PathBuf,
    pub source_root: PathBuf,
    pub full_path: PathBuf,
    pub size: u64,
    pub present_in_source: bool,
}

/// USB file-transfer monitor worker.
pub struct UsbTransferMonitor {
    policies: Arc<PolicyStore>,
    drives: Arc<dyn RemovableDriveProvider>,
    scheduler: RestoreScheduler,
    events: mpsc::Sender<EventEnvelope>,
    identity: AgentIdentity,
    timings: Timings,
    running: Running,
    state: Arc<TransferState>,
    tracked: Arc<Mutex<HashMap<(PathBuf, PathBuf), TrackedFile>>>,
    /// Last-known-good content location per tracked file, kept when any
    /// rule blocks.
    shadows: Mutex<HashMap<(PathBuf, PathBuf), PathBuf>>,
    known_drives: Mutex<HashSet<PathBuf>>,
    /// Bundle version the tracked table was built from.
    tracked_version: Mutex<Option<String>>,
    default_vault: PathBuf,
}

impl UsbTransferMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policies: Arc<PolicyStore>,
        drives: Arc<dyn RemovableDriveProvider>,
        scheduler: RestoreScheduler,
        events: mpsc::Sender<EventEnvelope>,
        identity: AgentIdentity,
        timings: Timings,
        running: Running,
        state: Arc<TransferState>,
        default_vault: PathBuf,
    ) -> Self {
        Self {
            policies,
            drives,
            scheduler,
            events,
            identity,
            timings,
            running,
            state,
            tracked: Arc::new(Mutex::new(HashMap::new())),
            shadows: Mutex::new(HashMap::new()),
            known_drives: Mutex::new(HashSet::new()),
            tracked_version: Mutex::new(None),
            default_vault,
        }
    }

    pub async fn run(self) {
        info!("USB file-transfer monitor started");
        while self.running.is_set() {
            self.poll_once().await;
            tokio::time::sleep(self.timings.transfer_poll).await;
        }
        info!("USB file-transfer monitor stopped");
    }

    /// Keep tracked-file metadata current. Runs as its own worker.
    pub async fn run_refresher(
        tracked: Arc<Mutex<HashMap<(PathBuf, PathBuf), TrackedFile>>>,
        running: Running,
        period: std::time::Duration,
    ) {
        while running.is_set() {
            {
                let mut guard = tracked.lock().expect("tracked lock poisoned");
                for entry in guard.values_mut() {
                    match std::fs::metadata(&entry.full_path) {
                        Ok(meta) => {
                            entry.present_in_source = true;
                            entry.size = meta.len();
                        }
                        Err(_) => entry.present_in_source = false,
                    }
                }
            }
            tokio::time::sleep(period).await;
        }
    }

    pub fn tracked_handle(&self) -> Arc<Mutex<HashMap<(PathBuf, PathBuf), TrackedFile>>> {
        self.tracked.clone()
    }

    /// Build the tracked-file table from the active rules.
    fn init_tracking(&self, snapshot: &ActivePolicySet) {
        let mut tracked = self.tracked.lock().expect("tracked lock poisoned");
        let mut shadows = self.shadows.lock().expect("shadow lock poisoned");
        tracked.clear();
        shadows.clear();

        for rule in &snapshot.usb_transfer_rules {
            for root in &rule.monitored_paths {
                if !root.exists() {
                    warn!(path = %root.display(), "transfer-monitored path does not exist");
                    continue;
                }
                for full_path in walk_files(root) {
                    let Ok(relative) = full_path.strip_prefix(root) else {
                        continue;
                    };
                    let size = std::fs::metadata(&full_path).map(|m| m.len()).unwrap_or(0);
                    let entry = TrackedFile {
                        name: full_path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        relative_path: relative.to_path_buf(),
                        source_root: root.clone(),
                        full_path: full_path.clone(),
                        size,
                        present_in_source: true,
                    };
                    let key = (root.clone(), relative.to_path_buf());
                    if rule.action == PolicyAction::Block {
                        shadows.insert(key.clone(), full_path);
                    }
                    tracked.insert(key, entry);
                }
            }
        }
        info!(tracked = tracked.len(), "transfer tracking initialized");
    }

    fn maybe_reinit(&self, snapshot: &ActivePolicySet) {
        let mut version = self.tracked_version.lock().expect("version lock poisoned");
        if version.as_deref() != Some(snapshot.version.as_str()) {
            self.init_tracking(snapshot);
            *version = Some(snapshot.version.clone());
        }
    }

    /// One poll tick, exposed for tests.
    pub async fn poll_once(&self) {
        let snapshot = self.policies.snapshot();
        if snapshot.usb_transfer_rules.is_empty() {
            return;
        }
        self.maybe_reinit(&snapshot);

        let mounted: Vec<PathBuf> = self
            .drives
            .mounted_drives()
            .into_iter()
            .filter(|d| {
                // Post-eject races leave unreadable mounts behind.
                let readable = self.drives.is_readable(d);
                if !readable {
                    debug!(drive = %d.display(), "skipping unreadable drive");
                }
                readable
            })
            .collect();

        // Disconnected drives lose their transition state.
        {
            let mut known = self.known_drives.lock().expect("drive set lock poisoned");
            let gone: Vec<PathBuf> = known
                .iter()
                .filter(|d| !mounted.contains(d))
                .cloned()
                .collect();
            for drive in gone {
                self.state.purge_drive(&drive);
                known.remove(&drive);
            }
        }

        for drive in &mounted {
            let names = scan_drive(drive);

            let is_new = {
                let mut known = self.known_drives.lock().expect("drive set lock poisoned");
                known.insert(drive.clone())
            };
            if is_new {
                // Pre-existing sweep: files already on the drive must not
                // retroactively count as transfers.
                let tracked = self.tracked.lock().expect("tracked lock poisoned");
                let mut marked = 0usize;
                for entry in tracked.values() {
                    if names.contains_key(&entry.name) {
                        self.state.mark_present(drive, &entry.name);
                        marked += 1;
                    }
                }
                if marked > 0 {
                    info!(drive = %drive.display(), marked, "ignoring pre-existing tracked files on drive");
                }
                continue;
            }

            let entries: Vec<TrackedFile> = {
                let tracked = self.tracked.lock().expect("tracked lock poisoned");
                tracked.values().cloned().collect()
            };
            for entry in entries {
                let present_now = names.contains_key(&entry.name);
                let present_before = self.state.was_present(drive, &entry.name);

                if present_now && !present_before {
                    // Exactly-once: state flips before enforcement runs.
                    self.state.mark_present(drive, &entry.name);
                    let usb_path = names[&entry.name].clone();
                    self.enforce(&snapshot, &entry, drive, &usb_path).await;
                } else if !present_now && present_before {
                    self.state.mark_absent(drive, &entry.name);
                    debug!(file = %entry.name, drive = %drive.display(), "tracked file removed from drive");
                }
            }
        }
    }

    /// Run the most specific matching rule's action for a new transfer.
    async fn enforce(
        &self,
        snapshot: &ActivePolicySet,
        entry: &TrackedFile,
        drive: &Path,
        usb_path: &Path,
    ) {
        let Some(rule) = most_specific_rule(&snapshot.usb_transfer_rules, &entry.full_path) else {
            return;
        };

        let is_copy = entry.full_path.exists();
        let transfer_type = if is_copy { "copy" } else { "move" };
        info!(
            file = %entry.name,
            drive = %drive.display(),
            transfer = transfer_type,
            action = rule.action.as_str(),
            "new USB transfer detected"
        );

        let (verb, success) = match rule.action {
            PolicyAction::Block => self.enforce_block(entry, usb_path, is_copy),
            PolicyAction::Quarantine => self.enforce_quarantine(rule, entry, usb_path, is_copy),
            PolicyAction::Alert => ("alerted".to_string(), true),
            PolicyAction::Log => ("logged".to_string(), true),
        };

        let description = format!(
            "USB file transfer {}\nfile: {}\nsource: {}\ndestination: {}\npolicy: {}",
            verb,
            entry.name,
            entry.source_root.display(),
            usb_path.display(),
            rule.name
        );
        let envelope = EventEnvelope::new(
            EventType::Usb,
            "usb_file_transfer",
            &self.identity.agent_id,
            &self.identity.user_identity,
            description,
            rule.severity,
            &verb,
        )
        .with("file_name", entry.name.clone())
        .with("file_path", entry.relative_path.display().to_string())
        .with("file_size", entry.size)
        .with("source_path", entry.source_root.display().to_string())
        .with("destination_path", usb_path.display().to_string())
        .with("transfer_type", transfer_type)
        .with("policy_id", rule.policy_id.clone())
        .with("policy_name", rule.name.clone())
        .with("success", success);

        if self.events.send(envelope).await.is_err() {
            warn!("event channel closed, dropping transfer event");
        }
    }

    /// Block: the USB copy is removed; a move is first copied back to the
    /// original location.
    fn enforce_block(&self, entry: &TrackedFile, usb_path: &Path, is_copy: bool) -> (String, bool) {
        let result: anyhow::Result<()> = (|| {
            if !is_copy {
                if let Some(parent) = entry.full_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(usb_path, &entry.full_path)?;
                let key = (entry.source_root.clone(), entry.relative_path.clone());
                self.shadows
                    .lock()
                    .expect("shadow lock poisoned")
                    .insert(key, entry.full_path.clone());
            }
            std::fs::remove_file(usb_path)?;
            Ok(())
        })();

        match result {
            Ok(()) => (format!("blocked_{}", if is_copy { "copy" } else { "move" }), true),
            Err(e) => {
                warn!(file = %entry.name, error = %e, "failed to block USB transfer");
                ("block_failed".to_string(), false)
            }
        }
    }

    /// Quarantine: the source (copy) or the USB file (move) goes into the
    /// vault with a timed restore back to the monitored location.
    fn enforce_quarantine(
        &self,
        rule: &PolicyRule,
        entry: &TrackedFile,
        usb_path: &Path,
        is_copy: bool,
    ) -> (String, bool) {
        let vault_dir = rule
            .quarantine_path
            .clone()
            .unwrap_or_else(|| self.default_vault.clone());

        let result: anyhow::Result<PathBuf> = (|| {
            std::fs::create_dir_all(&vault_dir)?;
            let vault_path = usb_vault_path(&vault_dir, &entry.name);
            if is_copy {
                std::fs::rename(&entry.full_path, &vault_path)?;
                std::fs::remove_file(usb_path)?;
            } else {
                std::fs::rename(usb_path, &vault_path)?;
            }
            Ok(vault_path)
        })();

        match result {
            Ok(vault_path) => {
                self.scheduler.schedule(QuarantineRecord {
                    vault_path,
                    original_path: entry.full_path.clone(),
                    restore_delay: self.timings.usb_restore_delay,
                    matched_policies: vec![rule.policy_id.clone()],
                    kind: RestoreKind::UsbTransfer,
                });
                (
                    format!("quarantined_{}", if is_copy { "copy" } else { "move" }),
                    true,
                )
            }
            Err(e) => {
                warn!(file = %entry.name, error = %e, "failed to quarantine USB transfer");
                ("quarantine_failed".to_string(), false)
            }
        }
    }
}

/// Filenames on a drive, mapped to their full path. First occurrence wins.
fn scan_drive(drive: &Path) -> HashMap<String, PathBuf> {
    let mut out = HashMap::new();
    for path in walk_files(drive) {
        if let Some(name) = path.file_name() {
            out.entry(name.to_string_lossy().into_owned()).or_insert(path);
        }
    }
    out
}

/// The enabled rule whose monitored path is the longest prefix of `path`.
fn most_specific_rule<'a>(rules: &'a [PolicyRule], path: &Path) -> Option<&'a PolicyRule> {
    rules
        .iter()
        .filter(|r| r.enabled)
        .filter_map(|r| {
            r.monitored_paths
                .iter()
                .filter(|root| path.starts_with(root))
                .map(|root| root.as_os_str().len())
                .max()
                .map(|depth| (depth, r))
        })
        .max_by_key(|(depth, _)| *depth)
        .map(|(_, r)| r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::EnforcementMarkers;
    use crate::usb::port::MockDriveProvider;
    use opendlp_core::baseline::BaselineStore;
    use opendlp_core::policy::parse_bundle;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        docs: PathBuf,
        vault: PathBuf,
        drive: PathBuf,
        provider: Arc<MockDriveProvider>,
        monitor: UsbTransferMonitor,
        rx: mpsc::Receiver<EventEnvelope>,
    }

    fn fixture(action: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("docs");
        let vault = dir.path().join("vault");
        let drive = dir.path().join("usb0");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::create_dir_all(&drive).unwrap();
        std::fs::write(docs.join("secret.pdf"), "pdf contents").unwrap();

        let json = format!(
            r#"{{"version":"v1","policies":{{"usb_file_transfer_monitoring":[
                {{"id":"xfer-1","name":"transfer rule","enabled":true,"severity":"high",
                  "config":{{"action":"{action}",
                             "monitoredPaths":["{}"],
                             "quarantinePath":"{}",
                             "events":{{"fileTransfer":true}}}}}}
            ]}}}}"#,
            docs.display(),
            vault.display()
        );
        let store = Arc::new(PolicyStore::new());
        store.apply(&parse_bundle(&json).unwrap());

        let provider = Arc::new(MockDriveProvider::new());
        let baselines = Arc::new(Mutex::new(BaselineStore::default()));
        let markers = Arc::new(EnforcementMarkers::new(std::time::Duration::from_millis(200)));
        let (scheduler, _handle) = RestoreScheduler::spawn(baselines, markers);
        let (tx, rx) = mpsc::channel(16);

        let monitor = UsbTransferMonitor::new(
            store,
            provider.clone(),
            scheduler,
            tx,
            AgentIdentity {
                agent_id: "agent-test".into(),
                user_identity: "tester@host".into(),
            },
            Timings::fast(),
            Running::new(),
            Arc::new(TransferState::new()),
            dir.path().join("default-vault"),
        );

        Fixture {
            _dir: dir,
            docs,
            vault,
            drive,
            provider,
            monitor,
            rx,
        }
    }

    #[tokio::test]
    async fn quarantine_copy_moves_source_to_vault_and_restores() {
        let mut f = fixture("quarantine");
        f.provider.mount(&f.drive);

        // Establish drive state (pre-existing sweep on first sight).
        f.monitor.poll_once().await;

        // Copy the tracked file onto the drive.
        std::fs::copy(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;

        let envelope = f.rx.try_recv().expect("transfer envelope");
        assert_eq!(envelope.event_subtype, "usb_file_transfer");
        assert_eq!(envelope.action, "quarantined_copy");
        assert_eq!(envelope.attributes["success"], true);

        assert!(!f.docs.join("secret.pdf").exists(), "source moved to vault");
        assert!(!f.drive.join("secret.pdf").exists(), "usb copy removed");
        let vaulted: Vec<_> = std::fs::read_dir(&f.vault).unwrap().collect();
        assert_eq!(vaulted.len(), 1);
        let vault_name = vaulted[0].as_ref().unwrap().file_name();
        assert!(vault_name.to_string_lossy().starts_with("secret.pdf_"));

        // Restore lands back in the monitored location.
        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        assert_eq!(
            std::fs::read_to_string(f.docs.join("secret.pdf")).unwrap(),
            "pdf contents"
        );
    }

    #[tokio::test]
    async fn quarantine_move_takes_usb_file_to_vault() {
        let mut f = fixture("quarantine");
        f.provider.mount(&f.drive);
        f.monitor.poll_once().await;

        // Move: source disappears, file appears on USB.
        std::fs::rename(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;

        let envelope = f.rx.try_recv().expect("transfer envelope");
        assert_eq!(envelope.action, "quarantined_move");
        assert!(!f.drive.join("secret.pdf").exists());

        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        assert_eq!(
            std::fs::read_to_string(f.docs.join("secret.pdf")).unwrap(),
            "pdf contents"
        );
    }

    #[tokio::test]
    async fn block_copy_deletes_usb_file_only() {
        let mut f = fixture("block");
        f.provider.mount(&f.drive);
        f.monitor.poll_once().await;

        std::fs::copy(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;

        let envelope = f.rx.try_recv().expect("transfer envelope");
        assert_eq!(envelope.action, "blocked_copy");
        assert!(f.docs.join("secret.pdf").exists(), "source untouched");
        assert!(!f.drive.join("secret.pdf").exists(), "usb copy deleted");
    }

    #[tokio::test]
    async fn block_move_copies_back_then_deletes() {
        let mut f = fixture("block");
        f.provider.mount(&f.drive);
        f.monitor.poll_once().await;

        std::fs::rename(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;

        let envelope = f.rx.try_recv().expect("transfer envelope");
        assert_eq!(envelope.action, "blocked_move");
        assert_eq!(
            std::fs::read_to_string(f.docs.join("secret.pdf")).unwrap(),
            "pdf contents",
            "moved file restored to source"
        );
        assert!(!f.drive.join("secret.pdf").exists());
    }

    #[tokio::test]
    async fn alert_only_emits() {
        let mut f = fixture("alert");
        f.provider.mount(&f.drive);
        f.monitor.poll_once().await;

        std::fs::copy(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;

        let envelope = f.rx.try_recv().expect("transfer envelope");
        assert_eq!(envelope.action, "alerted");
        assert!(f.docs.join("secret.pdf").exists());
        assert!(f.drive.join("secret.pdf").exists());
    }

    #[tokio::test]
    async fn transfer_triggers_exactly_once() {
        let mut f = fixture("alert");
        f.provider.mount(&f.drive);
        f.monitor.poll_once().await;

        std::fs::copy(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;
        f.monitor.poll_once().await;
        f.monitor.poll_once().await;

        assert!(f.rx.try_recv().is_ok());
        assert!(f.rx.try_recv().is_err(), "one envelope per transition");
    }

    #[tokio::test]
    async fn preexisting_files_do_not_trigger() {
        let mut f = fixture("block");
        // File already on the drive before it is first observed.
        std::fs::copy(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.provider.mount(&f.drive);

        f.monitor.poll_once().await;
        f.monitor.poll_once().await;

        assert!(f.rx.try_recv().is_err(), "pre-existing files are swept, not enforced");
        assert!(f.drive.join("secret.pdf").exists());
    }

    #[tokio::test]
    async fn removal_then_recopy_triggers_again() {
        let mut f = fixture("alert");
        f.provider.mount(&f.drive);
        f.monitor.poll_once().await;

        std::fs::copy(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;
        assert!(f.rx.try_recv().is_ok());

        std::fs::remove_file(f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;
        assert!(f.rx.try_recv().is_err(), "removal is informational");

        std::fs::copy(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;
        assert!(f.rx.try_recv().is_ok(), "fresh transition fires again");
    }

    #[tokio::test]
    async fn unreadable_drive_is_skipped() {
        let mut f = fixture("block");
        f.provider.mount(&f.drive);
        f.monitor.poll_once().await;

        f.provider.set_unreadable(&f.drive);
        std::fs::copy(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;

        assert!(f.rx.try_recv().is_err(), "unreadable drives are not scanned");
    }

    #[tokio::test]
    async fn disconnect_purges_state() {
        let mut f = fixture("alert");
        f.provider.mount(&f.drive);
        f.monitor.poll_once().await;

        std::fs::copy(f.docs.join("secret.pdf"), f.drive.join("secret.pdf")).unwrap();
        f.monitor.poll_once().await;
        assert!(f.rx.try_recv().is_ok());

        // Drive disappears; its state goes with it.
        f.provider.unmount(&f.drive);
        f.monitor.poll_once().await;

        // Remount with the file still present: pre-existing sweep, no event.
        f.provider.mount(&f.drive);
        f.monitor.poll_once().await;
        f.monitor.poll_once().await;
        assert!(f.rx.try_recv().is_err());
    }

    #[test]
    fn most_specific_rule_prefers_longest_prefix() {
        let json = r#"{"version":"v1","policies":{"usb_file_transfer_monitoring":[
            {"id":"broad","name":"broad","enabled":true,
             "config":{"action":"alert","monitoredPaths":["/docs"],
                        "events":{"fileTransfer":true}}},
            {"id":"narrow","name":"narrow","enabled":true,
             "config":{"action":"block","monitoredPaths":["/docs/finance"],
                        "events":{"fileTransfer":true}}}
        ]}}"#;
        let bundle = parse_bundle(json).unwrap();
        let rules = bundle.rules(opendlp_core::policy::PolicyClass::UsbFileTransferMonitoring);

        let rule = most_specific_rule(rules, Path::new("/docs/finance/q3.xlsx")).unwrap();
        assert_eq!(rule.policy_id, "narrow");
        let rule = most_specific_rule(rules, Path::new("/docs/readme.txt")).unwrap();
        assert_eq!(rule.policy_id, "broad");
        assert!(most_specific_rule(rules, Path::new("/elsewhere/x")).is_none());
    }

    #[tokio::test]
    async fn refresher_tracks_source_presence() {
        let f = fixture("block");
        f.monitor.poll_once().await; // builds tracking
        let tracked = f.monitor.tracked_handle();

        std::fs::remove_file(f.docs.join("secret.pdf")).unwrap();
        let running = Running::new();
        let handle = tokio::spawn(UsbTransferMonitor::run_refresher(
            tracked.clone(),
            running.clone(),
            std::time::Duration::from_millis(20),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        running.clear();
        let _ = handle.await;

        let guard = tracked.lock().unwrap();
        let entry = guard.values().next().expect("tracked entry");
        assert!(!entry.present_in_source);
    }
}
