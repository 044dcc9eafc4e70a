//! Timer-driven restore scheduler.
//!
//! All outstanding quarantine records live in one task ordered by their
//! restore deadline. On fire it performs the kind-appropriate restore,
//! deletes the vault artifact on success, clears the baseline for
//! filesystem kinds, releases the being-quarantined marker, and starts the
//! grace hold. Restore failures leave the vault file in place but still
//! release the marker so observation continues.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use opendlp_core::baseline::BaselineStore;

use crate::markers::EnforcementMarkers;

/// What produced the quarantine, deciding how the restore runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreKind {
    /// Live file moved to the vault; restore rewrites the baseline or
    /// renames the vault copy back.
    OnModify,
    /// Original already deleted; vault holds the baseline bytes.
    OnDelete,
    /// USB transfer quarantine; vault copy renames back to the source.
    UsbTransfer,
}

/// One scheduled restoration.
#[derive(Debug, Clone)]
pub struct QuarantineRecord {
    pub vault_path: PathBuf,
    pub original_path: PathBuf,
    pub restore_delay: std::time::Duration,
    pub matched_policies: Vec<String>,
    pub kind: RestoreKind,
}

struct Pending {
    deadline: Instant,
    seq: u64,
    record: QuarantineRecord,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Handle for scheduling restorations. Dropping every handle shuts the
/// scheduler task down; unfired records simply leave their vault files in
/// place, which is the tolerated shutdown outcome.
#[derive(Clone)]
pub struct RestoreScheduler {
    tx: mpsc::UnboundedSender<QuarantineRecord>,
}

impl RestoreScheduler {
    /// Spawn the scheduler task.
    pub fn spawn(
        baselines: Arc<Mutex<BaselineStore>>,
        markers: Arc<EnforcementMarkers>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<QuarantineRecord>();

        let handle = tokio::spawn(async move {
            let mut heap: BinaryHeap<Reverse<Pending>> = BinaryHeap::new();
            let mut seq: u64 = 0;

            loop {
                let next_deadline = heap.peek().map(|Reverse(p)| p.deadline);

                tokio::select! {
                    received = rx.recv() => {
                        match received {
                            Some(record) => {
                                seq += 1;
                                let deadline = Instant::now() + record.restore_delay;
                                info!(
                                    original = %record.original_path.display(),
                                    delay_secs = record.restore_delay.as_secs_f64(),
                                    "restore scheduled"
                                );
                                heap.push(Reverse(Pending { deadline, seq, record }));
                            }
                            None => break,
                        }
                    }
                    _ = async {
                        match next_deadline {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        let now = Instant::now();
                        loop {
                            let due = matches!(heap.peek(), Some(Reverse(p)) if p.deadline <= now);
                            if !due {
                                break;
                            }
                            let Reverse(pending) = heap.pop().expect("due entry");
                            fire(&pending.record, &baselines, &markers);
                        }
                    }
                }
            }
            info!("restore scheduler shut down");
        });

        (Self { tx }, handle)
    }

    /// Queue a record. A closed scheduler (agent shutting down) drops the
    /// record; the vault file stays recoverable on disk.
    pub fn schedule(&self, record: QuarantineRecord) {
        if self.tx.send(record).is_err() {
            warn!("restore scheduler is gone, vault artifact left in place");
        }
    }
}

fn fire(
    record: &QuarantineRecord,
    baselines: &Arc<Mutex<BaselineStore>>,
    markers: &Arc<EnforcementMarkers>,
) {
    match perform_restore(record, baselines) {
        Ok(()) => {
            info!(
                original = %record.original_path.display(),
                kind = ?record.kind,
                "quarantined file restored"
            );
        }
        Err(e) => {
            // The vault copy stays on disk for manual recovery.
            error!(
                original = %record.original_path.display(),
                vault = %record.vault_path.display(),
                error = %e,
                "restore failed, vault artifact retained"
            );
        }
    }

    if matches!(record.kind, RestoreKind::OnModify | RestoreKind::OnDelete) {
        markers.end_quarantine(&record.original_path);
        markers.start_grace(&record.original_path);
    }
}

fn perform_restore(
    record: &QuarantineRecord,
    baselines: &Arc<Mutex<BaselineStore>>,
) -> Result<()> {
    match record.kind {
        RestoreKind::OnModify | RestoreKind::OnDelete => {
            let baseline = {
                let guard = baselines.lock().expect("baseline lock poisoned");
                guard.get(&record.original_path).map(|b| b.content.clone())
            };

            match baseline {
                Some(content) => {
                    std::fs::write(&record.original_path, &content).with_context(|| {
                        format!("rewriting baseline to {}", record.original_path.display())
                    })?;
                    if record.vault_path.exists() {
                        std::fs::remove_file(&record.vault_path).with_context(|| {
                            format!("removing vault copy {}", record.vault_path.display())
                        })?;
                    }
                }
                None => {
                    // Baseline evicted or never captured: the vault copy is
                    // the only source left.
                    if !record.original_path.exists() {
                        std::fs::rename(&record.vault_path, &record.original_path)
                            .with_context(|| {
                                format!(
                                    "renaming vault copy back to {}",
                                    record.original_path.display()
                                )
                            })?;
                    } else {
                        std::fs::remove_file(&record.vault_path).ok();
                    }
                }
            }

            let mut guard = baselines.lock().expect("baseline lock poisoned");
            guard.remove(&record.original_path);
            Ok(())
        }
        RestoreKind::UsbTransfer => {
            if let Some(parent) = record.original_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating parent dirs {}", parent.display()))?;
            }
            std::fs::rename(&record.vault_path, &record.original_path).with_context(|| {
                format!(
                    "restoring USB-quarantined file to {}",
                    record.original_path.display()
                )
            })?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fixtures() -> (Arc<Mutex<BaselineStore>>, Arc<EnforcementMarkers>) {
        (
            Arc::new(Mutex::new(BaselineStore::default())),
            Arc::new(EnforcementMarkers::new(Duration::from_millis(200))),
        )
    }

    #[tokio::test]
    async fn baseline_restore_rewrites_content_and_clears_state() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("a.txt");
        let vault = dir.path().join("vault_a");
        std::fs::write(&vault, "tampered").unwrap();

        let (baselines, markers) = fixtures();
        baselines
            .lock()
            .unwrap()
            .capture_if_absent(&original, b"hello\n".to_vec());
        markers.begin_quarantine(&original);

        let (scheduler, handle) = RestoreScheduler::spawn(baselines.clone(), markers.clone());
        scheduler.schedule(QuarantineRecord {
            vault_path: vault.clone(),
            original_path: original.clone(),
            restore_delay: Duration::from_millis(50),
            matched_policies: vec!["p1".into()],
            kind: RestoreKind::OnModify,
        });

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(std::fs::read(&original).unwrap(), b"hello\n");
        assert!(!vault.exists(), "vault copy deleted on success");
        assert!(baselines.lock().unwrap().is_empty(), "baseline consumed");
        assert!(!markers.is_quarantining(&original));
        assert!(markers.in_grace(&original));

        drop(scheduler);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn missing_baseline_falls_back_to_vault_rename() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("a.txt");
        let vault = dir.path().join("vault_a");
        std::fs::write(&vault, "vault bytes").unwrap();

        let (baselines, markers) = fixtures();
        let (scheduler, handle) = RestoreScheduler::spawn(baselines, markers);
        scheduler.schedule(QuarantineRecord {
            vault_path: vault.clone(),
            original_path: original.clone(),
            restore_delay: Duration::from_millis(30),
            matched_policies: vec![],
            kind: RestoreKind::OnModify,
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(std::fs::read_to_string(&original).unwrap(), "vault bytes");
        assert!(!vault.exists());

        drop(scheduler);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn usb_restore_renames_into_created_parents() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("docs/sub/secret.pdf");
        let vault = dir.path().join("secret.pdf_123");
        std::fs::write(&vault, "pdf bytes").unwrap();

        let (baselines, markers) = fixtures();
        let (scheduler, handle) = RestoreScheduler::spawn(baselines, markers);
        scheduler.schedule(QuarantineRecord {
            vault_path: vault.clone(),
            original_path: original.clone(),
            restore_delay: Duration::from_millis(30),
            matched_policies: vec![],
            kind: RestoreKind::UsbTransfer,
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(std::fs::read_to_string(&original).unwrap(), "pdf bytes");

        drop(scheduler);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failed_restore_retains_vault_and_releases_marker() {
        let dir = TempDir::new().unwrap();
        // Vault path does not exist and no baseline: rename will fail.
        let original = dir.path().join("a.txt");
        let vault = dir.path().join("missing_vault");

        let (baselines, markers) = fixtures();
        markers.begin_quarantine(&original);

        let (scheduler, handle) = RestoreScheduler::spawn(baselines, markers.clone());
        scheduler.schedule(QuarantineRecord {
            vault_path: vault,
            original_path: original.clone(),
            restore_delay: Duration::from_millis(30),
            matched_policies: vec![],
            kind: RestoreKind::OnDelete,
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!original.exists());
        assert!(
            !markers.is_quarantining(&original),
            "marker released so observation continues"
        );

        drop(scheduler);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn records_fire_in_deadline_order() {
        let dir = TempDir::new().unwrap();
        let (baselines, markers) = fixtures();

        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        let vault1 = dir.path().join("v1");
        let vault2 = dir.path().join("v2");
        std::fs::write(&vault1, "1").unwrap();
        std::fs::write(&vault2, "2").unwrap();

        let (scheduler, handle) = RestoreScheduler::spawn(baselines, markers);
        // Schedule the longer delay first.
        scheduler.schedule(QuarantineRecord {
            vault_path: vault2,
            original_path: second.clone(),
            restore_delay: Duration::from_millis(120),
            matched_policies: vec![],
            kind: RestoreKind::UsbTransfer,
        });
        scheduler.schedule(QuarantineRecord {
            vault_path: vault1,
            original_path: first.clone(),
            restore_delay: Duration::from_millis(40),
            matched_policies: vec![],
            kind: RestoreKind::UsbTransfer,
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(first.exists());
        assert!(!second.exists());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(second.exists());

        drop(scheduler);
        handle.await.unwrap();
    }
}
