//! Event emitter.
//!
//! Single consumer of the monitors' event channel. Each envelope is
//! journaled locally and posted to the server -- unless the active policy
//! set is empty, in which case everything is dropped: an effectively
//! disabled agent must not leak content anywhere.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use opendlp_core::event::EventEnvelope;
use opendlp_core::policy::PolicyStore;

use crate::journal::EventJournal;
use crate::transport::ServerTransport;

/// Spawn the emitter task. It ends when the channel closes.
pub fn spawn_emitter(
    policies: Arc<PolicyStore>,
    transport: Arc<dyn ServerTransport>,
    journal: Arc<EventJournal>,
    mut events: mpsc::Receiver<EventEnvelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            if policies.snapshot().is_empty() {
                debug!(
                    subtype = %envelope.event_subtype,
                    "dropping event: no active policies"
                );
                continue;
            }

            journal.record(&envelope);

            if let Err(e) = transport.post_event(&envelope).await {
                // Transport failures are absorbed; the next periodic loop
                // iteration will find the server again.
                warn!(error = %e, subtype = %envelope.event_subtype, "event delivery failed");
            }
        }
        debug!("event emitter shut down");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        AgentRegistration, Heartbeat, PolicySyncRequest, SyncResponse,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use opendlp_core::event::EventType;
    use opendlp_core::policy::{parse_bundle, Severity};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Transport that records posted events.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub events: Mutex<Vec<EventEnvelope>>,
        pub fail_posts: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ServerTransport for RecordingTransport {
        async fn register(&self, _r: &AgentRegistration) -> Result<()> {
            Ok(())
        }
        async fn heartbeat(&self, _h: &Heartbeat) -> Result<()> {
            Ok(())
        }
        async fn sync_policies(&self, _r: &PolicySyncRequest) -> Result<SyncResponse> {
            Ok(SyncResponse::UpToDate)
        }
        async fn post_event(&self, envelope: &EventEnvelope) -> Result<()> {
            if self.fail_posts.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("server unreachable");
            }
            self.events.lock().unwrap().push(envelope.clone());
            Ok(())
        }
        async fn unregister(&self) -> Result<()> {
            Ok(())
        }
    }

    fn envelope() -> EventEnvelope {
        EventEnvelope::new(
            EventType::Clipboard,
            "clipboard_copy",
            "agent-test",
            "tester@host",
            "clip".into(),
            Severity::High,
            "alerted",
        )
    }

    fn active_store() -> Arc<PolicyStore> {
        let store = Arc::new(PolicyStore::new());
        let json = r#"{"version":"v1","policies":{"clipboard_monitoring":[
            {"id":"c","name":"c","enabled":true,"config":{"action":"alert"}}
        ]}}"#;
        store.apply(&parse_bundle(json).unwrap());
        store
    }

    #[tokio::test]
    async fn events_flow_to_transport_and_journal() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(EventJournal::new(dir.path().join("events.jsonl")).unwrap());
        let transport = Arc::new(RecordingTransport::default());
        let (tx, rx) = mpsc::channel(8);

        let handle = spawn_emitter(active_store(), transport.clone(), journal, rx);
        tx.send(envelope()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(transport.events.lock().unwrap().len(), 1);
        let content = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn empty_policy_set_drops_everything() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(EventJournal::new(dir.path().join("events.jsonl")).unwrap());
        let transport = Arc::new(RecordingTransport::default());
        let (tx, rx) = mpsc::channel(8);

        let store = Arc::new(PolicyStore::new());
        let handle = spawn_emitter(store, transport.clone(), journal, rx);
        tx.send(envelope()).await.unwrap();
        tx.send(envelope()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(transport.events.lock().unwrap().is_empty());
        let content = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 0, "no journal record either");
    }

    #[tokio::test]
    async fn transport_failure_is_absorbed() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(EventJournal::new(dir.path().join("events.jsonl")).unwrap());
        let transport = Arc::new(RecordingTransport::default());
        transport
            .fail_posts
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);

        let handle = spawn_emitter(active_store(), transport.clone(), journal, rx);
        tx.send(envelope()).await.unwrap();
        tx.send(envelope()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        // Both were journaled even though delivery failed.
        let content = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
