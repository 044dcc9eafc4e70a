//! # opendlp-agent
//!
//! The OpenDLP endpoint agent: server transport, event emitter, local
//! event journal, and the supervisor that wires the monitors together and
//! runs the periodic heartbeat and policy-sync loops.

pub mod emitter;
pub mod journal;
pub mod transport;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use opendlp_core::baseline::BaselineStore;
use opendlp_core::config::{AgentConfig, Timings};
use opendlp_core::event::EventEnvelope;
use opendlp_core::policy::{parse_bundle, ApplyOutcome, PolicyStore};
use opendlp_monitors::clipboard::{ClipboardMonitor, ClipboardPort};
use opendlp_monitors::fs::{seed_baselines, FsMonitor};
use opendlp_monitors::markers::EnforcementMarkers;
use opendlp_monitors::quarantine::RestoreScheduler;
use opendlp_monitors::usb::device::{restore_device_access, startup_check};
use opendlp_monitors::usb::{
    DeviceEvent, RemovableDriveProvider, TransferState, UsbControlPort, UsbDeviceMonitor,
    UsbTransferMonitor,
};
use opendlp_monitors::{AgentIdentity, Running};

use emitter::spawn_emitter;
use journal::EventJournal;
use transport::{
    outbound_ip, AgentRegistration, Heartbeat, PolicySyncRequest, ServerTransport, SyncResponse,
};

/// Platform collaborators injected into the agent. Production wires OS
/// implementations; tests wire mocks.
pub struct AgentPorts {
    pub usb_control: Arc<dyn UsbControlPort>,
    pub drives: Arc<dyn RemovableDriveProvider>,
    pub clipboard: Box<dyn ClipboardPort>,
    /// Device arrival/removal notifications from the platform pump.
    pub device_events: mpsc::Receiver<DeviceEvent>,
}

/// The agent supervisor.
pub struct Agent {
    config: AgentConfig,
    timings: Timings,
    policies: Arc<PolicyStore>,
    transport: Arc<dyn ServerTransport>,
    running: Running,
    state_dir: PathBuf,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn ServerTransport>,
        timings: Timings,
        running: Running,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            timings,
            policies: Arc::new(PolicyStore::new()),
            transport,
            running,
            state_dir,
        }
    }

    pub fn policies(&self) -> Arc<PolicyStore> {
        self.policies.clone()
    }

    /// Run every worker until the running flag clears, then shut down:
    /// restore USB access if we left storage disabled and unregister.
    pub async fn run(self, ports: AgentPorts) -> Result<()> {
        info!(
            agent_id = %self.config.agent_id,
            server = %self.config.server_url,
            "starting OpenDLP agent"
        );

        self.register().await;

        // Shared enforcement state.
        let baselines = Arc::new(Mutex::new(BaselineStore::default()));
        let markers = Arc::new(EnforcementMarkers::new(self.timings.grace_window));
        let (scheduler, scheduler_handle) =
            RestoreScheduler::spawn(baselines.clone(), markers.clone());
        let transfer_state = Arc::new(TransferState::new());
        let identity = AgentIdentity::new(&self.config.agent_id);

        let (event_tx, event_rx) = mpsc::channel::<EventEnvelope>(256);
        let journal = Arc::new(
            EventJournal::new(self.config.log_dir().join("opendlp_events.jsonl"))
                .context("opening event journal")?,
        );
        let emitter_handle = spawn_emitter(
            self.policies.clone(),
            self.transport.clone(),
            journal,
            event_rx,
        );

        // First sync before the monitors start observing.
        match self.sync_once().await {
            Ok(Some(outcome)) => self.react(&outcome, &ports, &baselines),
            Ok(None) => info!("policy bundle up to date"),
            Err(e) => warn!(error = %e, "initial policy sync failed, starting without policies"),
        }
        if self.policies.snapshot().is_empty() {
            warn!("no active policies: the agent runs but generates no events");
        }
        if self.policies.snapshot().has_file_rules() {
            seed_baselines(
                &self.policies,
                &baselines,
                self.config.classification.max_file_size_bytes(),
            );
        }
        startup_check(&self.policies, ports.usb_control.as_ref(), &self.state_dir);

        // Monitors.
        let fs_monitor = FsMonitor::new(
            self.policies.clone(),
            baselines.clone(),
            markers.clone(),
            scheduler.clone(),
            event_tx.clone(),
            identity.clone(),
            self.timings.clone(),
            self.running.clone(),
            self.config.quarantine.folder.clone(),
            self.config.classification.max_file_size_bytes(),
        );
        let fs_handle = tokio::spawn(fs_monitor.run());

        let clipboard_monitor = ClipboardMonitor::new(
            self.policies.clone(),
            ports.clipboard,
            event_tx.clone(),
            identity.clone(),
            self.timings.clone(),
            self.running.clone(),
        );
        let clipboard_handle = tokio::spawn(clipboard_monitor.run());

        let device_monitor = UsbDeviceMonitor::new(
            self.policies.clone(),
            ports.usb_control.clone(),
            ports.drives.clone(),
            event_tx.clone(),
            identity.clone(),
            self.running.clone(),
            transfer_state.clone(),
            self.state_dir.clone(),
        );
        let device_handle = tokio::spawn(device_monitor.run(ports.device_events));

        let transfer_monitor = UsbTransferMonitor::new(
            self.policies.clone(),
            ports.drives.clone(),
            scheduler.clone(),
            event_tx.clone(),
            identity.clone(),
            self.timings.clone(),
            self.running.clone(),
            transfer_state.clone(),
            self.config.quarantine.folder.clone(),
        );
        let tracked = transfer_monitor.tracked_handle();
        let transfer_handle = tokio::spawn(transfer_monitor.run());
        let refresher_handle = tokio::spawn(UsbTransferMonitor::run_refresher(
            tracked,
            self.running.clone(),
            self.timings.refresher_poll,
        ));

        // Periodic loops.
        let heartbeat_handle = tokio::spawn(heartbeat_loop(
            self.transport.clone(),
            self.policies.clone(),
            self.running.clone(),
            self.config.heartbeat_period(),
        ));

        let sync_usb_port = ports.usb_control.clone();
        let sync_state_dir = self.state_dir.clone();
        let sync_baselines = baselines.clone();
        let sync_max_bytes = self.config.classification.max_file_size_bytes();
        let sync_policies = self.policies.clone();
        let sync_transport = self.transport.clone();
        let sync_running = self.running.clone();
        let sync_period = self.config.policy_sync_period();
        let sync_handle = tokio::spawn(async move {
            while sync_running.is_set() {
                tokio::time::sleep(sync_period).await;
                if !sync_running.is_set() {
                    break;
                }
                match sync_policies_once(&sync_transport, &sync_policies).await {
                    Ok(Some(outcome)) => {
                        if outcome.blocking_deactivated {
                            restore_device_access(sync_usb_port.as_ref(), &sync_state_dir);
                        }
                        if outcome.file_rules_activated {
                            seed_baselines(&sync_policies, &sync_baselines, sync_max_bytes);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "policy sync failed, keeping previous bundle"),
                }
            }
        });

        // Park until shutdown is requested.
        while self.running.is_set() {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
        info!("shutdown requested");

        // USB storage must never stay disabled past our lifetime.
        if self.state_dir.join(opendlp_monitors::usb::device::BLOCKED_MARKER_FILE).exists() {
            restore_device_access(ports.usb_control.as_ref(), &self.state_dir);
        }
        if let Err(e) = self.transport.unregister().await {
            warn!(error = %e, "unregister failed");
        }

        // Close the event pipeline and let workers drain.
        drop(event_tx);
        drop(scheduler);
        for handle in [
            fs_handle,
            clipboard_handle,
            device_handle,
            transfer_handle,
            refresher_handle,
            heartbeat_handle,
            sync_handle,
            emitter_handle,
            scheduler_handle,
        ] {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        }

        info!("agent stopped");
        Ok(())
    }

    async fn register(&self) {
        let registration = AgentRegistration {
            agent_id: self.config.agent_id.clone(),
            name: self.config.agent_name.clone(),
            hostname: opendlp_core::config::hostname(),
            os: std::env::consts::OS.to_string(),
            os_version: os_version(),
            ip_address: outbound_ip(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        match self.transport.register(&registration).await {
            Ok(()) => info!("agent registered with server"),
            Err(e) => {
                error!(error = %e, "cannot register with server; check that it is running and reachable");
            }
        }
    }

    async fn sync_once(&self) -> Result<Option<ApplyOutcome>> {
        sync_policies_once(&self.transport, &self.policies).await
    }

    fn react(
        &self,
        outcome: &ApplyOutcome,
        ports: &AgentPorts,
        baselines: &Arc<Mutex<BaselineStore>>,
    ) {
        if outcome.blocking_deactivated {
            restore_device_access(ports.usb_control.as_ref(), &self.state_dir);
        }
        if outcome.file_rules_activated {
            seed_baselines(
                &self.policies,
                baselines,
                self.config.classification.max_file_size_bytes(),
            );
        }
    }
}

/// One sync round-trip: fetch, parse, apply. A malformed bundle is an
/// error and the previous active set stays in force.
pub async fn sync_policies_once(
    transport: &Arc<dyn ServerTransport>,
    policies: &Arc<PolicyStore>,
) -> Result<Option<ApplyOutcome>> {
    let installed = policies.active_version();
    let request = PolicySyncRequest {
        platform: std::env::consts::OS.to_string(),
        installed_version: (!installed.is_empty()).then_some(installed),
    };

    match transport.sync_policies(&request).await? {
        SyncResponse::UpToDate => Ok(None),
        SyncResponse::Bundle(raw) => {
            let bundle = parse_bundle(&raw).context("rejecting malformed policy bundle")?;
            let outcome = policies.apply(&bundle);

            // Quarantine directories named by the new rules must exist
            // before the first enforcement needs them.
            for dir in &policies.snapshot().quarantine_directories {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    warn!(dir = %dir.display(), error = %e, "cannot create quarantine dir");
                }
            }
            Ok(Some(outcome))
        }
    }
}

async fn heartbeat_loop(
    transport: Arc<dyn ServerTransport>,
    policies: Arc<PolicyStore>,
    running: Running,
    period: std::time::Duration,
) {
    while running.is_set() {
        let version = policies.active_version();
        let heartbeat = Heartbeat {
            timestamp: Utc::now(),
            ip_address: outbound_ip(),
            policy_version: (!version.is_empty()).then_some(version),
        };
        if let Err(e) = transport.heartbeat(&heartbeat).await {
            tracing::debug!(error = %e, "heartbeat failed");
        }
        tokio::time::sleep(period).await;
    }
}

fn os_version() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Transport returning a scripted sequence of sync responses.
    struct ScriptedTransport {
        responses: StdMutex<Vec<Result<SyncResponse>>>,
    }

    #[async_trait]
    impl ServerTransport for ScriptedTransport {
        async fn register(&self, _r: &AgentRegistration) -> Result<()> {
            Ok(())
        }
        async fn heartbeat(&self, _h: &Heartbeat) -> Result<()> {
            Ok(())
        }
        async fn sync_policies(&self, _r: &PolicySyncRequest) -> Result<SyncResponse> {
            self.responses
                .lock()
                .unwrap()
                .remove(0)
        }
        async fn post_event(&self, _e: &EventEnvelope) -> Result<()> {
            Ok(())
        }
        async fn unregister(&self) -> Result<()> {
            Ok(())
        }
    }

    fn scripted(responses: Vec<Result<SyncResponse>>) -> Arc<dyn ServerTransport> {
        Arc::new(ScriptedTransport {
            responses: StdMutex::new(responses),
        })
    }

    #[tokio::test]
    async fn up_to_date_sync_applies_nothing() {
        let transport = scripted(vec![Ok(SyncResponse::UpToDate)]);
        let policies = Arc::new(PolicyStore::new());
        let outcome = sync_policies_once(&transport, &policies).await.unwrap();
        assert!(outcome.is_none());
        assert!(policies.snapshot().is_empty());
    }

    #[tokio::test]
    async fn new_bundle_is_applied() {
        let body = r#"{"version":"v7","policies":{"clipboard_monitoring":[
            {"id":"c","name":"c","enabled":true,"config":{"action":"alert"}}
        ]}}"#;
        let transport = scripted(vec![Ok(SyncResponse::Bundle(body.to_string()))]);
        let policies = Arc::new(PolicyStore::new());
        let outcome = sync_policies_once(&transport, &policies).await.unwrap();
        assert!(outcome.is_some());
        assert_eq!(policies.active_version(), "v7");
    }

    #[tokio::test]
    async fn malformed_bundle_keeps_previous_set() {
        let good = r#"{"version":"v1","policies":{"clipboard_monitoring":[
            {"id":"c","name":"c","enabled":true,"config":{"action":"alert"}}
        ]}}"#;
        let bad = r#"{"version":"v2","policies":{"clipboard_monitoring":[
            {"id":"c","name":"c","enabled":true,"config":{"action":"detonate"}}
        ]}}"#;
        let transport = scripted(vec![
            Ok(SyncResponse::Bundle(good.to_string())),
            Ok(SyncResponse::Bundle(bad.to_string())),
        ]);
        let policies = Arc::new(PolicyStore::new());

        sync_policies_once(&transport, &policies).await.unwrap();
        assert_eq!(policies.active_version(), "v1");

        let result = sync_policies_once(&transport, &policies).await;
        assert!(result.is_err());
        assert_eq!(policies.active_version(), "v1", "previous bundle retained");
    }

    #[tokio::test]
    async fn transport_error_propagates_without_apply() {
        let transport = scripted(vec![Err(anyhow::anyhow!("connection refused"))]);
        let policies = Arc::new(PolicyStore::new());
        assert!(sync_policies_once(&transport, &policies).await.is_err());
        assert!(policies.snapshot().is_empty());
    }
}
