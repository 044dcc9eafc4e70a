//! USB device monitor.
//!
//! Consumes arrival/removal notifications from the platform port. A
//! blocking policy drives the three-stage device block (storage service,
//! device nodes, volume eject); each stage is best-effort and any stage
//! succeeding counts as a successful block. Deactivating the blocking
//! policy, shutting down, or finding a stale blocked marker at startup
//! restores device access.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use opendlp_core::event::{EventEnvelope, EventType};
use opendlp_core::policy::{PolicyAction, PolicyStore, Severity};

use super::port::{
    fallback_device_name, parse_vid_pid, DeviceEvent, RemovableDriveProvider, UsbControlPort,
};
use super::transfer::TransferState;
use crate::{AgentIdentity, Running};

/// Marker file recording that USB storage was left disabled. Survives a
/// crash so the next start can restore access when no blocking policy is
/// active anymore.
pub const BLOCKED_MARKER_FILE: &str = "usb_blocked";

/// USB device monitor worker.
pub struct UsbDeviceMonitor {
    policies: Arc<PolicyStore>,
    port: Arc<dyn UsbControlPort>,
    drives: Arc<dyn RemovableDriveProvider>,
    events: mpsc::Sender<EventEnvelope>,
    identity: AgentIdentity,
    running: Running,
    /// drive root -> device id, shared with the transfer monitor so a
    /// disconnect can purge per-drive transfer state.
    drive_map: Arc<Mutex<std::collections::HashMap<PathBuf, String>>>,
    transfer_state: Arc<TransferState>,
    /// Directory holding the blocked marker file.
    state_dir: PathBuf,
}

impl UsbDeviceMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policies: Arc<PolicyStore>,
        port: Arc<dyn UsbControlPort>,
        drives: Arc<dyn RemovableDriveProvider>,
        events: mpsc::Sender<EventEnvelope>,
        identity: AgentIdentity,
        running: Running,
        transfer_state: Arc<TransferState>,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            policies,
            port,
            drives,
            events,
            identity,
            running,
            drive_map: Arc::new(Mutex::new(std::collections::HashMap::new())),
            transfer_state,
            state_dir,
        }
    }

    pub fn drive_map(&self) -> Arc<Mutex<std::collections::HashMap<PathBuf, String>>> {
        self.drive_map.clone()
    }

    fn marker_path(&self) -> PathBuf {
        self.state_dir.join(BLOCKED_MARKER_FILE)
    }

    /// Crash-recovery check: a leftover blocked marker with no active
    /// blocking policy means the previous run died while storage was
    /// disabled. Restore access now.
    pub fn startup_check(&self) {
        startup_check(&self.policies, self.port.as_ref(), &self.state_dir);
    }

    /// Re-enable device nodes and the storage service, then clear the
    /// marker. Called on policy deactivation and on shutdown.
    pub fn restore_device_access(&self) {
        restore_device_access(self.port.as_ref(), &self.state_dir);
    }

    /// Pump notifications until shutdown.
    pub async fn run(mut self, mut notifications: mpsc::Receiver<DeviceEvent>) {
        info!("USB device monitor started");
        while self.running.is_set() {
            match tokio::time::timeout(std::time::Duration::from_secs(1), notifications.recv())
                .await
            {
                Ok(Some(event)) => self.handle(event).await,
                Ok(None) => break,
                Err(_) => {}
            }
        }
        info!("USB device monitor stopped");
    }

    /// Handle a single notification, exposed for tests.
    pub async fn handle(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Arrived { device_id } => self.on_arrival(&device_id).await,
            DeviceEvent::Removed { device_id } => self.on_removal(&device_id).await,
        }
    }

    async fn on_arrival(&mut self, device_id: &str) {
        // Associate any freshly mounted drive with this device so its
        // transfer state can be purged on disconnect.
        {
            let mut map = self.drive_map.lock().expect("drive map lock poisoned");
            for drive in self.drives.mounted_drives() {
                map.entry(drive).or_insert_with(|| device_id.to_string());
            }
        }

        let snapshot = self.policies.snapshot();
        if snapshot.usb_device_rules.is_empty() {
            return;
        }

        let (vendor_id, product_id) = parse_vid_pid(device_id);
        let device_name = self
            .port
            .friendly_name(device_id)
            .unwrap_or_else(|| fallback_device_name(&vendor_id, &product_id));
        info!(device = %device_name, id = %device_id, "USB device connected");

        let Some(rule) = snapshot
            .usb_device_rules
            .iter()
            .find(|r| r.enabled && r.monitors_event("usb_connect"))
        else {
            return;
        };

        if rule.action == PolicyAction::Block && snapshot.usb_blocking_active {
            self.block_device(device_id, &device_name, &vendor_id, &product_id, &rule.policy_id, &rule.name)
                .await;
            return;
        }

        let (severity, verb) = match rule.action {
            PolicyAction::Block => (Severity::Critical, "blocked"),
            PolicyAction::Alert => (Severity::High, "alerted"),
            _ => (Severity::Medium, "logged"),
        };

        let description = format!(
            "USB device connect\ndevice: {device_name}\nvendor: {vendor_id} product: {product_id}\npolicy: {}",
            rule.name
        );
        let envelope = EventEnvelope::new(
            EventType::Usb,
            "usb_connect",
            &self.identity.agent_id,
            &self.identity.user_identity,
            description,
            severity,
            verb,
        )
        .with("device_name", device_name)
        .with("device_id", device_id)
        .with("vendor_id", vendor_id)
        .with("product_id", product_id)
        .with("policy_id", rule.policy_id.clone())
        .with("policy_name", rule.name.clone());

        if self.events.send(envelope).await.is_err() {
            warn!("event channel closed, dropping usb event");
        }
    }

    async fn block_device(
        &mut self,
        device_id: &str,
        device_name: &str,
        vendor_id: &str,
        product_id: &str,
        policy_id: &str,
        policy_name: &str,
    ) {
        warn!(device = %device_name, policy = %policy_name, "blocking USB device by policy");

        let service_disabled = match self.port.disable_storage_service() {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "stage 1 (storage service) failed: administrator rights required");
                false
            }
        };
        let devices_disabled = match self.port.disable_storage_devices() {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "stage 2 (device nodes) failed: administrator rights required");
                false
            }
        };
        let drives_ejected = match self.port.eject_removable_drives() {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "stage 3 (volume eject) failed: administrator rights required");
                0
            }
        };

        let block_success = service_disabled || devices_disabled || drives_ejected > 0;
        if block_success {
            if let Err(e) = std::fs::create_dir_all(&self.state_dir)
                .and_then(|()| std::fs::write(self.marker_path(), device_id))
            {
                warn!(error = %e, "could not persist blocked marker");
            }
        } else {
            error!("all block stages failed; run the agent with administrator rights");
        }

        let description = format!(
            "USB device blocked by policy\ndevice: {device_name}\npolicy: {policy_name}\nblock success: {block_success}"
        );
        let envelope = EventEnvelope::new(
            EventType::Usb,
            "usb_connect",
            &self.identity.agent_id,
            &self.identity.user_identity,
            description,
            Severity::Critical,
            "blocked",
        )
        .with("device_name", device_name)
        .with("device_id", device_id)
        .with("vendor_id", vendor_id)
        .with("product_id", product_id)
        .with("policy_id", policy_id)
        .with("policy_name", policy_name)
        .with("block_success", block_success)
        .with("service_disabled", service_disabled)
        .with("devices_disabled", devices_disabled)
        .with("drives_ejected", drives_ejected as u64);

        if self.events.send(envelope).await.is_err() {
            warn!("event channel closed, dropping usb block event");
        }
    }

    async fn on_removal(&mut self, device_id: &str) {
        // Purge drive mapping and per-drive transfer state first.
        let drives: Vec<PathBuf> = {
            let mut map = self.drive_map.lock().expect("drive map lock poisoned");
            let drives: Vec<PathBuf> = map
                .iter()
                .filter(|(_, id)| id.as_str() == device_id)
                .map(|(drive, _)| drive.clone())
                .collect();
            for drive in &drives {
                map.remove(drive);
            }
            drives
        };
        for drive in &drives {
            self.transfer_state.purge_drive(drive);
            info!(drive = %drive.display(), "cleared transfer state for disconnected drive");
        }

        let snapshot = self.policies.snapshot();
        let Some(rule) = snapshot
            .usb_device_rules
            .iter()
            .find(|r| r.enabled && r.monitors_event("usb_disconnect"))
        else {
            return;
        };

        let (vendor_id, product_id) = parse_vid_pid(device_id);
        let device_name = self
            .port
            .friendly_name(device_id)
            .unwrap_or_else(|| fallback_device_name(&vendor_id, &product_id));

        let envelope = EventEnvelope::new(
            EventType::Usb,
            "usb_disconnect",
            &self.identity.agent_id,
            &self.identity.user_identity,
            format!("USB device disconnect\ndevice: {device_name}"),
            Severity::Medium,
            "logged",
        )
        .with("device_name", device_name)
        .with("device_id", device_id)
        .with("vendor_id", vendor_id)
        .with("product_id", product_id)
        .with("policy_id", rule.policy_id.clone());

        if self.events.send(envelope).await.is_err() {
            warn!("event channel closed, dropping usb disconnect event");
        }
    }

    /// Associate a mounted drive with a device id, for disconnect purging.
    pub fn map_drive(&self, drive: &Path, device_id: &str) {
        self.drive_map
            .lock()
            .expect("drive map lock poisoned")
            .insert(drive.to_path_buf(), device_id.to_string());
    }
}

/// Re-enable device nodes and the storage service, then clear the blocked
/// marker. Shared by the monitor, the policy-sync reaction, and shutdown.
pub fn restore_device_access(port: &dyn UsbControlPort, state_dir: &Path) {
    if let Err(e) = port.enable_storage_devices() {
        error!(error = %e, "failed to re-enable USB storage devices");
    }
    if let Err(e) = port.restore_storage_service() {
        error!(error = %e, "failed to restore USB storage service");
    }
    let _ = std::fs::remove_file(state_dir.join(BLOCKED_MARKER_FILE));
    info!("USB device access restored");
}

/// Restore access at startup when a stale blocked marker exists but no
/// blocking policy is active anymore.
pub fn startup_check(policies: &PolicyStore, port: &dyn UsbControlPort, state_dir: &Path) {
    if state_dir.join(BLOCKED_MARKER_FILE).exists() && !policies.snapshot().usb_blocking_active {
        warn!("stale USB blocked marker found at startup, restoring device access");
        restore_device_access(port, state_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::port::MockUsbPort;
    use opendlp_core::policy::parse_bundle;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn usb_store(action: &str, connect: bool, disconnect: bool) -> Arc<PolicyStore> {
        let json = format!(
            r#"{{"version":"v1","policies":{{"usb_device_monitoring":[
                {{"id":"usb-1","name":"usb rule","enabled":true,"severity":"critical",
                  "config":{{"action":"{action}",
                             "events":{{"connect":{connect},"disconnect":{disconnect}}}}}}}
            ]}}}}"#
        );
        let store = Arc::new(PolicyStore::new());
        store.apply(&parse_bundle(&json).unwrap());
        store
    }

    fn build(
        store: Arc<PolicyStore>,
        port: Arc<MockUsbPort>,
        state_dir: &Path,
    ) -> (UsbDeviceMonitor, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(16);
        let monitor = UsbDeviceMonitor::new(
            store,
            port,
            Arc::new(crate::usb::port::NullDriveProvider),
            tx,
            AgentIdentity {
                agent_id: "agent-test".into(),
                user_identity: "tester@host".into(),
            },
            Running::new(),
            Arc::new(TransferState::new()),
            state_dir.to_path_buf(),
        );
        (monitor, rx)
    }

    const DEVICE: &str = r"USB\VID_0781&PID_5567\0401396DDD10F8F1";

    #[tokio::test]
    async fn block_policy_runs_three_stages_and_reports() {
        let dir = TempDir::new().unwrap();
        let port = Arc::new(MockUsbPort::new());
        let (mut monitor, mut rx) = build(usb_store("block", true, false), port.clone(), dir.path());

        monitor
            .handle(DeviceEvent::Arrived {
                device_id: DEVICE.into(),
            })
            .await;

        let envelope = rx.try_recv().expect("block envelope");
        assert_eq!(envelope.event_subtype, "usb_connect");
        assert_eq!(envelope.action, "blocked");
        assert_eq!(envelope.attributes["block_success"], true);
        assert_eq!(envelope.attributes["service_disabled"], true);
        assert_eq!(envelope.attributes["devices_disabled"], true);
        assert_eq!(envelope.attributes["drives_ejected"], 1);
        assert_eq!(envelope.attributes["vendor_id"], "0781");
        assert_eq!(envelope.attributes["product_id"], "5567");
        assert!(port.blocked());
        assert!(dir.path().join(BLOCKED_MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn unprivileged_block_reports_stage_failures() {
        let dir = TempDir::new().unwrap();
        let port = Arc::new(MockUsbPort::new());
        port.deny_all.store(true, Ordering::SeqCst);
        let (mut monitor, mut rx) = build(usb_store("block", true, false), port.clone(), dir.path());

        monitor
            .handle(DeviceEvent::Arrived {
                device_id: DEVICE.into(),
            })
            .await;

        let envelope = rx.try_recv().expect("attempted block envelope");
        assert_eq!(envelope.action, "blocked");
        assert_eq!(envelope.attributes["block_success"], false);
        assert_eq!(envelope.attributes["service_disabled"], false);
        assert_eq!(envelope.attributes["devices_disabled"], false);
        assert_eq!(envelope.attributes["drives_ejected"], 0);
        assert!(!dir.path().join(BLOCKED_MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn alert_policy_bypasses_blocker() {
        let dir = TempDir::new().unwrap();
        let port = Arc::new(MockUsbPort::new());
        let (mut monitor, mut rx) = build(usb_store("alert", true, false), port.clone(), dir.path());

        monitor
            .handle(DeviceEvent::Arrived {
                device_id: DEVICE.into(),
            })
            .await;

        let envelope = rx.try_recv().expect("alert envelope");
        assert_eq!(envelope.action, "alerted");
        assert_eq!(envelope.severity, Severity::High);
        assert!(!port.blocked(), "alert policy must not touch the blocker");
    }

    #[tokio::test]
    async fn friendly_name_fallback_uses_vid_pid() {
        let dir = TempDir::new().unwrap();
        let port = Arc::new(MockUsbPort::new());
        let (mut monitor, mut rx) = build(usb_store("alert", true, false), port, dir.path());

        monitor
            .handle(DeviceEvent::Arrived {
                device_id: DEVICE.into(),
            })
            .await;

        let envelope = rx.try_recv().unwrap();
        assert_eq!(
            envelope.attributes["device_name"],
            "USB Device (VID:0781 PID:5567)"
        );
    }

    #[tokio::test]
    async fn friendly_name_from_port_wins() {
        let dir = TempDir::new().unwrap();
        let port = Arc::new(MockUsbPort::new().with_name(DEVICE, "SanDisk Cruzer"));
        let (mut monitor, mut rx) = build(usb_store("alert", true, false), port, dir.path());

        monitor
            .handle(DeviceEvent::Arrived {
                device_id: DEVICE.into(),
            })
            .await;

        assert_eq!(rx.try_recv().unwrap().attributes["device_name"], "SanDisk Cruzer");
    }

    #[tokio::test]
    async fn disconnect_emits_and_purges_drive_state() {
        let dir = TempDir::new().unwrap();
        let port = Arc::new(MockUsbPort::new());
        let (mut monitor, mut rx) = build(usb_store("alert", true, true), port, dir.path());

        let drive = PathBuf::from("/mnt/usb0");
        monitor.map_drive(&drive, DEVICE);
        monitor.transfer_state.mark_present(&drive, "secret.pdf");

        monitor
            .handle(DeviceEvent::Removed {
                device_id: DEVICE.into(),
            })
            .await;

        let envelope = rx.try_recv().expect("disconnect envelope");
        assert_eq!(envelope.event_subtype, "usb_disconnect");
        assert!(monitor.drive_map.lock().unwrap().is_empty());
        assert!(!monitor.transfer_state.was_present(&drive, "secret.pdf"));
    }

    #[tokio::test]
    async fn no_connect_rule_means_silence() {
        let dir = TempDir::new().unwrap();
        let port = Arc::new(MockUsbPort::new());
        let (mut monitor, mut rx) = build(usb_store("block", false, true), port, dir.path());

        monitor
            .handle(DeviceEvent::Arrived {
                device_id: DEVICE.into(),
            })
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn restore_access_clears_marker() {
        let dir = TempDir::new().unwrap();
        let port = Arc::new(MockUsbPort::new());
        let (mut monitor, _rx) = build(usb_store("block", true, false), port.clone(), dir.path());

        monitor
            .handle(DeviceEvent::Arrived {
                device_id: DEVICE.into(),
            })
            .await;
        assert!(port.blocked());

        monitor.restore_device_access();
        assert!(!port.blocked());
        assert!(!dir.path().join(BLOCKED_MARKER_FILE).exists());
        assert_eq!(port.restore_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn startup_check_restores_after_crash() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(BLOCKED_MARKER_FILE), DEVICE).unwrap();

        // No blocking policy active anymore.
        let port = Arc::new(MockUsbPort::new());
        port.service_disabled.store(true, Ordering::SeqCst);
        let (monitor, _rx) = build(usb_store("alert", true, false), port.clone(), dir.path());

        monitor.startup_check();
        assert!(!port.blocked());
        assert!(!dir.path().join(BLOCKED_MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn startup_check_keeps_block_when_policy_still_active() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(BLOCKED_MARKER_FILE), DEVICE).unwrap();

        let port = Arc::new(MockUsbPort::new());
        port.service_disabled.store(true, Ordering::SeqCst);
        let (monitor, _rx) = build(usb_store("block", true, false), port.clone(), dir.path());

        monitor.startup_check();
        assert!(port.blocked(), "active blocking policy keeps the block");
        assert!(dir.path().join(BLOCKED_MARKER_FILE).exists());
    }
}
