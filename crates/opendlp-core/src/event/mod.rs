//! Outbound event envelopes.
//!
//! Every monitor outcome becomes an [`EventEnvelope`] delivered to the
//! server and the local journal. The fixed header is shared; per-type
//! attributes (file path, device ids, detected types, ...) ride in a
//! flattened JSON object so the wire shape matches the server's event API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::classify::Classification;
use crate::policy::Severity;

/// Top-level event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    File,
    Clipboard,
    Usb,
}

/// One outbound event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: EventType,
    /// e.g. `file_created`, `usb_connect`, `usb_file_transfer`,
    /// `clipboard_copy`.
    pub event_subtype: String,
    pub agent_id: String,
    /// Fixed origin marker for the server's ingest pipeline.
    pub source_type: String,
    /// `user@hostname` of the interactive session.
    pub user_identity: String,
    pub description: String,
    pub severity: Severity,
    /// Outcome verb: `logged`, `alerted`, `quarantined`, `blocked`,
    /// `deleted`, `quarantined_on_delete`, `blocked_copy`, ...
    pub action: String,
    pub timestamp: DateTime<Utc>,
    /// Per-type attributes, flattened into the envelope.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(
        event_type: EventType,
        event_subtype: &str,
        agent_id: &str,
        user_identity: &str,
        description: String,
        severity: Severity,
        action: &str,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            event_subtype: event_subtype.to_string(),
            agent_id: agent_id.to_string(),
            source_type: "agent".to_string(),
            user_identity: user_identity.to_string(),
            description,
            severity,
            action: action.to_string(),
            timestamp: Utc::now(),
            attributes: Map::new(),
        }
    }

    /// Attach one attribute. Values already present are overwritten.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Attach classification results: detected types with counts and
    /// example values (secrets already rendered redacted), matched policy
    /// ids, and the total match count.
    pub fn with_classification(mut self, classification: &Classification) -> Self {
        let types: Vec<Value> = classification
            .detected
            .keys()
            .map(|k| Value::String(k.clone()))
            .collect();
        let mut detected = Map::new();
        for (data_type, values) in &classification.detected {
            let rendered: Vec<Value> = if crate::classify::is_secret_type(data_type) {
                values.iter().map(|_| Value::String("[REDACTED]".into())).collect()
            } else {
                values.iter().map(|v| Value::String(v.clone())).collect()
            };
            detected.insert(data_type.clone(), Value::Array(rendered));
        }
        let policies: Vec<Value> = classification
            .matched_policies
            .iter()
            .map(|p| Value::String(p.clone()))
            .collect();

        self.attributes.insert("data_types".into(), Value::Array(types));
        self.attributes.insert("detected".into(), Value::Object(detected));
        self.attributes.insert("matched_policies".into(), Value::Array(policies));
        self.attributes.insert(
            "total_matches".into(),
            Value::from(classification.total_matches() as u64),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::policy::{PolicyAction, PolicyClass, PolicyRule};

    fn alert_rule(data_types: &[&str]) -> PolicyRule {
        PolicyRule {
            policy_id: "p1".into(),
            name: "r".into(),
            class: PolicyClass::ClipboardMonitoring,
            enabled: true,
            action: PolicyAction::Alert,
            severity: Severity::Medium,
            data_types: data_types.iter().map(|s| s.to_string()).collect(),
            monitored_paths: vec![],
            file_extensions: vec![],
            monitored_events: vec![],
            min_match_count: 1,
            quarantine_path: None,
        }
    }

    #[test]
    fn envelope_serializes_flat() {
        let envelope = EventEnvelope::new(
            EventType::File,
            "file_created",
            "agent-1",
            "alice@host",
            "File created".into(),
            Severity::High,
            "alerted",
        )
        .with("file_path", "/watched/a.txt")
        .with("file_size", 42);

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event_type"], "file");
        assert_eq!(json["event_subtype"], "file_created");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["file_path"], "/watched/a.txt");
        assert_eq!(json["file_size"], 42);
        assert_eq!(json["source_type"], "agent");
        assert!(json["event_id"].as_str().is_some());
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn classification_attributes_attach() {
        let rules = [alert_rule(&["aadhaar"])];
        let c = classify("id 1234 5678 9012", &rules, "clipboard");
        let envelope = EventEnvelope::new(
            EventType::Clipboard,
            "clipboard_copy",
            "agent-1",
            "alice@host",
            "clip".into(),
            c.severity,
            "alerted",
        )
        .with_classification(&c);

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["data_types"][0], "aadhaar");
        assert_eq!(json["detected"]["aadhaar"][0], "1234 5678 9012");
        assert_eq!(json["matched_policies"][0], "p1");
        assert_eq!(json["total_matches"], 1);
    }

    #[test]
    fn secrets_are_redacted_in_envelope() {
        let rules = [alert_rule(&["password"])];
        let c = classify("password=supersecret123", &rules, "clipboard");
        let envelope = EventEnvelope::new(
            EventType::Clipboard,
            "clipboard_copy",
            "agent-1",
            "alice@host",
            "clip".into(),
            c.severity,
            "alerted",
        )
        .with_classification(&c);

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("supersecret123"));
        assert!(json.contains("[REDACTED]"));
    }

    #[test]
    fn envelope_roundtrips_through_json() {
        let envelope = EventEnvelope::new(
            EventType::Usb,
            "usb_connect",
            "agent-1",
            "alice@host",
            "usb".into(),
            Severity::Critical,
            "blocked",
        )
        .with("vendor_id", "0781")
        .with("product_id", "5567");

        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id, envelope.event_id);
        assert_eq!(back.attributes["vendor_id"], "0781");
    }
}
