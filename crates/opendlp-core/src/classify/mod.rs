//! Content classification against policy rules.
//!
//! The classifier is pure over the detector registry: given a text buffer,
//! the candidate rules, and an event-kind token it produces the matched
//! policies, per-type detected values, an overall severity, and the
//! strongest suggested action. Enforcement is the monitors' concern.

pub mod detectors;

pub use detectors::{detector, is_secret_type, Confidence, DetectorSpec, RenderMode};

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::policy::{PolicyAction, PolicyRule, Severity};

/// Inputs larger than this are not content-inspected.
pub const MAX_CLASSIFIABLE_BYTES: u64 = 10 * 1024 * 1024;

/// Result of classifying one buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// Data-type labels that matched anywhere.
    pub labels: Vec<String>,
    pub severity: Severity,
    /// Rendered values per data type, deduplicated, capped per detector.
    pub detected: BTreeMap<String, Vec<String>>,
    /// Policy ids whose min-match threshold was met.
    pub matched_policies: Vec<String>,
    /// Strongest action across matched rules.
    pub suggested_action: PolicyAction,
}

impl Classification {
    /// Total number of detected values across all types.
    pub fn total_matches(&self) -> usize {
        self.detected.values().map(Vec::len).sum()
    }

    pub fn matched(&self) -> bool {
        !self.matched_policies.is_empty()
    }

    /// A classification for inputs over the size cap: no content is
    /// inspected, the event is logged only.
    pub fn too_large() -> Self {
        Self {
            labels: vec!["LARGE_FILE".to_string()],
            severity: Severity::Low,
            suggested_action: PolicyAction::Log,
            ..Self::default()
        }
    }

    /// Human-readable per-type summary with secrets redacted and at most
    /// three example values per type.
    pub fn detected_summary(&self) -> String {
        let mut out = String::new();
        for (data_type, values) in &self.detected {
            if values.is_empty() {
                continue;
            }
            out.push_str(&format!("\n  {}: {} found\n    values: ", data_type, values.len()));
            let redact = is_secret_type(data_type);
            for (i, value) in values.iter().take(3).enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if redact {
                    out.push_str("[REDACTED]");
                } else if value.len() > 40 {
                    out.push_str(&format!("{}...", &value[..37.min(value.len())]));
                } else {
                    out.push_str(value);
                }
            }
            if values.len() > 3 {
                out.push_str(&format!(" ... (+{} more)", values.len() - 3));
            }
        }
        out
    }
}

/// Classify `text` under `rules` for the given event kind.
///
/// Per rule: skip unless the rule monitors the event kind (an empty
/// monitored-events list matches everything); run each named detector,
/// collecting values; the rule matches when the number of *types* that
/// produced values reaches its `min_match_count`. A matching block or
/// quarantine rule elevates severity to critical, a matching alert rule to
/// at least high. The suggested action is the strongest across matches.
pub fn classify(text: &str, rules: &[PolicyRule], event_kind: &str) -> Classification {
    let mut result = Classification::default();

    if rules.is_empty() {
        return result;
    }

    for rule in rules {
        if !rule.enabled {
            continue;
        }
        if !event_kind.is_empty() && !rule.monitors_event(event_kind) {
            continue;
        }

        let mut matched_types: Vec<String> = Vec::new();
        for data_type in &rule.data_types {
            let Some(spec) = detector(data_type) else {
                // A missing or failing detector is isolated; the others
                // still run.
                warn!(data_type = %data_type, "no detector registered, skipping");
                continue;
            };
            let values = spec.run(text);
            if values.is_empty() {
                continue;
            }
            matched_types.push(data_type.clone());
            result
                .detected
                .entry(data_type.clone())
                .or_insert(values);
        }

        if matched_types.is_empty() || matched_types.len() < rule.min_match_count {
            continue;
        }

        debug!(policy = %rule.policy_id, types = ?matched_types, "rule matched");
        result.matched_policies.push(rule.policy_id.clone());
        for t in matched_types {
            if !result.labels.contains(&t) {
                result.labels.push(t);
            }
        }

        match rule.action {
            PolicyAction::Block | PolicyAction::Quarantine => {
                result.severity = Severity::Critical;
            }
            PolicyAction::Alert => {
                result.severity = result.severity.max(Severity::High);
            }
            PolicyAction::Log => {}
        }
        result.suggested_action = result.suggested_action.max(rule.action);
    }

    result
}
