//! Clipboard monitor.
//!
//! Polls the clipboard port every couple of seconds. When the text
//! changes, the content is classified against the clipboard rule set and
//! a single alert envelope is emitted, enumerating each detected type
//! with its count and a few example values (secrets redacted). The
//! foreground window title feeds a likely-source-filename heuristic.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use opendlp_core::classify::classify;
use opendlp_core::config::Timings;
use opendlp_core::event::{EventEnvelope, EventType};
use opendlp_core::policy::PolicyStore;

use crate::{AgentIdentity, Running};

/// Platform access to the clipboard and the foreground window.
///
/// The production implementation wraps the OS clipboard APIs; tests use
/// [`MockClipboard`].
pub trait ClipboardPort: Send {
    /// Current clipboard text, `None` when empty or non-text.
    fn read_text(&mut self) -> anyhow::Result<Option<String>>;
    /// Title of the foreground window, when available.
    fn window_title(&mut self) -> Option<String>;
}

/// Clipboard port for platforms without an integration; always empty.
#[derive(Default)]
pub struct NullClipboard;

impl ClipboardPort for NullClipboard {
    fn read_text(&mut self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
    fn window_title(&mut self) -> Option<String> {
        None
    }
}

/// Scripted clipboard for tests: pops queued entries on each poll.
#[derive(Default)]
pub struct MockClipboard {
    entries: std::collections::VecDeque<(String, Option<String>)>,
    current: Option<(String, Option<String>)>,
}

impl MockClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a clipboard change with an optional window title.
    pub fn push(&mut self, text: &str, title: Option<&str>) {
        self.entries
            .push_back((text.to_string(), title.map(str::to_string)));
    }
}

impl ClipboardPort for MockClipboard {
    fn read_text(&mut self) -> anyhow::Result<Option<String>> {
        if let Some(next) = self.entries.pop_front() {
            self.current = Some(next);
        }
        Ok(self.current.as_ref().map(|(text, _)| text.clone()))
    }

    fn window_title(&mut self) -> Option<String> {
        self.current.as_ref().and_then(|(_, title)| title.clone())
    }
}

/// Extensions the source-filename heuristic recognizes in window titles.
const KNOWN_EXTENSIONS: &[&str] = &[
    "txt", "doc", "docx", "pdf", "csv", "xls", "xlsx", "json", "xml", "sql", "cpp", "h", "py",
    "java", "js",
];

/// Infer a source filename from a window title: the substring before
/// `" - "` when it ends in a recognized extension.
pub fn source_file_from_title(title: &str) -> Option<String> {
    if let Some(prefix) = title.split(" - ").next() {
        if prefix != title || title.contains(" - ") {
            if let Some(ext) = prefix.rsplit('.').next() {
                if prefix.contains('.') && KNOWN_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
                    return Some(prefix.trim().to_string());
                }
            }
        }
    }
    // Fallback: any filename-looking token with a recognized extension.
    for token in title.split_whitespace() {
        if let Some(ext) = token.rsplit('.').next() {
            if token.contains('.')
                && token.len() > ext.len() + 1
                && KNOWN_EXTENSIONS.contains(&ext.to_lowercase().as_str())
            {
                return Some(token.trim_matches(|c: char| !c.is_alphanumeric() && c != '.' && c != '_' && c != '-').to_string());
            }
        }
    }
    None
}

/// Clipboard monitor worker.
pub struct ClipboardMonitor {
    policies: Arc<PolicyStore>,
    port: Box<dyn ClipboardPort>,
    events: mpsc::Sender<EventEnvelope>,
    identity: AgentIdentity,
    timings: Timings,
    running: Running,
    last_text: Option<String>,
}

impl ClipboardMonitor {
    pub fn new(
        policies: Arc<PolicyStore>,
        port: Box<dyn ClipboardPort>,
        events: mpsc::Sender<EventEnvelope>,
        identity: AgentIdentity,
        timings: Timings,
        running: Running,
    ) -> Self {
        Self {
            policies,
            port,
            events,
            identity,
            timings,
            running,
            last_text: None,
        }
    }

    pub async fn run(mut self) {
        info!("clipboard monitor started");
        while self.running.is_set() {
            self.poll_once().await;
            tokio::time::sleep(self.timings.clipboard_poll).await;
        }
        info!("clipboard monitor stopped");
    }

    /// One poll iteration, exposed for tests.
    pub async fn poll_once(&mut self) {
        let snapshot = self.policies.snapshot();
        if snapshot.clipboard_rules.is_empty() {
            return;
        }

        let text = match self.port.read_text() {
            Ok(Some(text)) if !text.is_empty() => text,
            Ok(_) => return,
            Err(e) => {
                debug!(error = %e, "clipboard access failed");
                return;
            }
        };
        if self.last_text.as_deref() == Some(text.as_str()) {
            return;
        }
        self.last_text = Some(text.clone());

        let title = self.port.window_title();
        let classification = classify(&text, &snapshot.clipboard_rules, "clipboard");
        if !classification.matched() || classification.detected.is_empty() {
            return;
        }
        let summary = classification.detected_summary();
        if summary.trim().is_empty() {
            return;
        }

        let source_file = title.as_deref().and_then(source_file_from_title);
        let mut description = format!(
            "Clipboard copy with sensitive data ({} matches){}",
            classification.total_matches(),
            summary
        );
        if let Some(file) = &source_file {
            description.push_str(&format!("\nsource file: {file}"));
        }

        let mut envelope = EventEnvelope::new(
            EventType::Clipboard,
            "clipboard_copy",
            &self.identity.agent_id,
            &self.identity.user_identity,
            description,
            classification.severity,
            "alerted",
        )
        .with_classification(&classification);
        if let Some(file) = source_file {
            envelope = envelope.with("source_file", file);
        }
        if let Some(title) = title {
            envelope = envelope.with("source_window", title);
        }

        if self.events.send(envelope).await.is_err() {
            warn!("event channel closed, dropping clipboard event");
        }
    }
}
