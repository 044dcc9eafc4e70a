//! Local event journal.
//!
//! Every emitted envelope is appended as one JSON line to a journal file
//! beside the agent log. Writes flow through a channel to a dedicated
//! writer thread; when the file passes the size threshold it is rotated
//! by renaming with a timestamp suffix and a fresh file is opened.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::warn;

use opendlp_core::event::EventEnvelope;

/// Rotate once the journal file exceeds this size.
pub const MAX_JOURNAL_BYTES: u64 = 10 * 1024 * 1024;

enum WriterCommand {
    Write(Box<EventEnvelope>),
    Shutdown,
}

struct WriterState {
    writer: BufWriter<File>,
    path: PathBuf,
    max_bytes: u64,
}

impl WriterState {
    fn open(path: &PathBuf) -> Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening journal {}", path.display()))?;
        Ok(BufWriter::new(file))
    }

    fn write_envelope(&mut self, envelope: &EventEnvelope) -> Result<()> {
        let json = serde_json::to_string(envelope)?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()?;

        if let Ok(meta) = std::fs::metadata(&self.path) {
            if meta.len() >= self.max_bytes {
                self.rotate()?;
            }
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let mut rotated = self.path.as_os_str().to_owned();
        rotated.push(format!(".{stamp}"));
        std::fs::rename(&self.path, PathBuf::from(rotated))
            .with_context(|| format!("rotating journal {}", self.path.display()))?;
        self.writer = Self::open(&self.path)?;
        Ok(())
    }
}

/// Append-only JSONL journal with size-based rotation.
pub struct EventJournal {
    sender: mpsc::Sender<WriterCommand>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl EventJournal {
    pub fn new(path: PathBuf) -> Result<Self> {
        Self::with_max_bytes(path, MAX_JOURNAL_BYTES)
    }

    pub fn with_max_bytes(path: PathBuf, max_bytes: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating journal dir {}", parent.display()))?;
            }
        }
        let writer = WriterState::open(&path)?;
        let mut state = WriterState {
            writer,
            path,
            max_bytes,
        };

        let (sender, receiver) = mpsc::channel::<WriterCommand>();
        let handle = std::thread::spawn(move || {
            while let Ok(command) = receiver.recv() {
                match command {
                    WriterCommand::Write(envelope) => {
                        if let Err(e) = state.write_envelope(&envelope) {
                            warn!(error = %e, "failed to write journal entry");
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
            let _ = state.writer.flush();
        });

        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue an envelope for writing. Errors (journal thread gone) only
    /// cost the local record, never the outbound delivery.
    pub fn record(&self, envelope: &EventEnvelope) {
        if self
            .sender
            .send(WriterCommand::Write(Box::new(envelope.clone())))
            .is_err()
        {
            warn!("journal writer is gone, dropping local record");
        }
    }
}

impl Drop for EventJournal {
    fn drop(&mut self) {
        let _ = self.sender.send(WriterCommand::Shutdown);
        if let Ok(mut guard) = self.handle.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}
