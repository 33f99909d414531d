//! Event sinks: where change events leave the FIM core.
//!
//! Delivery is fire-and-forget from the core's point of view. Sinks never
//! return errors to the monitoring loops; they log and move on.

use crate::event::{ChangeEvent, EventRecord};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MAX_ROTATIONS: usize = 5;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ChangeEvent);

    /// Operational notice for the logging collaborator (queue overflow,
    /// degraded attribution and the like).
    fn alert(&self, message: &str) {
        warn!(alert = message, "fim alert");
    }
}

/// Appends one JSON record per line, rotating `path.1 .. path.5` once the
/// file grows past `max_bytes`.
pub struct JsonLineSink {
    path: PathBuf,
    max_bytes: u64,
    write_lock: Mutex<()>,
}

impl JsonLineSink {
    pub fn new<P: AsRef<Path>>(path: P, max_bytes: u64) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            max_bytes,
            write_lock: Mutex::new(()),
        })
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock();
        self.rotate_if_needed()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i);
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, self.path_with_suffix(i + 1))?;
                }
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1))?;
        debug!(path = %self.path.display(), "event log rotated");
        Ok(())
    }

    fn path_with_suffix(&self, index: usize) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{index}"));
        self.path.with_file_name(name)
    }
}

impl EventSink for JsonLineSink {
    fn emit(&self, event: &ChangeEvent) {
        let record = event.to_record(Utc::now());
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!(path = event.path(), error = %err, "cannot serialize event");
                return;
            }
        };
        if let Err(err) = self.append_line(&line) {
            warn!(log = %self.path.display(), error = %err, "cannot write event");
        }
    }

    fn alert(&self, message: &str) {
        warn!(alert = message, "fim alert");
        let line = serde_json::json!({
            "type": "alert",
            "timestamp": Utc::now(),
            "message": message,
        });
        if let Err(err) = self.append_line(&line.to_string()) {
            warn!(log = %self.path.display(), error = %err, "cannot write alert");
        }
    }
}

/// Hands records to an in-process transport task.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &ChangeEvent) {
        if self.tx.send(event.to_record(Utc::now())).is_err() {
            debug!(path = event.path(), "event receiver gone, dropping event");
        }
    }
}

/// Keeps everything in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ChangeEvent>>,
    alerts: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &ChangeEvent) {
        self.events.lock().push(event.clone());
    }

    fn alert(&self, message: &str) {
        self.alerts.lock().push(message.to_string());
    }
}
