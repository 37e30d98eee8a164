use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use crate::task::{TransferStatus, TransferTask};

/// Receives transfer events from worker threads. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn on_bytes(&self, _delta: u64) {}
    fn on_status_changed(&self, _task: &TransferTask) {}
}

pub struct NoopSink;
impl ProgressSink for NoopSink {}

/// Forwards status changes to tracing.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_status_changed(&self, task: &TransferTask) {
        match task.status {
            TransferStatus::Failed => error!(
                remote = %task.remote_path,
                local = %task.local_path.display(),
                error = task.error.as_deref().unwrap_or(""),
                "transfer failed"
            ),
            status => info!(
                remote = %task.remote_path,
                local = %task.local_path.display(),
                ?status,
                bytes = task.bytes_done(),
                "transfer status"
            ),
        }
    }
}

/// Append-only transfer log with one timestamped line per event.
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl ProgressSink for TextLogger {
    fn on_status_changed(&self, task: &TransferTask) {
        let mut line = format!(
            "{:?} {:?} remote={} local={} bytes={}/{}",
            task.status,
            task.direction,
            task.remote_path,
            task.local_path.display(),
            task.bytes_done(),
            task.total_length
        );
        if let Some(err) = &task.error {
            line.push_str(&format!(" error={err}"));
        }
        self.line(&line);
    }
}

/// Delivers every event to each inner sink.
pub struct FanoutSink(pub Vec<Arc<dyn ProgressSink>>);

impl ProgressSink for FanoutSink {
    fn on_bytes(&self, delta: u64) {
        for s in &self.0 {
            s.on_bytes(delta);
        }
    }

    fn on_status_changed(&self, task: &TransferTask) {
        for s in &self.0 {
            s.on_status_changed(task);
        }
    }
}
