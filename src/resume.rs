//! Persisted transfer queue for crash and pause recovery.
//!
//! All tasks of a session live in one JSON document that is rewritten
//! atomically (temp file in the same directory, then rename). Progress saves
//! are gated by elapsed time and by bytes moved since the last save, so a
//! crash loses at most one window of progress.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::protocol::timeouts;
use crate::task::{TransferStatus, TransferTask};

#[derive(Clone, Copy, Debug)]
pub struct SavePolicy {
    pub interval: Duration,
    pub bytes: u64,
}

impl Default for SavePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(timeouts::CHECKPOINT_INTERVAL_MS),
            bytes: timeouts::CHECKPOINT_BYTES,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ResumeFile {
    saved_at: Option<DateTime<Utc>>,
    tasks: Vec<TransferTask>,
}

struct StoreState {
    tasks: Vec<TransferTask>,
    last_save: Instant,
    unsaved_bytes: u64,
}

pub struct ResumeStore {
    path: PathBuf,
    policy: SavePolicy,
    state: Mutex<StoreState>,
}

impl ResumeStore {
    /// Load the queue at `path`, or start empty if the file does not exist.
    pub fn open(path: &Path, policy: SavePolicy) -> Result<Self> {
        let tasks = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read resume file {}", path.display()))?;
            let file: ResumeFile = serde_json::from_str(&data)
                .with_context(|| format!("parse resume file {}", path.display()))?;
            file.tasks
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            policy,
            state: Mutex::new(StoreState {
                tasks,
                last_save: Instant::now(),
                unsaved_bytes: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tasks(&self) -> Vec<TransferTask> {
        self.state.lock().tasks.clone()
    }

    /// Tasks that still have work to do.
    pub fn pending(&self) -> Vec<TransferTask> {
        self.state
            .lock()
            .tasks
            .iter()
            .filter(|t| t.status != TransferStatus::Succeeded)
            .cloned()
            .collect()
    }

    /// Insert or replace by task id, in memory only.
    pub fn upsert(&self, task: &TransferTask) {
        upsert_into(&mut self.state.lock().tasks, task);
    }

    /// Record progress and save if the time or byte threshold has passed.
    /// Returns whether a save happened.
    pub fn record_progress(&self, task: &TransferTask, bytes: u64) -> Result<bool> {
        let mut st = self.state.lock();
        upsert_into(&mut st.tasks, task);
        st.unsaved_bytes += bytes;
        if st.last_save.elapsed() < self.policy.interval && st.unsaved_bytes < self.policy.bytes {
            return Ok(false);
        }
        self.write(&mut st)?;
        Ok(true)
    }

    pub fn save(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.write(&mut st)
    }

    /// Forget finished work and save.
    pub fn prune_succeeded(&self) -> Result<()> {
        let mut st = self.state.lock();
        st.tasks.retain(|t| t.status != TransferStatus::Succeeded);
        self.write(&mut st)
    }

    fn write(&self, st: &mut StoreState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create resume directory {}", dir.display()))?;
        let doc = ResumeFile {
            saved_at: Some(Utc::now()),
            tasks: st.tasks.clone(),
        };
        let data = serde_json::to_vec_pretty(&doc)?;
        // atomic write
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .with_context(|| format!("replace resume file {}", self.path.display()))?;
        st.last_save = Instant::now();
        st.unsaved_bytes = 0;
        Ok(())
    }
}

fn upsert_into(tasks: &mut Vec<TransferTask>, task: &TransferTask) {
    match tasks.iter_mut().find(|t| t.id == task.id) {
        Some(slot) => *slot = task.clone(),
        None => tasks.push(task.clone()),
    }
}
