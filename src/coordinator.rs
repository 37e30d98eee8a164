//! Turns push/pull requests into per-file tasks and runs them one by one.
//!
//! For each file the coordinator opens the server handle over its own control
//! session, prepares the local side, hands the file to the engine and
//! releases the handle afterwards. Tasks are written to the resume store
//! before any of them starts, so an interrupted run can be picked up with
//! [`Coordinator::resume_pending`].

use anyhow::Context;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::disk::BlockFile;
use crate::engine::{HandleSlot, PauseHandle, TransferEngine};
use crate::error::{Result, TransferError};
use crate::fs_enum::{enumerate_tree, FileFilter};
use crate::message::HandleGrant;
use crate::net::{files_first, Connector, RemoteSession};
use crate::resume::ResumeStore;
use crate::task::{Direction, TransferStatus, TransferTask};
use crate::url::join_remote;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Paused, or never started because of a pause.
    pub paused: usize,
    pub bytes: u64,
}

impl TransferSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.paused == 0
    }
}

pub struct Coordinator<C: Connector> {
    engine: TransferEngine<C>,
    control: Mutex<Option<C::Session>>,
    block_size: u64,
    filter: FileFilter,
    journal: Option<Arc<ResumeStore>>,
}

impl<C: Connector> Coordinator<C> {
    pub fn new(engine: TransferEngine<C>, block_size: u64, journal: Option<Arc<ResumeStore>>) -> Self {
        Self {
            engine,
            control: Mutex::new(None),
            block_size,
            filter: FileFilter::default(),
            journal,
        }
    }

    pub fn with_filter(mut self, filter: FileFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn engine(&self) -> &TransferEngine<C> {
        &self.engine
    }

    pub fn pause_handle(&self) -> PauseHandle {
        self.engine.pause_handle()
    }

    pub fn pause(&self) {
        self.engine.pause();
    }

    pub fn resume(&self) {
        self.engine.resume();
    }

    /// Run `f` on the control session, reconnecting through the engine's
    /// reachability probe whenever the connection drops.
    fn with_control<T>(&self, mut f: impl FnMut(&mut C::Session) -> Result<T>) -> Result<T> {
        let mut control = self.control.lock();
        loop {
            if control.is_none() {
                match self.engine.connector().connect() {
                    Ok(s) => *control = Some(s),
                    Err(e) if e.is_connection() => {
                        debug!(error = %e, "control connection failed");
                        self.engine.wait_until_reachable()?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let Some(session) = control.as_mut() else {
                continue;
            };
            match f(session) {
                Err(e) if e.is_connection() => {
                    debug!(error = %e, "control connection lost");
                    *control = None;
                    self.engine.wait_until_reachable()?;
                }
                Err(e) => {
                    if e.poisons_connection() {
                        warn!(error = %e, "dropping control connection");
                        *control = None;
                    }
                    return Err(e);
                }
                ok => return ok,
            }
        }
    }

    /// Release without waiting for an unreachable server; its reaper will
    /// reclaim the handle anyway.
    fn release_quietly(&self, fsid: u16) {
        let mut control = self.control.lock();
        if control.is_none() {
            match self.engine.connector().connect() {
                Ok(s) => *control = Some(s),
                Err(e) => {
                    warn!(fsid, error = %e, "could not release file handle");
                    return;
                }
            }
        }
        if let Some(session) = control.as_mut() {
            if let Err(e) = session.release_handle(fsid) {
                warn!(fsid, error = %e, "could not release file handle");
                if e.poisons_connection() {
                    *control = None;
                }
            }
        }
    }

    /// Drop the control session.
    pub fn disconnect(&self) {
        self.control.lock().take();
    }

    /// Tasks for sending `local` (file or tree) to `remote`. Empty
    /// directories of a tree are created on the server here.
    pub fn plan_upload(&self, local: &Path, remote: &str) -> anyhow::Result<Vec<TransferTask>> {
        let tree = enumerate_tree(local, &self.filter)?;
        if local.is_file() {
            let target = match self.with_control(|s| s.list_directory(remote)) {
                Ok(listing) if listing.is_dir => {
                    let name = tree.files.first().map(|f| f.relative.clone()).unwrap_or_default();
                    join_remote(remote, &name)
                }
                _ => remote.to_string(),
            };
            let tasks = tree
                .files
                .into_iter()
                .map(|f| TransferTask::new(Direction::Upload, target.clone(), f.path, f.size, self.block_size))
                .collect();
            return Ok(tasks);
        }
        let mut dirs: Vec<String> = tree
            .empty_dirs
            .iter()
            .map(|rel| join_remote(remote, rel))
            .collect();
        if tree.files.is_empty() && dirs.is_empty() {
            dirs.push(remote.to_string());
        }
        for dir in &dirs {
            self.with_control(|s| s.create_directory(dir))
                .with_context(|| format!("create remote directory {dir}"))?;
        }
        debug!(count = dirs.len(), "remote directories created");
        Ok(tree
            .files
            .into_iter()
            .map(|f| {
                TransferTask::new(
                    Direction::Upload,
                    join_remote(remote, &f.relative),
                    f.path,
                    f.size,
                    self.block_size,
                )
            })
            .collect())
    }

    /// Tasks for fetching `remote` (file or tree) into `local`. Local
    /// directories, empty ones included, are created here.
    pub fn plan_download(&self, remote: &str, local: &Path) -> anyhow::Result<Vec<TransferTask>> {
        let root = self
            .with_control(|s| s.list_directory(remote))
            .with_context(|| format!("list {remote}"))?;
        if !root.is_dir {
            return Ok(vec![TransferTask::new(
                Direction::Download,
                remote,
                local_target(local, remote),
                root.length,
                self.block_size,
            )]);
        }

        let mut tasks = Vec::new();
        let mut pending = vec![(remote.to_string(), local.to_path_buf(), root.entries)];
        while let Some((dir, local_dir, mut entries)) = pending.pop() {
            std::fs::create_dir_all(&local_dir)
                .with_context(|| format!("create {}", local_dir.display()))?;
            files_first(&mut entries);
            for entry in entries {
                let remote_path = join_remote(&dir, &entry.name);
                let local_path = local_dir.join(&entry.name);
                if entry.is_dir {
                    let listing = self
                        .with_control(|s| s.list_directory(&remote_path))
                        .with_context(|| format!("list {remote_path}"))?;
                    pending.push((remote_path, local_path, listing.entries));
                } else {
                    tasks.push(TransferTask::new(
                        Direction::Download,
                        remote_path,
                        local_path,
                        entry.length,
                        self.block_size,
                    ));
                }
            }
        }
        Ok(tasks)
    }

    pub fn upload(&self, local: &Path, remote: &str) -> anyhow::Result<TransferSummary> {
        let tasks = self.plan_upload(local, remote)?;
        info!(files = tasks.len(), from = %local.display(), to = remote, "upload planned");
        self.run_tasks(tasks)
    }

    pub fn download(&self, remote: &str, local: &Path) -> anyhow::Result<TransferSummary> {
        let tasks = self.plan_download(remote, local)?;
        info!(files = tasks.len(), from = remote, to = %local.display(), "download planned");
        self.run_tasks(tasks)
    }

    /// Continue everything the resume store has not finished.
    pub fn resume_pending(&self) -> anyhow::Result<TransferSummary> {
        let Some(journal) = &self.journal else {
            anyhow::bail!("no resume file configured");
        };
        let tasks = journal.pending();
        info!(files = tasks.len(), path = %journal.path().display(), "resuming");
        self.run_tasks(tasks)
    }

    /// Run tasks in order. A pause stops the queue; a failed file does not.
    pub fn run_tasks(&self, mut tasks: Vec<TransferTask>) -> anyhow::Result<TransferSummary> {
        if let Some(journal) = &self.journal {
            for task in &tasks {
                journal.upsert(task);
            }
            journal.save()?;
        }

        let mut summary = TransferSummary::default();
        for task in tasks.iter_mut() {
            if self.engine.is_paused() {
                break;
            }
            match self.run_task(task) {
                Ok(()) => {
                    summary.succeeded += 1;
                    summary.bytes += task.total_length;
                }
                Err(TransferError::Cancelled) => {}
                Err(e) => {
                    warn!(remote = %task.remote_path, error = %e, "file failed");
                    summary.failed += 1;
                }
            }
        }
        summary.paused = tasks.len() - summary.succeeded - summary.failed;
        Ok(summary)
    }

    /// Prepare both sides of one file and transfer it.
    pub fn run_task(&self, task: &mut TransferTask) -> Result<()> {
        match self.start_task(task) {
            Ok((slot, local)) => {
                let result = self
                    .engine
                    .transfer_one(task, Arc::clone(&slot), local, self.journal.clone());
                self.release_quietly(slot.fsid());
                result
            }
            Err(TransferError::Cancelled) => {
                task.status = TransferStatus::Paused;
                self.record(task);
                Err(TransferError::Cancelled)
            }
            Err(e) => {
                task.status = TransferStatus::Failed;
                task.error = Some(e.to_string());
                self.record(task);
                Err(e)
            }
        }
    }

    fn start_task(&self, task: &mut TransferTask) -> Result<(Arc<HandleSlot>, BlockFile)> {
        let (grant, local) = match task.direction {
            Direction::Download => {
                let grant: HandleGrant = self
                    .with_control(|s| s.open_handle(Direction::Download, &task.remote_path, 0))?;
                if grant.length != task.total_length
                    || (task.low_water_mark > 0 && !task.local_path.exists())
                {
                    debug!(path = %task.remote_path, old = task.total_length, new = grant.length, "restarting from zero");
                    task.restart(grant.length);
                }
                let local = BlockFile::open_write(&task.local_path, task.total_length)?;
                (grant, local)
            }
            Direction::Upload => {
                let local = BlockFile::open_read(&task.local_path)?;
                if local.length() != task.total_length {
                    task.restart(local.length());
                }
                let length = task.total_length;
                let grant = self
                    .with_control(|s| s.open_handle(Direction::Upload, &task.remote_path, length))?;
                (grant, local)
            }
        };
        let slot = HandleSlot::new(grant.fsid, task.direction, &task.remote_path, task.total_length);
        Ok((Arc::new(slot), local))
    }

    fn record(&self, task: &TransferTask) {
        self.engine.sink().on_status_changed(task);
        if let Some(journal) = &self.journal {
            journal.upsert(task);
            if let Err(e) = journal.save() {
                warn!(error = %e, "failed to save resume file");
            }
        }
    }
}

/// Local destination for a pull: inside `local` when it is a directory.
pub fn local_target(local: &Path, remote: &str) -> PathBuf {
    if local.is_dir() {
        let name = remote.trim_end_matches('/').rsplit('/').next().unwrap_or(remote);
        local.join(name)
    } else {
        local.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::logger::NoopSink;
    use crate::message::DirectoryListing;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Remote {
        connects: AtomicUsize,
        garble_next: AtomicBool,
    }

    struct Link(Arc<Remote>);

    /// Once garbled, a session answers every call with a frame error.
    struct Session(Arc<Remote>, bool);

    impl Connector for Link {
        type Session = Session;
        fn connect(&self) -> Result<Session> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Session(Arc::clone(&self.0), false))
        }
    }

    impl RemoteSession for Session {
        fn open_handle(&mut self, _: Direction, _: &str, _: u64) -> Result<HandleGrant> {
            Err(TransferError::ProtocolViolation("unused".into()))
        }
        fn read_block(&mut self, _: u16, _: u64, _: u64) -> Result<Vec<u8>> {
            Err(TransferError::ProtocolViolation("unused".into()))
        }
        fn write_block(&mut self, _: u16, _: u64, _: u64, _: &[u8]) -> Result<()> {
            Err(TransferError::ProtocolViolation("unused".into()))
        }
        fn release_handle(&mut self, _: u16) -> Result<()> {
            Ok(())
        }
        fn heartbeat(&mut self) -> Result<()> {
            Ok(())
        }
        fn list_directory(&mut self, _: &str) -> Result<DirectoryListing> {
            if self.0.garble_next.swap(false, Ordering::SeqCst) {
                self.1 = true;
            }
            if self.1 {
                return Err(TransferError::Frame("crc mismatch".into()));
            }
            Ok(DirectoryListing {
                is_dir: false,
                length: 5,
                entries: Vec::new(),
            })
        }
        fn create_directory(&mut self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn garbled_control_session_is_replaced() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(Remote::default());
        remote.garble_next.store(true, Ordering::SeqCst);
        let engine = TransferEngine::new(
            Arc::new(Link(Arc::clone(&remote))),
            EngineOptions {
                pool_size: 1,
                retry_schedule: vec![Duration::from_millis(5)],
            },
            Arc::new(NoopSink),
        )
        .unwrap();
        let coordinator = Coordinator::new(engine, 4096, None);

        assert!(coordinator.plan_download("/f", dir.path()).is_err());
        let tasks = coordinator.plan_download("/f", dir.path()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].total_length, 5);
        assert_eq!(remote.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pull_target_goes_inside_existing_directory() {
        let dir = TempDir::new().unwrap();
        assert_eq!(local_target(dir.path(), "/data/a.bin"), dir.path().join("a.bin"));
        let file = dir.path().join("renamed.bin");
        assert_eq!(local_target(&file, "/data/a.bin"), file);
    }

    #[test]
    fn summary_is_clean_only_without_leftovers() {
        let mut s = TransferSummary {
            succeeded: 3,
            ..Default::default()
        };
        assert!(s.is_clean());
        s.paused = 1;
        assert!(!s.is_clean());
    }
}
