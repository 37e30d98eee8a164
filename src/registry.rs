//! Server-side table of open files addressed by short numeric handles.
//!
//! Many worker connections share one open file through its handle id. The id
//! table has a single lock; block I/O only holds the per-handle file lock, so
//! different files proceed in parallel.
//!
//! At most one live handle exists per path. This is enforced by scanning the
//! table on acquire rather than by a path index, which is fine for the tens of
//! concurrently open files the protocol is used with.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::disk::BlockFile;
use crate::error::{Result, TransferError};
use crate::protocol::timeouts;

/// Random probes before falling back to a linear scan for a free id.
const MAX_ID_ATTEMPTS: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Debug)]
pub struct ServerFileHandle {
    id: u16,
    path: PathBuf,
    mode: AccessMode,
    file: BlockFile,
    last_active: Mutex<Instant>,
}

impl ServerFileHandle {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn length(&self) -> u64 {
        self.file.length()
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

#[derive(Debug)]
pub struct HandleRegistry {
    handles: Mutex<HashMap<u16, Arc<ServerFileHandle>>>,
    idle_timeout: Duration,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(timeouts::HANDLE_IDLE_SECS))
    }
}

impl HandleRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Return the live handle for `path`, or open the file and register a new
    /// one. Read mode requires the file to exist; write mode opens or creates
    /// it with `length` bytes. Returns the id and the file length.
    ///
    /// The file is opened without the table lock held, so a slow create or
    /// extend does not stall block lookups on other handles.
    pub fn acquire(&self, path: &Path, mode: AccessMode, length: u64) -> Result<(u16, u64)> {
        {
            let mut table = self.handles.lock();
            let (live, evicted) = self.live_handle(&mut table, path, mode, length)?;
            drop(table);
            if let Some(handle) = evicted {
                close(&handle, "evicted stale handle");
            }
            if let Some(found) = live {
                return Ok(found);
            }
        }

        let file = match mode {
            AccessMode::Read => BlockFile::open_read(path)?,
            AccessMode::Write => BlockFile::open_write(path, length)?,
        };

        let mut table = self.handles.lock();
        // another connection may have registered the path meanwhile
        let (live, evicted) = self.live_handle(&mut table, path, mode, length)?;
        if let Some(found) = live {
            drop(table);
            if let Some(handle) = evicted {
                close(&handle, "evicted stale handle");
            }
            return Ok(found);
        }
        let id = free_id(&table)?;
        let handle = Arc::new(ServerFileHandle {
            id,
            path: path.to_path_buf(),
            mode,
            file,
            last_active: Mutex::new(Instant::now()),
        });
        let length = handle.length();
        table.insert(id, handle);
        drop(table);
        if let Some(handle) = evicted {
            close(&handle, "evicted stale handle");
        }
        debug!(id, path = %path.display(), ?mode, length, "opened handle");
        Ok((id, length))
    }

    /// Check the table for a handle on `path`. A live compatible one is
    /// touched and returned; a stale one is removed and handed back for
    /// closing once the lock is gone.
    fn live_handle(
        &self,
        table: &mut HashMap<u16, Arc<ServerFileHandle>>,
        path: &Path,
        mode: AccessMode,
        length: u64,
    ) -> Result<(Option<(u16, u64)>, Option<Arc<ServerFileHandle>>)> {
        let Some(handle) = table.values().find(|h| h.path == path).map(Arc::clone) else {
            return Ok((None, None));
        };
        if handle.idle_for() > self.idle_timeout {
            info!(id = handle.id, path = %path.display(), "evicting stale handle");
            table.remove(&handle.id);
            return Ok((None, Some(handle)));
        }
        if handle.mode != mode {
            return Err(TransferError::HandleConflict(format!(
                "{} is open for {:?}",
                path.display(),
                handle.mode
            )));
        }
        if mode == AccessMode::Write && handle.length() != length {
            return Err(TransferError::HandleConflict(format!(
                "{} is open for writing with length {}",
                path.display(),
                handle.length()
            )));
        }
        handle.touch();
        Ok((Some((handle.id, handle.length())), None))
    }

    fn lookup(&self, id: u16, mode: AccessMode) -> Result<Arc<ServerFileHandle>> {
        let table = self.handles.lock();
        match table.get(&id) {
            // A handle id reused in the other mode is not the file the caller holds
            Some(h) if h.mode == mode => Ok(Arc::clone(h)),
            _ => Err(TransferError::HandleNotFound(id)),
        }
    }

    pub fn touch(&self, id: u16) -> Result<()> {
        let table = self.handles.lock();
        let handle = table.get(&id).ok_or(TransferError::HandleNotFound(id))?;
        handle.touch();
        Ok(())
    }

    pub fn read_block(&self, id: u16, index: u64, block_size: u64) -> Result<Vec<u8>> {
        let handle = self.lookup(id, AccessMode::Read)?;
        let data = handle.file.read_block(index, block_size)?;
        handle.touch();
        Ok(data)
    }

    pub fn write_block(&self, id: u16, index: u64, block_size: u64, data: &[u8]) -> Result<()> {
        let handle = self.lookup(id, AccessMode::Write)?;
        handle.file.write_block(index, block_size, data)?;
        handle.touch();
        Ok(())
    }

    /// Close and deregister. Returns false if the id was not live.
    pub fn release(&self, id: u16) -> bool {
        let removed = self.handles.lock().remove(&id);
        if let Some(handle) = &removed {
            close(handle, "released handle");
        }
        removed.is_some()
    }

    /// Drop every handle idle longer than the timeout. Returns how many went.
    pub fn evict_idle(&self) -> usize {
        let evicted: Vec<Arc<ServerFileHandle>> = {
            let mut table = self.handles.lock();
            let stale: Vec<u16> = table
                .values()
                .filter(|h| h.idle_for() > self.idle_timeout)
                .map(|h| h.id)
                .collect();
            stale.iter().filter_map(|id| table.remove(id)).collect()
        };
        for handle in &evicted {
            close(handle, "evicted idle handle");
        }
        evicted.len()
    }

    /// Forget every handle, as after a daemon restart.
    pub fn clear(&self) {
        self.handles.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

/// Flush a write handle before it is dropped from the table.
fn close(handle: &ServerFileHandle, what: &str) {
    if handle.mode == AccessMode::Write {
        if let Err(e) = handle.file.sync() {
            warn!(id = handle.id, error = %e, "sync on close failed");
        }
    }
    debug!(id = handle.id, path = %handle.path.display(), "{what}");
}

fn free_id(table: &HashMap<u16, Arc<ServerFileHandle>>) -> Result<u16> {
    let mut rng = rand::thread_rng();
    for _ in 0..MAX_ID_ATTEMPTS {
        let id: u16 = rng.gen();
        if !table.contains_key(&id) {
            return Ok(id);
        }
    }
    (0..=u16::MAX)
        .find(|id| !table.contains_key(id))
        .ok_or(TransferError::HandleSpaceExhausted)
}

/// Background sweeper for idle handles. Stops and joins on drop.
pub struct Reaper {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn(registry: Arc<HandleRegistry>, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("handle-reaper".into())
            .spawn(move || {
                let tick = Duration::from_millis(timeouts::POLL_MS).min(interval);
                let mut last = Instant::now();
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(tick);
                    if last.elapsed() >= interval {
                        let n = registry.evict_idle();
                        if n > 0 {
                            info!(evicted = n, "closed idle file handles");
                        }
                        last = Instant::now();
                    }
                }
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_with(dir: &TempDir, name: &str, len: usize) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, (0..len).map(|i| (i % 256) as u8).collect::<Vec<_>>()).unwrap();
        path
    }

    #[test]
    fn same_path_within_window_shares_id() {
        let dir = TempDir::new().unwrap();
        let path = file_with(&dir, "a.bin", 5000);
        let reg = HandleRegistry::default();
        let (a, len) = reg.acquire(&path, AccessMode::Read, 0).unwrap();
        let (b, _) = reg.acquire(&path, AccessMode::Read, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(len, 5000);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn stale_handle_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = file_with(&dir, "a.bin", 100);
        let reg = HandleRegistry::new(Duration::from_millis(30));
        let (first, _) = reg.acquire(&path, AccessMode::Read, 0).unwrap();
        thread::sleep(Duration::from_millis(80));
        // the stale entry is closed before a fresh one is registered
        let mut second = first;
        for _ in 0..8 {
            let (id, _) = reg.acquire(&path, AccessMode::Read, 0).unwrap();
            second = id;
            if second != first {
                break;
            }
            // a fresh random id collided with the old one; age it again
            thread::sleep(Duration::from_millis(80));
        }
        assert_ne!(first, second);
        assert_eq!(reg.len(), 1);
        assert!(matches!(
            reg.read_block(first, 0, 4096),
            Err(TransferError::HandleNotFound(_))
        ));
    }

    #[test]
    fn touch_keeps_handle_alive() {
        let dir = TempDir::new().unwrap();
        let path = file_with(&dir, "a.bin", 100);
        let reg = HandleRegistry::new(Duration::from_millis(60));
        let (id, _) = reg.acquire(&path, AccessMode::Read, 0).unwrap();
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(25));
            reg.touch(id).unwrap();
        }
        assert_eq!(reg.evict_idle(), 0);
        assert_eq!(reg.acquire(&path, AccessMode::Read, 0).unwrap().0, id);
    }

    #[test]
    fn read_requires_existing_file_write_creates() {
        let dir = TempDir::new().unwrap();
        let reg = HandleRegistry::default();
        let missing = dir.path().join("missing.bin");
        assert!(matches!(
            reg.acquire(&missing, AccessMode::Read, 0),
            Err(TransferError::Io(_))
        ));
        let (id, len) = reg.acquire(&missing, AccessMode::Write, 8192).unwrap();
        assert_eq!(len, 8192);
        reg.write_block(id, 1, 4096, &[1u8; 4096]).unwrap();
        assert!(reg.release(id));
        let on_disk = std::fs::read(&missing).unwrap();
        assert_eq!(on_disk.len(), 8192);
        assert!(on_disk[4096..].iter().all(|b| *b == 1));
    }

    #[test]
    fn mode_conflict_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = file_with(&dir, "a.bin", 100);
        let reg = HandleRegistry::default();
        reg.acquire(&path, AccessMode::Read, 0).unwrap();
        assert!(matches!(
            reg.acquire(&path, AccessMode::Write, 100),
            Err(TransferError::HandleConflict(_))
        ));
    }

    #[test]
    fn unknown_or_wrong_mode_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = file_with(&dir, "a.bin", 100);
        let reg = HandleRegistry::default();
        let (id, _) = reg.acquire(&path, AccessMode::Read, 0).unwrap();
        assert!(matches!(
            reg.write_block(id, 0, 100, &[0u8; 100]),
            Err(TransferError::HandleNotFound(_))
        ));
        let other = id.wrapping_add(1);
        assert!(matches!(
            reg.read_block(other, 0, 100),
            Err(TransferError::HandleNotFound(x)) if x == other
        ));
        assert!(matches!(reg.touch(other), Err(TransferError::HandleNotFound(_))));
    }

    #[test]
    fn io_failure_does_not_poison_registry() {
        let dir = TempDir::new().unwrap();
        let path = file_with(&dir, "a.bin", 100);
        let reg = HandleRegistry::default();
        let (id, _) = reg.acquire(&path, AccessMode::Read, 0).unwrap();
        assert!(matches!(reg.read_block(id, 5, 100), Err(TransferError::Io(_))));
        assert_eq!(reg.read_block(id, 0, 100).unwrap().len(), 100);
    }

    #[test]
    fn release_then_clear() {
        let dir = TempDir::new().unwrap();
        let a = file_with(&dir, "a.bin", 10);
        let b = file_with(&dir, "b.bin", 10);
        let reg = HandleRegistry::default();
        let (ia, _) = reg.acquire(&a, AccessMode::Read, 0).unwrap();
        reg.acquire(&b, AccessMode::Read, 0).unwrap();
        assert!(reg.release(ia));
        assert!(!reg.release(ia));
        assert_eq!(reg.len(), 1);
        reg.clear();
        assert!(reg.is_empty());
    }

    #[test]
    fn parallel_reads_on_shared_handle() {
        let dir = TempDir::new().unwrap();
        let path = file_with(&dir, "big.bin", 64 * 1024);
        let reg = Arc::new(HandleRegistry::default());
        let (id, _) = reg.acquire(&path, AccessMode::Read, 0).unwrap();
        let readers: Vec<_> = (0..4u64)
            .map(|t| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    for i in (t..16).step_by(4) {
                        let data = reg.read_block(id, i, 4096).unwrap();
                        assert_eq!(data[0], ((i * 4096) % 256) as u8);
                    }
                })
            })
            .collect();
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn reaper_evicts_in_background() {
        let dir = TempDir::new().unwrap();
        let path = file_with(&dir, "a.bin", 10);
        let reg = Arc::new(HandleRegistry::new(Duration::from_millis(20)));
        reg.acquire(&path, AccessMode::Read, 0).unwrap();
        let reaper = Reaper::spawn(Arc::clone(&reg), Duration::from_millis(30)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !reg.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        drop(reaper);
        assert!(reg.is_empty());
    }

    #[test]
    fn racing_acquires_of_one_path_share_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/new.bin");
        let reg = Arc::new(HandleRegistry::default());
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let ids: Vec<u16> = (0..8)
            .map(|_| {
                let (reg, path, barrier) = (Arc::clone(&reg), path.clone(), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    reg.acquire(&path, AccessMode::Write, 1 << 20).unwrap().0
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(reg.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1 << 20);
    }

    #[test]
    fn idle_write_handle_is_flushed_on_eviction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let reg = HandleRegistry::new(Duration::from_millis(20));
        let (id, _) = reg.acquire(&path, AccessMode::Write, 8192).unwrap();
        reg.write_block(id, 0, 4096, &[7u8; 4096]).unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(reg.evict_idle(), 1);
        assert!(reg.is_empty());
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 8192);
        assert!(on_disk[..4096].iter().all(|b| *b == 7));
    }

    #[test]
    fn ids_stay_unique_across_many_files() {
        let dir = TempDir::new().unwrap();
        let reg = HandleRegistry::default();
        let mut ids = std::collections::HashSet::new();
        for n in 0..200 {
            let path = file_with(&dir, &format!("f{n}"), 1);
            let (id, _) = reg.acquire(&path, AccessMode::Read, 0).unwrap();
            assert!(ids.insert(id));
        }
    }
}
