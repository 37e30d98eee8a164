//! Parallel block transfer for one file at a time.
//!
//! Each engaged worker loops: claim an index, make sure it has a live
//! session, move the block, report it. Failures are sorted by kind:
//!
//! * connection loss returns the index to the allocator, drops the session
//!   and reconnects once the shared [`ReachabilityProbe`] says the server is
//!   back;
//! * a stale handle id goes through [`HandleSlot::reacquire`], which makes
//!   sure only one worker asks the server for a fresh id per staleness event;
//! * anything else fails the file. The other workers see the failure on their
//!   next loop check and stop claiming work.
//!
//! Pausing sets a stop flag checked at the same point. Claimed but unfinished
//! blocks are dropped in memory; the low-water mark never moves backwards.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::allocator::PacketIndexAllocator;
use crate::disk::BlockFile;
use crate::error::{Result, TransferError};
use crate::logger::ProgressSink;
use crate::net::{Connector, RemoteSession};
use crate::pool::{Job, WorkerPool};
use crate::protocol::{parallelism_degree, timeouts};
use crate::resume::ResumeStore;
use crate::task::{Direction, TransferStatus, TransferTask};

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub pool_size: usize,
    /// Delays between reachability probes; the last one repeats.
    pub retry_schedule: Vec<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pool_size: 16,
            retry_schedule: timeouts::RETRY_SCHEDULE_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

/// Sleep up to `d`, waking early if `stop` is set. Returns true if stopped.
fn sleep_unless_stopped(d: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + d;
    let tick = Duration::from_millis(timeouts::POLL_MS);
    loop {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(tick.min(deadline - now));
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    running: bool,
    generation: u64,
}

/// Shared "wait until the server answers" gate. One worker probes while the
/// rest wait for it to finish.
#[derive(Debug)]
pub struct ReachabilityProbe {
    state: Mutex<ProbeState>,
    finished: Condvar,
    schedule: Vec<Duration>,
}

impl ReachabilityProbe {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self {
            state: Mutex::new(ProbeState::default()),
            finished: Condvar::new(),
            schedule,
        }
    }

    fn delay(&self, attempt: usize) -> Duration {
        match self.schedule.len() {
            0 => Duration::from_secs(1),
            n => self.schedule[attempt.min(n - 1)],
        }
    }

    /// Block until a heartbeat succeeds, or `stop` is set.
    pub fn wait_until_reachable<C: Connector>(&self, connector: &C, stop: &AtomicBool) -> Result<()> {
        let mut st = self.state.lock();
        if st.running {
            let seen = st.generation;
            while st.running && st.generation == seen {
                if stop.load(Ordering::Relaxed) {
                    return Err(TransferError::Cancelled);
                }
                self.finished
                    .wait_for(&mut st, Duration::from_millis(timeouts::POLL_MS));
            }
            return Ok(());
        }
        st.running = true;
        drop(st);

        let result = self.probe(connector, stop);

        let mut st = self.state.lock();
        st.running = false;
        st.generation += 1;
        self.finished.notify_all();
        result
    }

    fn probe<C: Connector>(&self, connector: &C, stop: &AtomicBool) -> Result<()> {
        let mut attempt = 0usize;
        loop {
            if stop.load(Ordering::Relaxed) {
                return Err(TransferError::Cancelled);
            }
            match connector.connect().and_then(|mut s| s.heartbeat()) {
                Ok(()) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "server reachable again");
                    }
                    return Ok(());
                }
                // Anything but a connection failure means the server answered
                Err(e) if !e.is_connection() => return Ok(()),
                Err(e) => {
                    let delay = self.delay(attempt);
                    warn!(error = %e, retry_in = ?delay, "server unreachable");
                    if sleep_unless_stopped(delay, stop) {
                        return Err(TransferError::Cancelled);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug)]
struct SlotState {
    fsid: u16,
    generation: u64,
}

/// The server handle id currently used for one file, shared by its workers.
#[derive(Debug)]
pub struct HandleSlot {
    state: Mutex<SlotState>,
    direction: Direction,
    remote_path: String,
    length: u64,
}

impl HandleSlot {
    pub fn new(fsid: u16, direction: Direction, remote_path: &str, length: u64) -> Self {
        Self {
            state: Mutex::new(SlotState {
                fsid,
                generation: 0,
            }),
            direction,
            remote_path: remote_path.to_string(),
            length,
        }
    }

    /// Current id and its generation. Blocks while a re-acquisition is in flight.
    pub fn current(&self) -> (u16, u64) {
        let st = self.state.lock();
        (st.fsid, st.generation)
    }

    pub fn fsid(&self) -> u16 {
        self.state.lock().fsid
    }

    /// Replace a stale id. `seen_generation` is the generation the caller
    /// used when it got `HandleNotFound`; if another worker already replaced
    /// that id, the fresh one is returned without contacting the server.
    pub fn reacquire<S: RemoteSession + ?Sized>(
        &self,
        session: &mut S,
        seen_generation: u64,
    ) -> Result<u16> {
        let mut st = self.state.lock();
        if st.generation != seen_generation {
            return Ok(st.fsid);
        }
        let grant = session.open_handle(self.direction, &self.remote_path, self.length)?;
        if self.direction == Direction::Download && grant.length != self.length {
            return Err(TransferError::RemoteIo(format!(
                "{} changed size during transfer ({} -> {})",
                self.remote_path, self.length, grant.length
            )));
        }
        info!(old = st.fsid, new = grant.fsid, path = %self.remote_path, "re-acquired file handle");
        st.fsid = grant.fsid;
        st.generation += 1;
        Ok(st.fsid)
    }
}

/// Cloneable pause switch, e.g. for a Ctrl-C handler.
#[derive(Clone, Debug)]
pub struct PauseHandle(Arc<AtomicBool>);

impl PauseHandle {
    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State shared by the workers of one file.
struct FileRun<C: Connector> {
    task: Mutex<TransferTask>,
    allocator: PacketIndexAllocator,
    handle: Arc<HandleSlot>,
    local: BlockFile,
    direction: Direction,
    block_size: u64,
    failure: Mutex<Option<TransferError>>,
    failed: AtomicBool,
    bytes: AtomicU64,
    journal: Option<Arc<ResumeStore>>,
    connector: Arc<C>,
    probe: Arc<ReachabilityProbe>,
    stop: Arc<AtomicBool>,
    sink: Arc<dyn ProgressSink>,
}

impl<C: Connector> FileRun<C> {
    fn should_stop(&self) -> bool {
        self.failed.load(Ordering::SeqCst) || self.stop.load(Ordering::SeqCst)
    }

    fn fail(&self, err: TransferError) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            warn!(error = %err, "transfer failed; stopping workers");
            *slot = Some(err);
        }
        self.task.lock().status = TransferStatus::Failed;
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Build a session, probing first when the previous one was lost.
    fn connect(&self, after_loss: bool) -> Result<C::Session> {
        let mut probe_first = after_loss;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Err(TransferError::Cancelled);
            }
            if probe_first {
                self.probe.wait_until_reachable(&*self.connector, &self.stop)?;
            }
            match self.connector.connect() {
                Ok(s) => return Ok(s),
                Err(e) if e.is_connection() => {
                    debug!(error = %e, "connect failed");
                    probe_first = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn transfer_block(&self, session: &mut C::Session, fsid: u16, index: u64) -> Result<u64> {
        let expected = self.local.block_len(index, self.block_size);
        if self.direction == Direction::Upload {
            let data = self.local.read_block(index, self.block_size)?;
            session.write_block(fsid, index, self.block_size, &data)?;
            return Ok(expected);
        }
        let data = session.read_block(fsid, index, self.block_size)?;
        if data.len() as u64 != expected {
            return Err(TransferError::ProtocolViolation(format!(
                "block {index}: expected {expected} bytes, got {}",
                data.len()
            )));
        }
        self.local.write_block(index, self.block_size, &data)?;
        Ok(expected)
    }

    fn block_done(&self, index: u64, bytes: u64) {
        let mark = self.allocator.complete(index);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.sink.on_bytes(bytes);
        let mut task = self.task.lock();
        task.low_water_mark = task.low_water_mark.max(mark);
        // held across the save so checkpoints reach the store in order
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_progress(&task, bytes) {
                warn!(error = %e, "failed to save resume checkpoint");
            }
        }
    }

    fn work(&self, worker: usize, conn: &mut Option<C::Session>) {
        let mut lost = false;
        while !self.should_stop() {
            let Some(index) = self.allocator.next() else {
                break;
            };
            if conn.is_none() {
                match self.connect(lost) {
                    Ok(s) => *conn = Some(s),
                    Err(TransferError::Cancelled) => {
                        self.allocator.release(index);
                        break;
                    }
                    Err(e) => {
                        self.allocator.release(index);
                        self.fail(e);
                        break;
                    }
                }
            }
            let Some(session) = conn.as_mut() else {
                self.allocator.release(index);
                continue;
            };
            lost = false;

            let (fsid, generation) = self.handle.current();
            match self.transfer_block(session, fsid, index) {
                Ok(n) => self.block_done(index, n),
                Err(TransferError::Connection(msg)) => {
                    debug!(worker, index, %msg, "connection lost; block returned");
                    self.allocator.release(index);
                    *conn = None;
                    lost = true;
                }
                Err(TransferError::HandleNotFound(_)) => {
                    self.allocator.release(index);
                    match self.handle.reacquire(session, generation) {
                        Ok(_) => {}
                        Err(e) if e.is_connection() => {
                            *conn = None;
                            lost = true;
                        }
                        Err(e) => {
                            if e.poisons_connection() {
                                *conn = None;
                            }
                            self.fail(e);
                            break;
                        }
                    }
                }
                Err(e) => {
                    self.allocator.release(index);
                    // the worker keeps its session for the next file
                    if e.poisons_connection() {
                        *conn = None;
                    }
                    self.fail(e);
                    break;
                }
            }
        }
    }
}

pub struct TransferEngine<C: Connector> {
    connector: Arc<C>,
    pool: WorkerPool<Option<C::Session>>,
    probe: Arc<ReachabilityProbe>,
    stop: Arc<AtomicBool>,
    sink: Arc<dyn ProgressSink>,
}

impl<C: Connector> TransferEngine<C> {
    pub fn new(connector: Arc<C>, options: EngineOptions, sink: Arc<dyn ProgressSink>) -> Result<Self> {
        let pool = WorkerPool::new(options.pool_size, "shuttle-worker", |_| None)?;
        Ok(Self {
            connector,
            pool,
            probe: Arc::new(ReachabilityProbe::new(options.retry_schedule)),
            stop: Arc::new(AtomicBool::new(false)),
            sink,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    pub fn sink(&self) -> &Arc<dyn ProgressSink> {
        &self.sink
    }

    pub fn pause_handle(&self) -> PauseHandle {
        PauseHandle(Arc::clone(&self.stop))
    }

    pub fn pause(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Clear a previous pause so the next transfer runs.
    pub fn resume(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Wait for the server through the shared probe; used by control traffic.
    pub fn wait_until_reachable(&self) -> Result<()> {
        self.probe.wait_until_reachable(&*self.connector, &self.stop)
    }

    /// Move every block of `task` not yet below its low-water mark, using
    /// `handle` as the server file handle and `local` as the local side.
    ///
    /// On return `task` holds the final status and checkpoint. Pausing yields
    /// `Err(Cancelled)` with status `Paused`.
    pub fn transfer_one(
        &self,
        task: &mut TransferTask,
        handle: Arc<HandleSlot>,
        local: BlockFile,
        journal: Option<Arc<ResumeStore>>,
    ) -> Result<()> {
        let total_blocks = task.total_blocks();
        task.status = TransferStatus::Transferring;
        task.error = None;
        self.sink.on_status_changed(task);

        let run = Arc::new(FileRun {
            task: Mutex::new(task.clone()),
            allocator: PacketIndexAllocator::resume(task.low_water_mark, total_blocks),
            handle,
            local,
            direction: task.direction,
            block_size: task.block_size,
            failure: Mutex::new(None),
            failed: AtomicBool::new(false),
            bytes: AtomicU64::new(0),
            journal: journal.clone(),
            connector: Arc::clone(&self.connector),
            probe: Arc::clone(&self.probe),
            stop: Arc::clone(&self.stop),
            sink: Arc::clone(&self.sink),
        });

        if !run.allocator.is_complete() {
            let degree = parallelism_degree(task.total_length, self.pool.size());
            debug!(path = %task.remote_path, degree, blocks = total_blocks, from = task.low_water_mark, "starting file");
            let worker_run = Arc::clone(&run);
            let job: Job<Option<C::Session>> =
                Arc::new(move |worker: usize, conn: &mut Option<C::Session>| {
                    worker_run.work(worker, conn)
                });
            self.pool.run(degree, job);
        }

        let mut finished = run.task.lock().clone();
        finished.low_water_mark = finished.low_water_mark.max(run.allocator.low_water_mark());
        let failure = run.failure.lock().take();
        let outcome = match failure {
            Some(err) => {
                finished.status = TransferStatus::Failed;
                finished.error = Some(err.to_string());
                Err(err)
            }
            None if run.allocator.is_complete() => match run.local.sync() {
                Ok(()) => {
                    finished.status = TransferStatus::Succeeded;
                    Ok(())
                }
                Err(e) => {
                    finished.status = TransferStatus::Failed;
                    finished.error = Some(e.to_string());
                    Err(TransferError::Io(e))
                }
            },
            None => {
                finished.status = TransferStatus::Paused;
                Err(TransferError::Cancelled)
            }
        };

        info!(
            path = %finished.remote_path,
            status = ?finished.status,
            bytes = run.bytes.load(Ordering::Relaxed),
            "file finished"
        );
        *task = finished;
        if let Some(journal) = &journal {
            journal.upsert(task);
            if let Err(e) = journal.save() {
                warn!(error = %e, "failed to save resume file");
            }
        }
        self.sink.on_status_changed(task);
        outcome
    }
}
