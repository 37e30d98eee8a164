//! Fixed set of long-lived worker threads with per-worker state.
//!
//! Each worker owns a value of type `S` (for the transfer engine, a cached
//! connection) that survives from one job to the next, so threads and their
//! sockets are reused across files instead of being rebuilt per file.
//!
//! [`WorkerPool::run`] hands the same job to the first `degree` workers
//! through their channels and blocks on a [`WaitGroup`] until every engaged
//! worker has returned.

use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Job run by each engaged worker: `(worker id, worker state)`.
pub type Job<S> = Arc<dyn Fn(usize, &mut S) + Send + Sync>;

/// Counts down engaged workers; `wait` returns when it reaches zero.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl WaitGroup {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new((Mutex::new(count), Condvar::new())),
        }
    }

    pub fn done(&self) {
        let (count, cv) = &*self.inner;
        let mut n = count.lock();
        *n = n.saturating_sub(1);
        if *n == 0 {
            cv.notify_all();
        }
    }

    pub fn wait(&self) {
        let (count, cv) = &*self.inner;
        let mut n = count.lock();
        while *n > 0 {
            cv.wait(&mut n);
        }
    }
}

// Signals done on every exit path
struct DoneGuard(WaitGroup);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

enum Message<S> {
    Run { job: Job<S>, done: WaitGroup },
    Terminate,
}

struct Worker<S> {
    id: usize,
    sender: Sender<Message<S>>,
    thread: Option<JoinHandle<()>>,
}

pub struct WorkerPool<S: Send + 'static> {
    workers: Vec<Worker<S>>,
}

impl<S: Send + 'static> WorkerPool<S> {
    /// Spawn `size` workers (at least one); `init` builds each worker's state.
    pub fn new<F>(size: usize, name: &str, init: F) -> std::io::Result<Self>
    where
        F: Fn(usize) -> S + Send + Sync + 'static,
    {
        let init = Arc::new(init);
        let mut workers = Vec::with_capacity(size.max(1));
        for id in 0..size.max(1) {
            let (sender, receiver) = mpsc::channel::<Message<S>>();
            let init = Arc::clone(&init);
            let thread = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || {
                    let mut state = init(id);
                    while let Ok(msg) = receiver.recv() {
                        match msg {
                            Message::Run { job, done } => {
                                let _guard = DoneGuard(done);
                                let ran = panic::catch_unwind(AssertUnwindSafe(|| {
                                    job(id, &mut state)
                                }));
                                if ran.is_err() {
                                    warn!(worker = id, "job panicked; resetting worker state");
                                    state = init(id);
                                }
                            }
                            Message::Terminate => break,
                        }
                    }
                    debug!(worker = id, "worker exiting");
                })?;
            workers.push(Worker {
                id,
                sender,
                thread: Some(thread),
            });
        }
        Ok(Self { workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run `job` on `degree` workers (clamped to the pool) and wait for all of them.
    pub fn run(&self, degree: usize, job: Job<S>) {
        let n = degree.clamp(1, self.workers.len());
        let done = WaitGroup::new(n);
        for worker in &self.workers[..n] {
            let msg = Message::Run {
                job: Arc::clone(&job),
                done: done.clone(),
            };
            if worker.sender.send(msg).is_err() {
                warn!(worker = worker.id, "worker is gone; skipping");
                done.done();
            }
        }
        done.wait();
    }

    /// Stop every worker and join its thread.
    pub fn finish(&mut self) {
        for worker in &self.workers {
            let _ = worker.sender.send(Message::Terminate);
        }
        for worker in &mut self.workers {
            if let Some(t) = worker.thread.take() {
                if t.join().is_err() {
                    warn!(worker = worker.id, "worker panicked");
                }
            }
        }
    }
}

impl<S: Send + 'static> Drop for WorkerPool<S> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn run_blocks_until_all_engaged_workers_finish() {
        let pool = WorkerPool::new(4, "t", |_| ()).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finished);
        pool.run(
            4,
            Arc::new(move |id: usize, _: &mut ()| {
                thread::sleep(Duration::from_millis(10 * id as u64));
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn degree_is_clamped_to_pool() {
        let pool = WorkerPool::new(3, "t", |_| ()).unwrap();
        let ids = Arc::new(Mutex::new(HashSet::new()));
        let seen = Arc::clone(&ids);
        pool.run(16, Arc::new(move |id: usize, _: &mut ()| {
            seen.lock().insert(id);
        }));
        assert_eq!(ids.lock().len(), 3);

        ids.lock().clear();
        let seen = Arc::clone(&ids);
        pool.run(1, Arc::new(move |id: usize, _: &mut ()| {
            seen.lock().insert(id);
        }));
        assert_eq!(*ids.lock(), HashSet::from([0]));
    }

    #[test]
    fn worker_state_persists_across_jobs() {
        let pool = WorkerPool::new(2, "t", |id| id * 100).unwrap();
        for _ in 0..3 {
            pool.run(2, Arc::new(|_: usize, s: &mut usize| *s += 1));
        }
        let out = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&out);
        pool.run(2, Arc::new(move |_: usize, s: &mut usize| o.lock().push(*s)));
        let mut got = out.lock().clone();
        got.sort_unstable();
        assert_eq!(got, vec![3, 103]);
    }

    #[test]
    fn panicking_job_resets_worker() {
        let pool = WorkerPool::new(2, "t", |_| 0usize).unwrap();
        pool.run(
            2,
            Arc::new(|id: usize, s: &mut usize| {
                *s = 7;
                if id == 1 {
                    panic!("boom");
                }
            }),
        );
        let out = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&out);
        pool.run(2, Arc::new(move |id: usize, s: &mut usize| o.lock().push((id, *s))));
        let mut got = out.lock().clone();
        got.sort_unstable();
        assert_eq!(got, vec![(0, 7), (1, 0)]);
    }

    #[test]
    fn finish_joins_threads() {
        let mut pool = WorkerPool::new(3, "t", |_| ()).unwrap();
        pool.finish();
        assert!(pool.workers.iter().all(|w| w.thread.is_none()));
    }
}
