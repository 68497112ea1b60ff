// Copyright 2020 Joyent, Inc.

//! Ticketed job tracking for non-blocking submissions: the job store, the
//! FIFO work queue, and the worker pool that drains it.
//!
//! Locking is deliberately fine-grained. The store lock guards only the
//! ticket map, the queue lock guards only the FIFO and the pool's running
//! flag, and every job carries its own lock and condition variable for
//! completion signalling. No thread ever holds more than one of the three
//! at a time, and workers never hold the queue lock while running a kernel.

use std::collections::{HashMap, VecDeque};
use std::io::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use slog::{debug, error, o, Logger};

use crate::compute;
use crate::protocol::{GetResponse, OpArgs, ResultValue, Status};

/// Mints process-unique 64-bit tickets: a microsecond timestamp shifted
/// left 16 bits combined with a wrapping sequence counter. Two mints can
/// only collide if the counter wraps within a single microsecond.
struct TicketSource {
    seq: AtomicU16,
}

impl TicketSource {
    fn new() -> TicketSource {
        TicketSource {
            seq: AtomicU16::new(0),
        }
    }

    fn mint(&self) -> u64 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let now_micros =
            now.as_secs() * 1_000_000 + u64::from(now.subsec_micros());
        let seq = u64::from(self.seq.fetch_add(1, Ordering::Relaxed));

        (now_micros << 16) | seq
    }
}

struct JobState {
    status: Status,
    result: Option<ResultValue>,
    done: bool,
}

/// One asynchronous request, from enqueue to single-delivery retrieval.
pub struct Job {
    /// The ticket under which the job is registered in the store.
    pub id: u64,
    /// The submitted operation.
    pub request: OpArgs,
    state: Mutex<JobState>,
    done_cv: Condvar,
}

impl Job {
    fn new(id: u64, request: OpArgs) -> Job {
        Job {
            id,
            request,
            state: Mutex::new(JobState {
                status: Status::NotFinished,
                result: None,
                done: false,
            }),
            done_cv: Condvar::new(),
        }
    }

    /// Publish the terminal status and result of this job and wake every
    /// waiter. `done` transitions at most once; a second publication is
    /// ignored.
    pub fn complete(&self, status: Status, result: Option<ResultValue>) {
        let mut state = self.state.lock().unwrap();
        if state.done {
            return;
        }
        state.status = status;
        state.result = result;
        state.done = true;
        self.done_cv.notify_all();
    }

    fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// Block until the job completes or the deadline passes. Returns true
    /// if the job is done. Spurious wakeups re-check `done`.
    fn wait_until_done(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        while !state.done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = self
                .done_cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        true
    }

    fn take_terminal(&self) -> (Status, Option<ResultValue>) {
        let mut state = self.state.lock().unwrap();
        (state.status, state.result.take())
    }
}

/// The mapping from ticket to job. Jobs are inserted by `enqueue` and
/// removed by the first retrieval that observes a terminal status.
pub struct JobStore {
    jobs: Mutex<HashMap<u64, Arc<Job>>>,
    tickets: TicketSource,
}

impl Default for JobStore {
    fn default() -> Self {
        JobStore::new()
    }
}

impl JobStore {
    pub fn new() -> JobStore {
        JobStore {
            jobs: Mutex::new(HashMap::new()),
            tickets: TicketSource::new(),
        }
    }

    /// Mint a ticket and register a new `NOT_FINISHED` job for the given
    /// request.
    pub fn insert(&self, request: OpArgs) -> Arc<Job> {
        let id = self.tickets.mint();
        let job = Arc::new(Job::new(id, request));
        self.jobs.lock().unwrap().insert(id, Arc::clone(&job));
        job
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every job. Called on deinit after the pool has quiesced.
    pub fn clear(&self) {
        self.jobs.lock().unwrap().clear();
    }

    /// Retrieve the result for a ticket without waiting. A finished job is
    /// removed from the store by this call; a pending job is retained.
    pub fn get_nowait(&self, ticket: u64) -> GetResponse {
        match self.lookup(ticket) {
            None => GetResponse::error(Status::ErrorInvalidInput),
            Some(job) => {
                if !job.is_done() {
                    return GetResponse::error(Status::NotFinished);
                }
                self.consume(&job)
            }
        }
    }

    /// Retrieve the result for a ticket, waiting up to `timeout_ms` for the
    /// job to complete. A timeout of zero is equivalent to `get_nowait`.
    pub fn get_wait(&self, ticket: u64, timeout_ms: u32) -> GetResponse {
        match self.lookup(ticket) {
            None => GetResponse::error(Status::ErrorInvalidInput),
            Some(job) => {
                let deadline = Instant::now()
                    + Duration::from_millis(u64::from(timeout_ms));
                if !job.wait_until_done(deadline) {
                    return GetResponse::error(Status::NotFinished);
                }
                self.consume(&job)
            }
        }
    }

    fn lookup(&self, ticket: u64) -> Option<Arc<Job>> {
        self.jobs.lock().unwrap().get(&ticket).cloned()
    }

    /// Removal from the map is the single-consumption event: of two racing
    /// retrievals only the one whose remove succeeds delivers the result,
    /// the other observes an unknown ticket.
    fn consume(&self, job: &Arc<Job>) -> GetResponse {
        match self.jobs.lock().unwrap().remove(&job.id) {
            Some(_) => {
                let (status, result) = job.take_terminal();
                GetResponse { status, result }
            }
            None => GetResponse::error(Status::ErrorInvalidInput),
        }
    }
}

struct WorkQueueInner {
    queue: VecDeque<Arc<Job>>,
    running: bool,
}

/// The FIFO of jobs awaiting execution. Workers block on the condition
/// variable while the queue is empty and the pool is running.
pub struct WorkQueue {
    inner: Mutex<WorkQueueInner>,
    available: Condvar,
}

impl Default for WorkQueue {
    fn default() -> Self {
        WorkQueue::new()
    }
}

impl WorkQueue {
    pub fn new() -> WorkQueue {
        WorkQueue {
            inner: Mutex::new(WorkQueueInner {
                queue: VecDeque::new(),
                running: true,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a job and wake one worker.
    pub fn push(&self, job: Arc<Job>) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(job);
        self.available.notify_one();
    }

    /// Pop the oldest pending job, blocking while the queue is empty.
    /// Returns `None` once the queue has been stopped and drained.
    pub fn pop_blocking(&self) -> Option<Arc<Job>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(job) = inner.queue.pop_front() {
                return Some(job);
            }
            if !inner.running {
                return None;
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    /// Stop the queue and wake every worker so the pool can quiesce. Jobs
    /// still queued remain available to be popped and completed.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = false;
        self.available.notify_all();
    }
}

/// A fixed set of executor threads draining the work queue.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` worker threads over the given queue.
    pub fn spawn(
        count: usize,
        queue: &Arc<WorkQueue>,
        log: &Logger,
    ) -> Result<WorkerPool, Error> {
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let worker_queue = Arc::clone(queue);
            let worker_log = log.new(o!("worker" => i));
            let handle = thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || worker_loop(&worker_queue, &worker_log))?;
            workers.push(handle);
        }
        Ok(WorkerPool { workers })
    }

    /// Wait for every worker to exit. The pool is quiesced afterwards.
    pub fn join(&mut self) {
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(queue: &Arc<WorkQueue>, log: &Logger) {
    while let Some(job) = queue.pop_blocking() {
        debug!(log, "executing job"; "ticket" => job.id);
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| {
                compute::execute(&job.request)
            }));
        match outcome {
            Ok(Ok(value)) => job.complete(Status::Success, Some(value)),
            Ok(Err(e)) => job.complete(e.status(), None),
            Err(_) => {
                error!(log, "kernel panicked"; "ticket" => job.id);
                job.complete(Status::ErrorInternal, None);
            }
        }
    }
    debug!(log, "worker exiting");
}
