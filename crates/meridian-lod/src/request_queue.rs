//! Bounded, cancelable priority queue for asynchronous content jobs.
//!
//! Jobs wait in a max-heap ordered by priority, then by recency: among equal
//! priorities the most recently enqueued job runs first. [`PriorityRequestQueue::pump`]
//! starts jobs until the concurrency ceiling is reached, evaluating each job's
//! `should_execute` predicate right before it would run. Stale jobs resolve
//! with [`JobError::Cancelled`] without running their factory.
//!
//! Jobs run on a pool of worker threads and deliver their outcome through a
//! channel owned by the [`JobHandle`]; with zero workers they run inline on
//! the pumping thread, which keeps frame-by-frame tests deterministic.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use rustc_hash::FxHashMap;

use crate::error::FetchError;

/// Stable key of a job. Enqueueing an id that is already waiting returns the
/// waiting job's handle.
pub type JobId = String;

/// Result delivered by every job, including skipped ones.
pub type JobOutcome<T> = Result<T, JobError>;

type RequestFn<T> = Box<dyn FnOnce(&CancelToken) -> JobOutcome<T> + Send>;
type Predicate = Box<dyn Fn() -> bool + Send>;
type Task = Box<dyn FnOnce() + Send>;

/// Why a job did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The job was no longer needed: skipped before running or aborted while running.
    #[error("job cancelled")]
    Cancelled,
    /// The job ran and failed.
    #[error("job failed: {0}")]
    Failed(String),
}

impl From<FetchError> for JobError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Aborted => JobError::Cancelled,
            other => JobError::Failed(other.to_string()),
        }
    }
}

/// Shared cancellation flag.
///
/// The queue checks it before starting a job; running jobs receive it so
/// long fetches can bail out early.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    /// Mark the work as wanted again.
    pub fn reset(&self) {
        self.0.store(false, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

/// A unit of work to enqueue.
pub struct Job<T> {
    id: JobId,
    priority: f64,
    token: CancelToken,
    should_execute: Option<Predicate>,
    request: RequestFn<T>,
}

impl<T: Send + 'static> Job<T> {
    /// Create a job with a fresh cancel token and no extra predicate.
    pub fn new(
        id: impl Into<JobId>,
        priority: f64,
        request: impl FnOnce(&CancelToken) -> JobOutcome<T> + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            token: CancelToken::new(),
            should_execute: None,
            request: Box::new(request),
        }
    }

    /// Share an existing cancel token with the job.
    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.token = token;
        self
    }

    /// Extra predicate evaluated right before the job starts.
    pub fn with_should_execute(mut self, predicate: impl Fn() -> bool + Send + 'static) -> Self {
        self.should_execute = Some(Box::new(predicate));
        self
    }
}

/// Receiving end of a job's outcome. Clones share one outcome: whichever
/// clone takes it first gets it, later reads see the job as cancelled.
pub struct JobHandle<T> {
    id: JobId,
    receiver: Receiver<JobOutcome<T>>,
}

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<T> std::fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish()
    }
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Take the outcome if the job has resolved.
    ///
    /// A job dropped without resolving (queue torn down) reads as cancelled.
    pub fn try_take(&self) -> Option<JobOutcome<T>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(JobError::Cancelled)),
        }
    }

    /// Block until the job resolves.
    pub fn wait(&self) -> JobOutcome<T> {
        self.receiver.recv().unwrap_or(Err(JobError::Cancelled))
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobOutcome<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(JobError::Cancelled)),
        }
    }
}

/// Snapshot of queue activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs waiting to start.
    pub pending: usize,
    /// Jobs currently running.
    pub running: usize,
    /// Jobs that ran to a value.
    pub executed: u64,
    /// Jobs skipped or aborted.
    pub cancelled: u64,
    /// Jobs that ran and failed.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    executed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record<T>(&self, outcome: &JobOutcome<T>) {
        let counter = match outcome {
            Ok(_) => &self.executed,
            Err(JobError::Cancelled) => &self.cancelled,
            Err(JobError::Failed(_)) => &self.failed,
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

enum Dispatch {
    Execute,
    Skip,
}

/// Type-erased heap entry.
struct QueuedJob {
    id: JobId,
    priority: f64,
    /// Insertion sequence; later entries win ties.
    seq: u64,
    ready: Predicate,
    run: Box<dyn FnOnce(Dispatch) -> Option<Task> + Send>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueuedJob>,
    /// Handles of waiting jobs, keyed by id, for de-duplication.
    waiting: FxHashMap<JobId, Box<dyn Any + Send>>,
    next_seq: u64,
}

enum Executor {
    Inline,
    Pool {
        sender: Option<Sender<Task>>,
        workers: Vec<JoinHandle<()>>,
    },
}

impl Executor {
    fn spawn_pool(worker_count: usize) -> Self {
        if worker_count == 0 {
            return Executor::Inline;
        }
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let rx = receiver.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("meridian-queue-{index}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => tracing::warn!(%err, index, "failed to spawn queue worker"),
            }
        }
        if workers.is_empty() {
            tracing::warn!("no queue worker could be spawned, running jobs inline");
            return Executor::Inline;
        }
        Executor::Pool {
            sender: Some(sender),
            workers,
        }
    }

    fn execute(&self, task: Task) {
        match self {
            Executor::Inline => task(),
            Executor::Pool {
                sender: Some(sender),
                ..
            } => {
                if let Err(err) = sender.send(task) {
                    // Workers are gone; run on the caller so the job still resolves.
                    (err.into_inner())();
                }
            }
            Executor::Pool { sender: None, .. } => task(),
        }
    }

    fn shutdown(&mut self) {
        if let Executor::Pool { sender, workers } = self {
            sender.take();
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

/// Priority-ordered, concurrency-bounded job queue shared by all entities of a kind.
pub struct PriorityRequestQueue {
    inner: Mutex<QueueInner>,
    counters: Arc<Counters>,
    max_concurrent: usize,
    executor: Executor,
}

impl PriorityRequestQueue {
    /// Create a queue running at most `max_concurrent` jobs at once on
    /// `worker_threads` threads (0 = inline on the pumping thread).
    pub fn new(max_concurrent: usize, worker_threads: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            counters: Arc::new(Counters::default()),
            max_concurrent: max_concurrent.max(1),
            executor: Executor::spawn_pool(worker_threads),
        }
    }

    pub fn from_config(config: &meridian_config::QueueConfig) -> Self {
        Self::new(config.max_concurrent, config.worker_threads)
    }

    /// Queue that runs jobs inline, one at a time, when pumped.
    pub fn inline() -> Self {
        Self::new(1, 0)
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a job and return a handle to its eventual outcome.
    ///
    /// If a job with the same id is still waiting, no new job is queued and a
    /// handle to the waiting one is returned.
    pub fn enqueue<T: Send + 'static>(&self, job: Job<T>) -> JobHandle<T> {
        let mut inner = self.lock();
        if let Some(existing) = inner.waiting.get(&job.id) {
            if let Some(handle) = existing.downcast_ref::<JobHandle<T>>() {
                tracing::trace!(id = %job.id, "job already waiting, sharing handle");
                return handle.clone();
            }
            tracing::warn!(id = %job.id, "job id reused with a different output type");
        }

        let (sender, receiver) = crossbeam_channel::bounded::<JobOutcome<T>>(1);
        let handle = JobHandle {
            id: job.id.clone(),
            receiver,
        };

        let Job {
            id,
            priority,
            token,
            should_execute,
            request,
        } = job;

        let ready_token = token.clone();
        let ready: Predicate = Box::new(move || {
            !ready_token.is_cancelled() && should_execute.as_ref().is_none_or(|f| f())
        });

        let counters = Arc::clone(&self.counters);
        let run = Box::new(move |dispatch: Dispatch| -> Option<Task> {
            match dispatch {
                Dispatch::Skip => {
                    let outcome: JobOutcome<T> = Err(JobError::Cancelled);
                    counters.record(&outcome);
                    let _ = sender.send(outcome);
                    None
                }
                Dispatch::Execute => {
                    counters.running.fetch_add(1, AtomicOrdering::Relaxed);
                    Some(Box::new(move || {
                        let outcome = request(&token);
                        counters.record(&outcome);
                        // A dropped handle means nobody is interested any more.
                        let _ = sender.send(outcome);
                        counters.running.fetch_sub(1, AtomicOrdering::Relaxed);
                    }) as Task)
                }
            }
        });

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.waiting.insert(id.clone(), Box::new(handle.clone()));
        inner.heap.push(QueuedJob {
            id,
            priority,
            seq,
            ready,
            run,
        });
        handle
    }

    /// Start waiting jobs in priority order until the concurrency ceiling is
    /// reached. Jobs whose predicate fails resolve as cancelled immediately.
    ///
    /// Returns the number of jobs started or skipped.
    pub fn pump(&self) -> usize {
        let mut dispatched = 0;
        loop {
            if self.counters.running.load(AtomicOrdering::Relaxed) >= self.max_concurrent {
                break;
            }
            let Some(job) = ({
                let mut inner = self.lock();
                let job = inner.heap.pop();
                if let Some(job) = &job {
                    inner.waiting.remove(&job.id);
                }
                job
            }) else {
                break;
            };

            dispatched += 1;
            if (job.ready)() {
                tracing::trace!(id = %job.id, priority = job.priority, "starting job");
                if let Some(task) = (job.run)(Dispatch::Execute) {
                    self.executor.execute(task);
                }
            } else {
                tracing::trace!(id = %job.id, "skipping stale job");
                (job.run)(Dispatch::Skip);
            }
        }
        dispatched
    }

    /// Number of jobs waiting to start.
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.len(),
            running: self.counters.running.load(AtomicOrdering::Relaxed),
            executed: self.counters.executed.load(AtomicOrdering::Relaxed),
            cancelled: self.counters.cancelled.load(AtomicOrdering::Relaxed),
            failed: self.counters.failed.load(AtomicOrdering::Relaxed),
        }
    }
}

impl Drop for PriorityRequestQueue {
    fn drop(&mut self) {
        self.executor.shutdown();
    }
}
