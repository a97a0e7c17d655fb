//! In-process durable-ish job queue with priorities, retries, and
//! exponential backoff.
//!
//! Stands in for the external queue broker. Semantics kept from the broker
//! contract:
//!
//! - Jobs carry a priority (1 is most urgent) and an identity key; a job
//!   whose identity is already pending is not enqueued again, which
//!   serializes healing per chunk.
//! - A failed job is re-scheduled with exponential backoff starting at its
//!   base delay; after the attempt budget is exhausted it moves to a dead
//!   list and is retained for inspection.
//! - Workers drain concurrently up to a permit limit and stop on the shared
//!   shutdown signal; in-flight jobs are allowed to finish.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrder};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use csf_common::Result;

/// Latched shutdown signal shared by every loop and worker. Unlike a bare
/// `Notify`, a trigger that fires while nobody is waiting is not lost.
#[derive(Default)]
pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, AtomicOrder::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(AtomicOrder::SeqCst)
    }

    /// Resolve once the signal has been triggered (immediately if already).
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Default attempt budget for every job type.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Work item payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// Restore missing replicas for a chunk.
    HealChunk { chunk_id: String, current: u32, target: u32 },
    /// Shed replicas above the tolerated maximum.
    TrimExcess { chunk_id: String },
    /// Physically remove a deleted file from the fleet.
    DeleteFile { file_id: String, reason: String },
}

impl JobKind {
    /// Identity key used for pending-job dedupe.
    pub fn identity(&self) -> String {
        match self {
            JobKind::HealChunk { chunk_id, .. } => format!("heal:{}", chunk_id),
            JobKind::TrimExcess { chunk_id } => format!("trim:{}", chunk_id),
            JobKind::DeleteFile { file_id, .. } => format!("delete:{}", file_id),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobKind::HealChunk { .. } => "heal-chunk",
            JobKind::TrimExcess { .. } => "trim-excess",
            JobKind::DeleteFile { .. } => "delete-file",
        }
    }

    /// Backoff base per the broker contract: critical healing restarts at
    /// 2 s, everything else at 5 s.
    fn backoff_base(&self, priority: u8) -> Duration {
        match self {
            JobKind::HealChunk { .. } if priority == 1 => Duration::from_secs(2),
            _ => Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    pub priority: u8,
    /// Completed attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

/// A job waiting for its backoff delay to elapse. Max-heap on the earliest
/// deadline.
struct DelayedEntry {
    ready_at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A job eligible to run now. Max-heap on the most urgent (numerically
/// lowest) priority, FIFO within a priority.
struct ReadyEntry {
    priority: u8,
    seq: u64,
    job: Job,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    pending: HashSet<String>,
    dead: Vec<Job>,
    next_id: u64,
}

/// The in-memory queue. One instance per worker pool.
pub struct MemoryJobQueue {
    name: &'static str,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new(name: &'static str) -> Self {
        MemoryJobQueue {
            name,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue with the default attempt budget and per-kind backoff base.
    /// Returns `false` when a job with the same identity is already pending.
    pub fn enqueue(&self, kind: JobKind, priority: u8) -> bool {
        let base = kind.backoff_base(priority);
        self.enqueue_with(kind, priority, DEFAULT_MAX_ATTEMPTS, base)
    }

    pub fn enqueue_with(
        &self,
        kind: JobKind,
        priority: u8,
        max_attempts: u32,
        backoff_base: Duration,
    ) -> bool {
        let identity = kind.identity();
        let mut inner = self.inner.lock();
        if inner.pending.contains(&identity) {
            debug!("{}: skipping duplicate job {}", self.name, identity);
            return false;
        }
        inner.pending.insert(identity);
        inner.next_id += 1;
        let id = inner.next_id;
        let job = Job { id, kind, priority, attempts: 0, max_attempts, backoff_base };
        inner.ready.push(ReadyEntry { priority, seq: id, job });
        drop(inner);
        self.notify.notify_waiters();
        true
    }

    /// Wait for the next ready job. Returns `None` once `shutdown` fires.
    pub async fn dequeue(&self, shutdown: &ShutdownSignal) -> Option<Job> {
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            let wait = {
                let mut inner = self.inner.lock();
                let now = Instant::now();
                // promote every delayed job whose backoff has elapsed
                loop {
                    let due = inner.delayed.peek().map(|e| e.ready_at <= now).unwrap_or(false);
                    if !due {
                        break;
                    }
                    if let Some(entry) = inner.delayed.pop() {
                        inner.ready.push(ReadyEntry {
                            priority: entry.job.priority,
                            seq: entry.seq,
                            job: entry.job,
                        });
                    }
                }
                if let Some(entry) = inner.ready.pop() {
                    return Some(entry.job);
                }
                inner.delayed.peek().map(|e| e.ready_at - now)
            };
            tokio::select! {
                _ = shutdown.wait() => return None,
                _ = self.notify.notified() => {}
                _ = async {
                    match wait {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
    }

    /// Acknowledge a finished job and release its identity.
    pub fn complete(&self, job: &Job) {
        self.inner.lock().pending.remove(&job.kind.identity());
    }

    /// Record a failed attempt. Re-schedules with exponential backoff while
    /// the budget lasts, otherwise parks the job on the dead list.
    pub fn retry(&self, mut job: Job) {
        job.attempts += 1;
        let identity = job.kind.identity();
        let mut inner = self.inner.lock();
        if job.attempts >= job.max_attempts {
            warn!(
                "{}: job {} exhausted {} attempts, parking for inspection",
                self.name, identity, job.max_attempts
            );
            inner.pending.remove(&identity);
            inner.dead.push(job);
            return;
        }
        let delay = job.backoff_base * 2u32.saturating_pow(job.attempts - 1);
        inner.next_id += 1;
        let seq = inner.next_id;
        inner.delayed.push(DelayedEntry { ready_at: Instant::now() + delay, seq, job });
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Jobs queued or in flight.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Jobs that exhausted their attempt budget.
    pub fn dead_jobs(&self) -> Vec<Job> {
        self.inner.lock().dead.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_len() == 0
    }
}

/// Spawn a worker loop draining `queue` with up to `concurrency` jobs in
/// flight. The loop exits on `shutdown`; running jobs finish on their own.
pub fn spawn_worker<H, Fut>(
    name: &'static str,
    queue: Arc<MemoryJobQueue>,
    concurrency: usize,
    shutdown: Arc<ShutdownSignal>,
    handler: H,
) -> JoinHandle<()>
where
    H: Fn(Job) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(concurrency));
        info!("{} worker started (concurrency {})", name, concurrency);
        loop {
            let job = match queue.dequeue(&shutdown).await {
                Some(j) => j,
                None => break,
            };
            let permit = match permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let label = job.kind.label();
                match handler(job.clone()).await {
                    Ok(()) => queue.complete(&job),
                    Err(e) => {
                        warn!("{} failed (attempt {}): {}", label, job.attempts + 1, e);
                        queue.retry(job);
                    }
                }
            });
        }
        info!("{} worker stopped", name);
    })
}
