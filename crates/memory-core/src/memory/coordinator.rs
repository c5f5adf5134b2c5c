//! ============================================================================
//! Cold Path Coordinator - One write job per thread, latest payload wins
//! ============================================================================
//! Each thread id owns a single-slot mailbox plus an active flag. `submit`
//! overwrites the slot and spawns a runner only when none is active. The
//! runner takes a pool permit, pops the slot, runs the job under the
//! thread's lock with whole-job retries, and loops until the slot is empty.
//!
//! Idle bookkeeping (nothing queued, no runner) is swept after a TTL.
//! ============================================================================

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info};

use super::events::{EventPublisher, MemoryEvent};
use super::store::VectorMemoryStore;
use super::types::{ContextSnapshot, ConversationTurn};
use crate::config::CoordinatorConfig;
use crate::retry::{retry_with_backoff, RetryOutcome};

/// Work queued for one conversation thread
#[derive(Clone)]
pub struct PendingColdPathJob {
    pub thread_id: String,
    pub owner_id: String,
    pub context: ContextSnapshot,
    pub window: Vec<ConversationTurn>,
    pub store: Arc<VectorMemoryStore>,
    pub events: EventPublisher,
}

impl std::fmt::Debug for PendingColdPathJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingColdPathJob")
            .field("thread_id", &self.thread_id)
            .field("owner_id", &self.owner_id)
            .field("turns", &self.window.len())
            .finish()
    }
}

/// Body of a cold-path job
#[async_trait]
pub trait ColdPathHandler: Send + Sync {
    async fn handle(&self, job: &PendingColdPathJob) -> Result<()>;
}

struct ThreadSlot {
    queued: Option<PendingColdPathJob>,
    active: bool,
    lock: Arc<tokio::sync::Mutex<()>>,
    last_seen: Instant,
}

impl ThreadSlot {
    fn new() -> Self {
        Self {
            queued: None,
            active: false,
            lock: Arc::new(tokio::sync::Mutex::new(())),
            last_seen: Instant::now(),
        }
    }

    fn is_idle(&self) -> bool {
        !self.active && self.queued.is_none()
    }
}

/// Snapshot of coordinator bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub tracked_threads: usize,
    pub active_threads: usize,
    pub queued_threads: usize,
    pub jobs_executed: u64,
    pub jobs_coalesced: u64,
    pub jobs_failed: u64,
}

struct Inner {
    handler: Arc<dyn ColdPathHandler>,
    pool: Arc<Semaphore>,
    threads: Mutex<HashMap<String, ThreadSlot>>,
    config: CoordinatorConfig,
    runtime: Handle,
    idle: Notify,
    executed: AtomicU64,
    coalesced: AtomicU64,
    failed: AtomicU64,
}

/// Bounded, per-thread-exclusive runner for cold-path jobs
#[derive(Clone)]
pub struct ColdPathCoordinator {
    inner: Arc<Inner>,
}

impl ColdPathCoordinator {
    /// Must be called inside a tokio runtime; runners and the sweeper are
    /// spawned on it
    pub fn new(handler: Arc<dyn ColdPathHandler>, config: CoordinatorConfig) -> Self {
        let inner = Arc::new(Inner {
            handler,
            pool: Arc::new(Semaphore::new(config.pool_size.max(1))),
            threads: Mutex::new(HashMap::new()),
            runtime: Handle::current(),
            idle: Notify::new(),
            executed: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            config,
        });

        if inner.config.sweep_interval_secs > 0 {
            spawn_sweeper(Arc::downgrade(&inner));
        }

        Self { inner }
    }

    /// Queue `job` for its thread, replacing any job not yet started.
    /// Never blocks.
    pub fn submit(&self, job: PendingColdPathJob) {
        let thread_id = job.thread_id.clone();
        let spawn_runner = {
            let mut threads = self.inner.threads.lock();
            let slot = threads.entry(thread_id.clone()).or_insert_with(ThreadSlot::new);
            if slot.queued.replace(job).is_some() {
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!("Coalesced queued job for thread {}", thread_id);
            }
            slot.last_seen = Instant::now();
            !std::mem::replace(&mut slot.active, true)
        };

        if spawn_runner {
            let inner = self.inner.clone();
            self.inner.runtime.spawn(run_thread(inner, thread_id));
        }
    }

    /// Resolve once nothing is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            let idle = self.inner.threads.lock().values().all(ThreadSlot::is_idle);
            if idle {
                return;
            }
            notified.await;
        }
    }

    /// Drop bookkeeping for threads idle longer than the TTL
    pub fn sweep_idle(&self) -> usize {
        sweep(&self.inner)
    }

    pub fn stats(&self) -> CoordinatorStats {
        let threads = self.inner.threads.lock();
        CoordinatorStats {
            tracked_threads: threads.len(),
            active_threads: threads.values().filter(|s| s.active).count(),
            queued_threads: threads.values().filter(|s| s.queued.is_some()).count(),
            jobs_executed: self.inner.executed.load(Ordering::Relaxed),
            jobs_coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            jobs_failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_thread(inner: Arc<Inner>, thread_id: String) {
    loop {
        let permit = match inner.pool.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("Cold path pool closed; abandoning thread {}", thread_id);
                deregister(&inner, &thread_id);
                return;
            }
        };

        let next = {
            let mut threads = inner.threads.lock();
            match threads.get_mut(&thread_id) {
                Some(slot) => match slot.queued.take() {
                    Some(job) => Some((job, slot.lock.clone())),
                    None => {
                        slot.active = false;
                        slot.last_seen = Instant::now();
                        None
                    }
                },
                None => None,
            }
        };

        let Some((job, lock)) = next else {
            drop(permit);
            inner.idle.notify_waiters();
            return;
        };

        {
            let _guard = lock.lock().await;
            execute(&inner, job).await;
        }
        drop(permit);
    }
}

async fn execute(inner: &Inner, job: PendingColdPathJob) {
    let label = format!("cold path [{}]", job.thread_id);
    let handler = inner.handler.clone();

    let outcome = retry_with_backoff(&inner.config.retry, &label, |_attempt| {
        let handler = handler.clone();
        let job = job.clone();
        async move { handler.handle(&job).await }
    })
    .await;

    inner.executed.fetch_add(1, Ordering::Relaxed);
    match outcome {
        RetryOutcome::Succeeded { attempts, .. } => {
            debug!("{} finished after {} attempt(s)", label, attempts);
        }
        RetryOutcome::Aborted { error, attempts } | RetryOutcome::Exhausted { error, attempts } => {
            inner.failed.fetch_add(1, Ordering::Relaxed);
            error!("{} dropped after {} attempt(s): {:#}", label, attempts, error);
            job.events
                .emit(MemoryEvent::error(&job.thread_id, format!("{:#}", error)))
                .await;
        }
    }
}

fn deregister(inner: &Inner, thread_id: &str) {
    if let Some(slot) = inner.threads.lock().get_mut(thread_id) {
        slot.active = false;
        slot.queued = None;
    }
    inner.idle.notify_waiters();
}

fn sweep(inner: &Inner) -> usize {
    let ttl = Duration::from_secs(inner.config.idle_ttl_secs);
    let mut threads = inner.threads.lock();
    let before = threads.len();
    threads.retain(|_, slot| {
        !(slot.is_idle() && slot.last_seen.elapsed() >= ttl && Arc::strong_count(&slot.lock) == 1)
    });
    let removed = before - threads.len();
    if removed > 0 {
        info!("Swept {} idle cold path threads", removed);
    }
    removed
}

fn spawn_sweeper(inner: Weak<Inner>) {
    let Some(strong) = inner.upgrade() else {
        return;
    };
    let period = Duration::from_secs(strong.config.sweep_interval_secs);
    let runtime = strong.runtime.clone();
    drop(strong);

    runtime.spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.tick().await;
        loop {
            timer.tick().await;
            match inner.upgrade() {
                Some(inner) => {
                    sweep(&inner);
                }
                None => break,
            }
        }
        debug!("Cold path sweeper stopped");
    });
}
