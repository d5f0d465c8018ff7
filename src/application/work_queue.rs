//! 작업 큐 - in-process work queue
//!
//! N worker tasks pull jobs from a shared FIFO queue.
//!
//! - Unique keys: a keyed job is rejected while another job with the same
//!   key is queued or waiting out its delay. The key is freed when a worker
//!   picks the job up, so a running job may re-dispatch itself.
//! - Scrape depth: scrape jobs hold a [`ScrapeSlot`] from enqueue until they
//!   finish. Slots are reserved atomically, so concurrent dispatchers can
//!   never push the depth above `max_scrape_depth`.

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::infrastructure::config::QueueConfig;

/// Units of work the pipeline runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// One fetch-to-persist cycle for an entity
    Scrape { entity_id: String },
    /// One scheduler dispatch pass
    RunScheduler,
    /// One source sweep pass
    RunSweep,
}

/// Executes jobs popped by the queue workers
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<()>;

    /// Called after `handle` panicked for `job`; the worker keeps running
    async fn on_panic(&self, _job: Job) -> Result<()> {
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// One unit of scrape depth, released on drop
#[derive(Debug)]
pub struct ScrapeSlot {
    depth: Arc<AtomicUsize>,
}

impl Drop for ScrapeSlot {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Slots taken in one atomic step; unused slots are released on drop
#[derive(Debug)]
pub struct SlotReservation {
    depth: Arc<AtomicUsize>,
    remaining: usize,
}

impl SlotReservation {
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    fn take(&mut self) -> Option<ScrapeSlot> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(ScrapeSlot {
            depth: Arc::clone(&self.depth),
        })
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.depth.fetch_sub(self.remaining, Ordering::SeqCst);
        }
    }
}

/// 큐 항목 (작업 + 메타데이터)
#[derive(Debug)]
struct QueuedJob {
    id: Uuid,
    job: Job,
    unique_key: Option<String>,
    slot: Option<ScrapeSlot>,
    enqueued_at: Instant,
}

impl QueuedJob {
    fn new(job: Job, unique_key: Option<String>, slot: Option<ScrapeSlot>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            unique_key,
            slot,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedJob>,
    /// Keys of jobs that are queued or delayed
    unique_keys: HashSet<String>,
}

/// 작업 큐 통계
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub delayed: usize,
    pub scrape_depth: usize,
    pub completed: u64,
    pub failed: u64,
}

/// 작업 큐 매니저
pub struct WorkQueue {
    state: Mutex<QueueState>,
    scrape_depth: Arc<AtomicUsize>,
    running: AtomicUsize,
    delayed: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    notify: Notify,
    cancellation_token: CancellationToken,
    config: QueueConfig,
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            scrape_depth: Arc::new(AtomicUsize::new(0)),
            running: AtomicUsize::new(0),
            delayed: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            notify: Notify::new(),
            cancellation_token: CancellationToken::new(),
            config,
        }
    }

    pub fn max_scrape_depth(&self) -> usize {
        self.config.max_scrape_depth
    }

    /// Scrape jobs currently queued or running (plus outstanding reservations)
    pub fn scrape_depth(&self) -> usize {
        self.scrape_depth.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Reserves `min(wanted, max - depth)` slots in one atomic step
    pub fn reserve_scrape_slots(&self, wanted: usize) -> SlotReservation {
        let max = self.config.max_scrape_depth;
        let mut current = self.scrape_depth.load(Ordering::SeqCst);
        loop {
            let take = wanted.min(max.saturating_sub(current));
            if take == 0 {
                return SlotReservation {
                    depth: Arc::clone(&self.scrape_depth),
                    remaining: 0,
                };
            }
            match self.scrape_depth.compare_exchange(
                current,
                current + take,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return SlotReservation {
                        depth: Arc::clone(&self.scrape_depth),
                        remaining: take,
                    };
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Enqueues a scrape job using one slot of `reservation`
    pub async fn dispatch_scrape(&self, entity_id: String, reservation: &mut SlotReservation) -> bool {
        let Some(slot) = reservation.take() else {
            return false;
        };

        let job = QueuedJob::new(Job::Scrape { entity_id }, None, Some(slot));
        debug!("📥 Scrape job {} queued", job.id);
        self.state.lock().await.pending.push_back(job);
        self.notify.notify_one();
        true
    }

    /// Enqueues `job` after `delay` unless a job with `key` is already queued or delayed
    pub async fn dispatch_unique(self: &Arc<Self>, job: Job, key: &str, delay: Duration) -> bool {
        if self.is_shutting_down() {
            return false;
        }

        let mut state = self.state.lock().await;
        if !state.unique_keys.insert(key.to_string()) {
            debug!("Job with key '{}' already pending; dispatch skipped", key);
            return false;
        }

        if delay.is_zero() {
            state.pending.push_back(QueuedJob::new(job, Some(key.to_string()), None));
            drop(state);
            self.notify.notify_one();
            return true;
        }
        drop(state);

        self.delayed.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    queue
                        .state
                        .lock()
                        .await
                        .pending
                        .push_back(QueuedJob::new(job, Some(key), None));
                    queue.notify.notify_one();
                }
                () = queue.cancellation_token.cancelled() => {
                    queue.state.lock().await.unique_keys.remove(&key);
                }
            }
            queue.delayed.fetch_sub(1, Ordering::SeqCst);
        });
        true
    }

    /// 작업 큐 시작 - spawns the workers in the background
    pub fn start(self: &Arc<Self>, handler: Arc<dyn JobHandler>) -> Vec<JoinHandle<()>> {
        info!("🚀 Starting {} queue workers", self.config.workers);
        (0..self.config.workers)
            .map(|worker_id| {
                let queue = Arc::clone(self);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { queue.run_worker(worker_id, handler).await })
            })
            .collect()
    }

    async fn next_job(&self) -> Option<QueuedJob> {
        let mut state = self.state.lock().await;
        let job = state.pending.pop_front()?;
        if let Some(key) = &job.unique_key {
            state.unique_keys.remove(key);
        }
        Some(job)
    }

    async fn run_worker(&self, worker_id: usize, handler: Arc<dyn JobHandler>) {
        debug!("👷 Worker {} started", worker_id);

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let Some(queued) = self.next_job().await else {
                tokio::select! {
                    () = self.notify.notified() => {}
                    () = tokio::time::sleep(self.config.idle_poll()) => {}
                    () = self.cancellation_token.cancelled() => break,
                }
                continue;
            };

            let QueuedJob {
                id,
                job,
                slot,
                enqueued_at,
                ..
            } = queued;
            debug!(
                "👷 Worker {} running {:?} (job {}, waited {:?})",
                worker_id,
                job,
                id,
                enqueued_at.elapsed()
            );

            self.running.fetch_add(1, Ordering::SeqCst);
            let label = format!("{job:?}");
            let result = AssertUnwindSafe(handler.handle(job.clone()))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!("❌ Job {} failed: {:#}", label, e);
                }
                Err(payload) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!("💥 Job {} panicked: {}", label, panic_message(payload.as_ref()));
                    let recovery = AssertUnwindSafe(handler.on_panic(job)).catch_unwind().await;
                    match recovery {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("❌ Recovery after panic in {} failed: {:#}", label, e),
                        Err(_) => error!("💥 Recovery after panic in {} panicked too", label),
                    }
                }
            }
            drop(slot);
            self.running.fetch_sub(1, Ordering::SeqCst);
        }

        debug!("👷 Worker {} stopped", worker_id);
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.state.lock().await.pending.len(),
            running: self.running.load(Ordering::SeqCst),
            delayed: self.delayed.load(Ordering::SeqCst),
            scrape_depth: self.scrape_depth(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Waits until no scrape job is queued or running; false on timeout
    pub async fn wait_for_scrapes(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.scrape_depth() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Stops workers and delayed dispatches; queued jobs are dropped
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down work queue");
        self.cancellation_token.cancel();
        self.notify.notify_waiters();

        let mut state = self.state.lock().await;
        let dropped = state.pending.len();
        state.pending.clear();
        state.unique_keys.clear();
        if dropped > 0 {
            info!("🛑 Dropped {} queued jobs", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn config(max_scrape_depth: usize) -> QueueConfig {
        QueueConfig {
            workers: 2,
            max_scrape_depth,
            idle_poll_ms: 10,
        }
    }

    #[derive(Default)]
    struct Recorder {
        jobs: StdMutex<Vec<Job>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: Job) -> Result<()> {
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }
    }

    /// Panics on the first scrape job, records the rest
    #[derive(Default)]
    struct PanicsOnce {
        panicked: std::sync::atomic::AtomicBool,
        handled: StdMutex<Vec<Job>>,
        recovered: StdMutex<Vec<Job>>,
    }

    #[async_trait]
    impl JobHandler for PanicsOnce {
        async fn handle(&self, job: Job) -> Result<()> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("collaborator blew up");
            }
            self.handled.lock().unwrap().push(job);
            Ok(())
        }

        async fn on_panic(&self, job: Job) -> Result<()> {
            self.recovered.lock().unwrap().push(job);
            Ok(())
        }
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_worker() {
        let queue = Arc::new(WorkQueue::new(QueueConfig {
            workers: 1,
            max_scrape_depth: 4,
            idle_poll_ms: 10,
        }));
        let mut reservation = queue.reserve_scrape_slots(2);
        assert!(queue.dispatch_scrape("boom".into(), &mut reservation).await);
        assert!(queue.dispatch_scrape("fine".into(), &mut reservation).await);

        let handler = Arc::new(PanicsOnce::default());
        let handles = queue.start(handler.clone());
        assert!(queue.wait_for_scrapes(Duration::from_secs(5)).await);

        assert_eq!(
            *handler.recovered.lock().unwrap(),
            vec![Job::Scrape { entity_id: "boom".into() }]
        );
        assert_eq!(
            *handler.handled.lock().unwrap(),
            vec![Job::Scrape { entity_id: "fine".into() }]
        );
        let stats = queue.stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);

        queue.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn reservations_never_exceed_the_cap() {
        let queue = WorkQueue::new(config(5));
        let first = queue.reserve_scrape_slots(3);
        let second = queue.reserve_scrape_slots(3);
        let third = queue.reserve_scrape_slots(3);

        assert_eq!(first.remaining(), 3);
        assert_eq!(second.remaining(), 2);
        assert!(third.is_empty());
        assert_eq!(queue.scrape_depth(), 5);

        drop(second);
        assert_eq!(queue.scrape_depth(), 3);
    }

    #[tokio::test]
    async fn dispatched_slots_are_held_until_completion() {
        let queue = Arc::new(WorkQueue::new(config(2)));
        let mut reservation = queue.reserve_scrape_slots(2);
        assert!(queue.dispatch_scrape("a".into(), &mut reservation).await);
        assert!(queue.dispatch_scrape("b".into(), &mut reservation).await);
        assert!(!queue.dispatch_scrape("c".into(), &mut reservation).await);
        drop(reservation);
        assert_eq!(queue.scrape_depth(), 2);

        let recorder = Arc::new(Recorder::default());
        let handles = queue.start(recorder.clone());
        assert!(queue.wait_for_scrapes(Duration::from_secs(5)).await);
        assert_eq!(recorder.jobs.lock().unwrap().len(), 2);

        queue.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn unique_key_blocks_queued_and_delayed_duplicates() {
        let queue = Arc::new(WorkQueue::new(config(10)));

        assert!(queue.dispatch_unique(Job::RunScheduler, "scheduler", Duration::from_millis(50)).await);
        assert!(!queue.dispatch_unique(Job::RunScheduler, "scheduler", Duration::ZERO).await);
        assert_eq!(queue.stats().await.delayed, 1);

        let recorder = Arc::new(Recorder::default());
        let handles = queue.start(recorder.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(recorder.jobs.lock().unwrap().as_slice(), &[Job::RunScheduler]);
        // key freed once the job was picked up
        assert!(queue.dispatch_unique(Job::RunScheduler, "scheduler", Duration::ZERO).await);

        queue.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn shutdown_rejects_new_unique_jobs() {
        let queue = Arc::new(WorkQueue::new(config(1)));
        queue.shutdown().await;
        assert!(!queue.dispatch_unique(Job::RunSweep, "sweep", Duration::ZERO).await);
    }
}
