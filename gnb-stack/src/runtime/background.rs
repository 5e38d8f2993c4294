//! Bounded background pool for work that must not run on the loop thread.
//!
//! A fixed set of named worker threads pops jobs from a bounded MPMC ring.
//! Work runs under `catch_unwind`; its outcome is wrapped into a task pushed
//! onto the background-result queue, so results re-enter the stack in order
//! on the loop thread. Workers never touch stack state.
//!
//! # Shutdown
//!
//! [`BackgroundPool::shutdown`] stops accepting results first, then signals
//! and joins the workers. Jobs still queued are discarded; in-flight jobs run
//! to completion but their results are dropped.

use core::fmt;
use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use serde::Serialize;

use crate::error::SchedulerError;
use crate::runtime::context::TaskContext;
use crate::runtime::queue::{QueueHandle, Task};
use crate::sync::Ring;
use crate::trace::{debug, error, info, warn};

/// Index of a background worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gnb-bg-{}", self.0)
    }
}

/// A background task panicked; delivered to its result callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("background task failed on {worker}: {message}")]
pub struct WorkerFailure {
    pub worker: WorkerId,
    /// Panic payload rendered as text.
    pub message: String,
}

/// Pool occupancy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    /// Workers running a job right now.
    pub busy: usize,
    /// Jobs waiting for a worker.
    pub queued: usize,
    pub completed: u64,
    /// Jobs whose work panicked.
    pub failed: u64,
    /// Results that could not be delivered to the result queue.
    pub results_dropped: u64,
    pub faulted: bool,
}

type Job = Box<dyn FnOnce(WorkerId, &PoolShared) + Send>;

struct PoolShared {
    jobs: Ring<Job>,
    shutdown: AtomicBool,
    /// Cleared when shutdown begins; results produced afterwards are dropped.
    accepting: AtomicBool,
    faulted: AtomicBool,
    fault_reason: Mutex<Option<String>>,
    busy: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    results_dropped: AtomicU64,
    idle_park: Duration,
}

impl PoolShared {
    fn mark_faulted(&self, reason: String) {
        error!(reason = %reason, "background pool faulted");
        self.faulted.store(true, Ordering::Release);
        let mut slot = self
            .fault_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(reason);
    }
}

/// Fixed-size worker pool.
///
/// Dropping the pool signals the workers to exit but does not join them.
/// Use [`BackgroundPool::shutdown`] to wait.
pub struct BackgroundPool {
    shared: Arc<PoolShared>,
    threads: Vec<Thread>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_wake: AtomicUsize,
}

impl BackgroundPool {
    /// Spawns `workers` threads sharing a job ring of `capacity` entries.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Spawn`] if a worker thread cannot be created; the
    /// workers already started are shut down again.
    pub fn spawn(
        workers: NonZeroUsize,
        capacity: NonZeroUsize,
        idle_park: Duration,
    ) -> Result<Self, SchedulerError> {
        let shared = Arc::new(PoolShared {
            jobs: Ring::with_capacity(capacity),
            shutdown: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            faulted: AtomicBool::new(false),
            fault_reason: Mutex::new(None),
            busy: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            results_dropped: AtomicU64::new(0),
            idle_park,
        });

        let mut pool = Self {
            shared,
            threads: Vec::with_capacity(workers.get()),
            handles: Mutex::new(Vec::with_capacity(workers.get())),
            next_wake: AtomicUsize::new(0),
        };

        for n in 0..workers.get() {
            let worker = WorkerId(n);
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(worker.to_string())
                .spawn(move || run_worker(worker, &shared));
            match spawned {
                Ok(handle) => {
                    pool.threads.push(handle.thread().clone());
                    pool.handles
                        .get_mut()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(handle);
                }
                Err(source) => {
                    error!(worker = %worker, error = %source, "failed to spawn background worker");
                    pool.shutdown();
                    return Err(SchedulerError::Spawn {
                        name: worker.to_string(),
                        source,
                    });
                }
            }
        }

        info!(
            workers = workers.get(),
            capacity = pool.shared.jobs.capacity(),
            "background pool started"
        );
        Ok(pool)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.threads.len()
    }

    /// Queues `work` for a worker. Its outcome is delivered to `on_result` as a
    /// task on `results`, in completion order.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::ResourceExhausted`] if the job ring is full.
    /// - [`SchedulerError::InvalidState`] after shutdown began.
    pub fn submit<S, R, W, F>(
        &self,
        results: QueueHandle<S>,
        work: W,
        on_result: F,
    ) -> Result<(), SchedulerError>
    where
        S: 'static,
        R: Send + 'static,
        W: FnOnce(WorkerId) -> R + Send + 'static,
        F: FnOnce(&mut S, &mut TaskContext<'_, S>, Result<R, WorkerFailure>) + Send + 'static,
    {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::InvalidState("background pool is shut down"));
        }
        let job: Job = Box::new(move |worker: WorkerId, shared: &PoolShared| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(worker))).map_err(
                |payload| WorkerFailure {
                    worker,
                    message: panic_message(payload.as_ref()),
                },
            );
            match &outcome {
                Ok(_) => shared.completed.fetch_add(1, Ordering::Relaxed),
                Err(failure) => {
                    warn!(worker = %worker, message = %failure.message, "background task panicked");
                    shared.failed.fetch_add(1, Ordering::Relaxed)
                }
            };
            if !shared.accepting.load(Ordering::Acquire) {
                shared.results_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(worker = %worker, "pool shutting down, result discarded");
                return;
            }
            let task: Task<S> =
                Box::new(move |stack: &mut S, ctx: &mut TaskContext<'_, S>| {
                    on_result(stack, ctx, outcome);
                });
            if let Err(err) = results.push_task(task) {
                shared.results_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(worker = %worker, error = %err, "failed to deliver background result");
            }
        });

        self.shared
            .jobs
            .push(job)
            .map_err(|_| SchedulerError::ResourceExhausted {
                resource: "background queue",
                capacity: self.shared.jobs.capacity(),
            })?;
        self.wake_one();
        Ok(())
    }

    /// A worker died outside the task boundary.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.shared.faulted.load(Ordering::Acquire)
    }

    /// Reason recorded by the first fault.
    #[must_use]
    pub fn fault_reason(&self) -> Option<String> {
        self.shared
            .fault_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.threads.len(),
            busy: self.shared.busy.load(Ordering::Relaxed),
            queued: self.shared.jobs.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            results_dropped: self.shared.results_dropped.load(Ordering::Relaxed),
            faulted: self.is_faulted(),
        }
    }

    /// Stops accepting results, joins every worker and discards queued jobs.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("background pool shutdown initiated");
        for thread in &self.threads {
            thread.unpark();
        }

        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            let name = handle.thread().name().unwrap_or("gnb-bg").to_owned();
            if handle.join().is_err() {
                self.shared
                    .mark_faulted(format!("worker {name} panicked during shutdown"));
            }
        }

        let mut discarded = 0usize;
        while self.shared.jobs.pop().is_some() {
            discarded += 1;
        }
        info!(discarded, "background pool shutdown complete");
    }

    fn wake_one(&self) {
        if self.threads.is_empty() {
            return;
        }
        let n = self.next_wake.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[n].unpark();
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        // Signal only; in-flight jobs may still be running.
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.shutdown.store(true, Ordering::Release);
        for thread in &self.threads {
            thread.unpark();
        }
    }
}

impl fmt::Debug for BackgroundPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn run_worker(worker: WorkerId, shared: &PoolShared) {
    debug!(worker = %worker, "background worker started");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        while !shared.shutdown.load(Ordering::Acquire) {
            match shared.jobs.pop() {
                Some(job) => {
                    shared.busy.fetch_add(1, Ordering::Relaxed);
                    job(worker, shared);
                    shared.busy.fetch_sub(1, Ordering::Relaxed);
                }
                None => thread::park_timeout(shared.idle_park),
            }
        }
    }));
    if let Err(payload) = outcome {
        shared.mark_faulted(format!(
            "worker {worker} died: {}",
            panic_message(payload.as_ref())
        ));
    }
    debug!(worker = %worker, "background worker exiting");
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::queue::{QueueConfig, QueueSetBuilder};
    use std::time::Instant;

    type Log = Vec<u64>;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn results_queue() -> QueueHandle<Log> {
        results_queue_with(QueueConfig::blocking(64, Duration::from_millis(10)))
    }

    fn results_queue_with(config: QueueConfig) -> QueueHandle<Log> {
        let mut builder = QueueSetBuilder::new();
        let id = builder.make_queue("background", config);
        QueueHandle::new(builder.build(), id)
    }

    /// Result value whose destructor panics.
    struct PanicsOnDrop;

    impl Drop for PanicsOnDrop {
        fn drop(&mut self) {
            panic!("result destructor failed");
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn results_land_on_the_result_queue() {
        let pool = BackgroundPool::spawn(nz(2), nz(16), Duration::from_millis(1)).unwrap();
        let results = results_queue();
        for i in 0..4u64 {
            pool.submit(
                results.clone(),
                move |_| i * 2,
                |log: &mut Log, _: &mut TaskContext<'_, Log>, r: Result<u64, WorkerFailure>| {
                    log.push(r.unwrap());
                },
            )
            .unwrap();
        }
        wait_for(|| results.depth() == 4);
        let stats = pool.stats();
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.failed, 0);
        pool.shutdown();
    }

    #[test]
    fn panicking_work_becomes_worker_failure() {
        let pool = BackgroundPool::spawn(nz(1), nz(4), Duration::from_millis(1)).unwrap();
        let results = results_queue();
        pool.submit(
            results.clone(),
            |_| -> u64 { panic!("decoder exploded") },
            |_: &mut Log, _: &mut TaskContext<'_, Log>, _: Result<u64, WorkerFailure>| {},
        )
        .unwrap();
        wait_for(|| pool.stats().failed == 1);
        wait_for(|| results.depth() == 1);
        assert!(!pool.is_faulted(), "task panics stay at the task boundary");
        pool.shutdown();
    }

    #[test]
    fn full_job_ring_is_resource_exhaustion() {
        let pool = BackgroundPool::spawn(nz(1), nz(1), Duration::from_millis(1)).unwrap();
        let results = results_queue();
        let gate = Arc::new(AtomicBool::new(false));

        let submit_blocking = |gate: Arc<AtomicBool>| {
            pool.submit(
                results.clone(),
                move |_| {
                    while !gate.load(Ordering::Acquire) {
                        thread::yield_now();
                    }
                },
                |_: &mut Log, _: &mut TaskContext<'_, Log>, _: Result<(), WorkerFailure>| {},
            )
        };

        // First job occupies the worker, second fills the ring.
        submit_blocking(Arc::clone(&gate)).unwrap();
        wait_for(|| pool.stats().busy == 1);
        submit_blocking(Arc::clone(&gate)).unwrap();
        let err = submit_blocking(Arc::clone(&gate)).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::ResourceExhausted {
                resource: "background queue",
                ..
            }
        ));

        gate.store(true, Ordering::Release);
        pool.shutdown();
    }

    #[test]
    fn panic_outside_the_task_boundary_faults_the_pool() {
        let pool = BackgroundPool::spawn(nz(1), nz(4), Duration::from_millis(1)).unwrap();
        let results = results_queue_with(QueueConfig::rejecting(2));
        results.push(|_: &mut Log, _: &mut TaskContext<'_, Log>| {}).unwrap();
        results.push(|_: &mut Log, _: &mut TaskContext<'_, Log>| {}).unwrap();

        // The result cannot be delivered, so it is dropped on the worker.
        pool.submit(
            results.clone(),
            |_| PanicsOnDrop,
            |_: &mut Log, _: &mut TaskContext<'_, Log>, _: Result<PanicsOnDrop, WorkerFailure>| {},
        )
        .unwrap();

        wait_for(|| pool.is_faulted());
        let reason = pool.fault_reason().unwrap();
        assert!(reason.contains("gnb-bg-0 died"), "{reason}");
        assert!(reason.contains("result destructor failed"), "{reason}");
        assert!(pool.stats().faulted);
        pool.shutdown();
    }

    #[test]
    fn shutdown_discards_late_results_and_rejects_submissions() {
        let pool = BackgroundPool::spawn(nz(1), nz(4), Duration::from_millis(1)).unwrap();
        let results = results_queue();
        pool.shutdown();
        assert_eq!(results.depth(), 0);
        assert!(matches!(
            pool.submit(
                results.clone(),
                |_| 1u64,
                |_: &mut Log, _: &mut TaskContext<'_, Log>, _: Result<u64, WorkerFailure>| {},
            ),
            Err(SchedulerError::InvalidState(_))
        ));
        // Second shutdown is a no-op.
        pool.shutdown();
    }
}
