//! Task queue set: a fixed group of bounded MPMC task rings.
//!
//! Queues are created during initialization through [`QueueSetBuilder`]; once
//! built the set is frozen and shared as `Arc<QueueSet<S>>`. Producers on any
//! thread push through [`QueueHandle`], the loop thread drains with
//! [`QueueSet::try_pop_all`].

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::runtime::context::TaskContext;
use crate::sync::{Ring, Timeout};
use crate::trace::{trace, warn};

/// Unit of work executed on the loop thread with exclusive access to the stack.
pub type Task<S> = Box<dyn FnOnce(&mut S, &mut TaskContext<'_, S>) + Send>;

/// Dense queue index, fixed at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct QueueId(usize);

impl QueueId {
    /// Position in drain order among the set's queues.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// What a producer does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Wait for space, then fail with [`SchedulerError::Backpressure`].
    Block(Timeout),
    /// Evict the oldest queued task to admit the new one.
    DropOldest,
    /// Fail immediately with [`SchedulerError::Backpressure`].
    Reject,
}

/// Capacity and overflow behaviour of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Minimum number of tasks held (rounded up to a power of two).
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl QueueConfig {
    /// Blocking queue waiting at most `timeout` for space.
    #[must_use]
    pub const fn blocking(capacity: usize, timeout: Duration) -> Self {
        Self {
            capacity,
            overflow: OverflowPolicy::Block(Timeout::Duration(timeout)),
        }
    }

    /// Best-effort queue evicting its oldest task when full.
    #[must_use]
    pub const fn drop_oldest(capacity: usize) -> Self {
        Self {
            capacity,
            overflow: OverflowPolicy::DropOldest,
        }
    }

    /// Queue that rejects pushes when full.
    #[must_use]
    pub const fn rejecting(capacity: usize) -> Self {
        Self {
            capacity,
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::blocking(256, Duration::from_millis(1))
    }
}

/// Per-queue counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub capacity: usize,
    /// Tasks queued right now (approximate under contention).
    pub depth: usize,
    pub pushed: u64,
    /// Tasks evicted under [`OverflowPolicy::DropOldest`].
    pub dropped: u64,
    /// Pushes that failed with backpressure.
    pub rejected: u64,
    pub high_water: usize,
}

struct TaskQueue<S> {
    name: String,
    ring: Ring<Task<S>>,
    overflow: OverflowPolicy,
    pushed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    high_water: AtomicUsize,
}

impl<S> TaskQueue<S> {
    fn admitted(&self) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.high_water.fetch_max(self.ring.len(), Ordering::Relaxed);
    }

    fn backpressure(&self) -> SchedulerError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(queue = %self.name, capacity = self.ring.capacity(), "queue full, task rejected");
        SchedulerError::Backpressure {
            queue: self.name.clone(),
        }
    }

    fn push(&self, task: Task<S>) -> Result<(), SchedulerError> {
        match self.overflow {
            OverflowPolicy::Block(timeout) => self
                .ring
                .push_blocking(task, timeout)
                .map_err(|_| self.backpressure())?,
            OverflowPolicy::Reject => self.ring.push(task).map_err(|_| self.backpressure())?,
            OverflowPolicy::DropOldest => {
                let mut task = task;
                loop {
                    match self.ring.push(task) {
                        Ok(()) => break,
                        Err(returned) => {
                            task = returned;
                            if self.ring.pop().is_some() {
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                                trace!(queue = %self.name, "evicted oldest task");
                            }
                        }
                    }
                }
            }
        }
        self.admitted();
        Ok(())
    }

    fn try_push(&self, task: Task<S>) -> Result<(), Task<S>> {
        self.ring.push(task).inspect_err(|_| {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        })?;
        self.admitted();
        Ok(())
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            capacity: self.ring.capacity(),
            depth: self.ring.len(),
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            high_water: self.high_water.load(Ordering::Relaxed),
        }
    }
}

/// Collects queue definitions before the set is frozen.
pub struct QueueSetBuilder<S> {
    queues: Vec<TaskQueue<S>>,
}

impl<S> QueueSetBuilder<S> {
    #[must_use]
    pub fn new() -> Self {
        Self { queues: Vec::new() }
    }

    /// Adds a queue; queues drain in creation order.
    pub fn make_queue(&mut self, name: impl Into<String>, config: QueueConfig) -> QueueId {
        let id = QueueId(self.queues.len());
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        self.queues.push(TaskQueue {
            name: name.into(),
            ring: Ring::with_capacity(capacity),
            overflow: config.overflow,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            high_water: AtomicUsize::new(0),
        });
        id
    }

    /// Freezes the set.
    #[must_use]
    pub fn build(self) -> Arc<QueueSet<S>> {
        Arc::new(QueueSet {
            queues: self.queues,
        })
    }
}

impl<S> Default for QueueSetBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen set of task queues.
pub struct QueueSet<S> {
    queues: Vec<TaskQueue<S>>,
}

impl<S> QueueSet<S> {
    /// Number of queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// All queue ids in drain order.
    pub fn ids(&self) -> impl Iterator<Item = QueueId> + use<S> {
        (0..self.queues.len()).map(QueueId)
    }

    #[must_use]
    pub fn name(&self, id: QueueId) -> Option<&str> {
        self.queues.get(id.0).map(|q| q.name.as_str())
    }

    fn queue(&self, id: QueueId) -> Result<&TaskQueue<S>, SchedulerError> {
        self.queues
            .get(id.0)
            .ok_or(SchedulerError::InvalidState("unknown queue id"))
    }

    /// Pushes `task` applying the queue's overflow policy.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Backpressure`] when a blocking queue stays full past
    /// its timeout or a rejecting queue is full.
    pub fn push(&self, id: QueueId, task: Task<S>) -> Result<(), SchedulerError> {
        self.queue(id)?.push(task)
    }

    /// Pushes without blocking or evicting.
    ///
    /// # Errors
    ///
    /// Returns the task if the queue is full or `id` is unknown.
    pub fn try_push(&self, id: QueueId, task: Task<S>) -> Result<(), Task<S>> {
        match self.queues.get(id.0) {
            Some(queue) => queue.try_push(task),
            None => Err(task),
        }
    }

    /// Drains the tasks queued when the call starts, oldest first.
    ///
    /// Tasks pushed while draining stay queued for the next drain.
    #[must_use]
    pub fn try_pop_all(&self, id: QueueId) -> Drain<'_, S> {
        let ring = self.queues.get(id.0).map(|q| &q.ring);
        Drain {
            remaining: ring.map_or(0, Ring::len),
            ring,
        }
    }

    /// Drains at most `limit` tasks, oldest first.
    #[must_use]
    pub fn try_pop_n(&self, id: QueueId, limit: usize) -> Drain<'_, S> {
        let mut drain = self.try_pop_all(id);
        drain.remaining = drain.remaining.min(limit);
        drain
    }

    /// Tasks currently queued.
    #[must_use]
    pub fn depth(&self, id: QueueId) -> usize {
        self.queues.get(id.0).map_or(0, |q| q.ring.len())
    }

    #[must_use]
    pub fn stats(&self, id: QueueId) -> Option<QueueStats> {
        self.queues.get(id.0).map(TaskQueue::stats)
    }

    /// Counters of every queue, in drain order.
    #[must_use]
    pub fn all_stats(&self) -> Vec<QueueStats> {
        self.queues.iter().map(TaskQueue::stats).collect()
    }
}

/// Iterator returned by [`QueueSet::try_pop_all`].
pub struct Drain<'a, S> {
    ring: Option<&'a Ring<Task<S>>>,
    remaining: usize,
}

impl<S> Iterator for Drain<'_, S> {
    type Item = Task<S>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let task = self.ring?.pop();
        if task.is_none() {
            // A drop-oldest producer evicted ahead of us.
            self.remaining = 0;
        }
        task
    }
}

/// Cloneable producer capability for one queue, usable from any thread.
pub struct QueueHandle<S> {
    set: Arc<QueueSet<S>>,
    id: QueueId,
}

impl<S> Clone for QueueHandle<S> {
    fn clone(&self) -> Self {
        Self {
            set: Arc::clone(&self.set),
            id: self.id,
        }
    }
}

impl<S> QueueHandle<S> {
    pub(crate) fn new(set: Arc<QueueSet<S>>, id: QueueId) -> Self {
        Self { set, id }
    }

    #[must_use]
    pub const fn id(&self) -> QueueId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.set.name(self.id).unwrap_or("")
    }

    /// Pushes a closure applying the queue's overflow policy.
    ///
    /// # Errors
    ///
    /// See [`QueueSet::push`].
    pub fn push<F>(&self, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&mut S, &mut TaskContext<'_, S>) + Send + 'static,
    {
        self.set.push(self.id, Box::new(f))
    }

    /// Pushes a boxed task applying the queue's overflow policy.
    ///
    /// # Errors
    ///
    /// See [`QueueSet::push`].
    pub fn push_task(&self, task: Task<S>) -> Result<(), SchedulerError> {
        self.set.push(self.id, task)
    }

    /// Pushes a closure if there is room right now.
    ///
    /// # Errors
    ///
    /// Returns the boxed task when the queue is full.
    pub fn try_push<F>(&self, f: F) -> Result<(), Task<S>>
    where
        F: FnOnce(&mut S, &mut TaskContext<'_, S>) + Send + 'static,
    {
        self.set.try_push(self.id, Box::new(f))
    }

    /// Tasks currently queued.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.set.depth(self.id)
    }
}
