//! Per-task view of the loop-thread services.

use crate::error::SchedulerError;
use crate::interfaces::LcidSet;
use crate::runtime::background::{WorkerFailure, WorkerId};
use crate::runtime::deferred::DeferredBuffer;
use crate::runtime::queue::{QueueHandle, QueueId};
use crate::runtime::scheduler::{Services, StackQueues};
use crate::runtime::timing::{TickInstant, TimerHandle, TimerId, TimerService, Tti};

/// Handed to every task, timer callback and deferred task, together with
/// `&mut S`. Only exists on the loop thread.
pub struct TaskContext<'a, S> {
    tick: TickInstant,
    tti: Tti,
    timers: &'a TimerService<S>,
    deferred: &'a mut DeferredBuffer<S>,
    services: &'a Services<S>,
}

impl<'a, S> TaskContext<'a, S> {
    pub(crate) fn new(
        tick: TickInstant,
        timers: &'a TimerService<S>,
        deferred: &'a mut DeferredBuffer<S>,
        services: &'a Services<S>,
    ) -> Self {
        Self {
            tick,
            tti: tick.to_tti(services.modulus),
            timers,
            deferred,
            services,
        }
    }

    /// Monotonic tick being processed.
    #[must_use]
    pub const fn tick(&self) -> TickInstant {
        self.tick
    }

    /// Radio-visible TTI of the tick being processed.
    #[must_use]
    pub const fn tti(&self) -> Tti {
        self.tti
    }

    /// The timer service, e.g. to rearm the running callback's own timer by id.
    #[must_use]
    pub const fn timers(&self) -> &'a TimerService<S> {
        self.timers
    }

    /// Allocates an idle timer.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ResourceExhausted`] when the timer capacity is used up.
    pub fn create_timer(&self) -> Result<TimerHandle<S>, SchedulerError> {
        self.timers.create()
    }

    /// Runs `f` later in the current tick, after the task that deferred it.
    pub fn defer<F>(&mut self, f: F)
    where
        F: FnOnce(&mut S, &mut TaskContext<'_, S>) + 'static,
    {
        self.deferred.defer(Box::new(f));
    }

    /// Runs `f` once, `duration` ticks from now, without keeping a handle.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ResourceExhausted`] when the timer capacity is used up.
    pub fn defer_callback<F>(&self, duration: u32, f: F) -> Result<TimerId, SchedulerError>
    where
        F: FnOnce(&mut S, &mut TaskContext<'_, S>) + 'static,
    {
        let mut f = Some(f);
        self.timers.create_detached(
            duration,
            Box::new(move |stack: &mut S, ctx: &mut TaskContext<'_, S>| {
                if let Some(f) = f.take() {
                    f(stack, ctx);
                }
            }),
        )
    }

    /// Producer handle for one of the scheduler's queues.
    #[must_use]
    pub fn queue(&self, id: QueueId) -> QueueHandle<S> {
        self.services.handle(id)
    }

    /// Built-in queue roles.
    #[must_use]
    pub const fn queues(&self) -> &StackQueues {
        &self.services.roles
    }

    /// Logical channels the gateway may write to.
    #[must_use]
    pub const fn lcids(&self) -> &LcidSet {
        &self.services.lcids
    }
}

impl<S: 'static> TaskContext<'_, S> {
    /// Runs `work` on the background pool; `on_result` runs on the loop thread
    /// once the result comes back through the background-result queue.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ResourceExhausted`] if the pool's job queue is full.
    pub fn enqueue_background<R, W, F>(&self, work: W, on_result: F) -> Result<(), SchedulerError>
    where
        R: Send + 'static,
        W: FnOnce(WorkerId) -> R + Send + 'static,
        F: FnOnce(&mut S, &mut TaskContext<'_, S>, Result<R, WorkerFailure>) + Send + 'static,
    {
        self.services.enqueue_background(work, on_result)
    }
}
