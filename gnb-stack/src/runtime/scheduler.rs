//! One iteration of the tick-driven loop, and the services it shares with
//! producer handles.
//!
//! Each [`Scheduler::run_tick`]:
//!
//! 1. drains the sync queue,
//! 2. drains gateway, MAC, generic and background-result queues, then user
//!    queues in creation order,
//! 3. fires due timers,
//! 4. flushes deferred tasks,
//! 5. calls [`ProtocolStack::run_tti`] and flushes again,
//! 6. advances the tick counter.
//!
//! Queue depths are snapshotted when draining starts: anything pushed after
//! that point, including results of background work finishing mid-drain, runs
//! on the next tick.

use std::num::NonZeroUsize;
use std::sync::Arc;

use minstant::Instant;

use crate::error::SchedulerError;
use crate::interfaces::{LcidSet, ProtocolStack};
use crate::runtime::background::{BackgroundPool, WorkerFailure, WorkerId};
use crate::runtime::config::SchedulerConfig;
use crate::runtime::context::TaskContext;
use crate::runtime::deferred::DeferredBuffer;
use crate::runtime::metrics::{Metrics, MetricsSnapshot};
use crate::runtime::queue::{QueueConfig, QueueHandle, QueueId, QueueSet, QueueSetBuilder};
use crate::runtime::timing::{TickInstant, TickSpan, TimerService, Tti};
use crate::runtime::topology::LoopPlacement;
use crate::trace::{debug, info, trace, warn};

/// Ids of the built-in queues, fixed for the lifetime of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackQueues {
    /// Per-tick radio data; drained first.
    pub sync: QueueId,
    pub gateway: QueueId,
    pub mac: QueueId,
    pub generic: QueueId,
    /// Results of background work.
    pub background: QueueId,
}

/// State shared by the loop thread and every producer handle.
pub(crate) struct Services<S> {
    pub(crate) queues: Arc<QueueSet<S>>,
    pub(crate) roles: StackQueues,
    pub(crate) pool: BackgroundPool,
    pub(crate) lcids: LcidSet,
    pub(crate) metrics: Metrics,
    pub(crate) modulus: u32,
}

impl<S> Services<S> {
    pub(crate) fn handle(&self, id: QueueId) -> QueueHandle<S> {
        QueueHandle::new(Arc::clone(&self.queues), id)
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.queues.all_stats(), self.pool.stats())
    }
}

impl<S: 'static> Services<S> {
    pub(crate) fn enqueue_background<R, W, F>(
        &self,
        work: W,
        on_result: F,
    ) -> Result<(), SchedulerError>
    where
        R: Send + 'static,
        W: FnOnce(WorkerId) -> R + Send + 'static,
        F: FnOnce(&mut S, &mut TaskContext<'_, S>, Result<R, WorkerFailure>) + Send + 'static,
    {
        self.pool
            .submit(self.handle(self.roles.background), work, on_result)
    }
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: TickInstant,
    pub tti: Tti,
    /// Queued tasks executed.
    pub tasks_run: usize,
    pub timers_fired: usize,
    /// Deferred tasks executed across both flushes.
    pub deferred_run: usize,
    /// A deferred flush hit the round limit and discarded tasks.
    pub deferral_aborted: bool,
}

/// Collects configuration and user queues before the scheduler is built.
pub struct SchedulerBuilder<S> {
    config: SchedulerConfig,
    queues: QueueSetBuilder<S>,
    roles: StackQueues,
}

impl<S: 'static> SchedulerBuilder<S> {
    /// Validates `config` and creates the built-in queues.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] if validation fails.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let mut queues = QueueSetBuilder::new();
        let [sync, gateway, mac, generic, background] = config
            .role_queues()
            .map(|(name, queue)| queues.make_queue(name, queue));
        Ok(Self {
            config,
            queues,
            roles: StackQueues {
                sync,
                gateway,
                mac,
                generic,
                background,
            },
        })
    }

    /// Adds a user queue, drained after the built-in ones in creation order.
    pub fn add_queue(&mut self, name: impl Into<String>, config: QueueConfig) -> QueueId {
        self.queues.make_queue(name, config)
    }

    #[must_use]
    pub const fn queues(&self) -> &StackQueues {
        &self.roles
    }

    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Freezes the queues and starts the background pool.
    pub(crate) fn into_parts(
        self,
    ) -> Result<(SchedulerConfig, Arc<Services<S>>, LoopPlacement), SchedulerError> {
        let config = self.config;
        let placement = config
            .cpu
            .resolve(config.reserved_cores, config.background_workers);
        let workers = NonZeroUsize::new(placement.background_workers).unwrap_or(NonZeroUsize::MIN);
        let capacity = NonZeroUsize::new(config.background_capacity).unwrap_or(NonZeroUsize::MIN);
        let pool = BackgroundPool::spawn(workers, capacity, config.idle_park)?;

        let services = Arc::new(Services {
            queues: self.queues.build(),
            roles: self.roles,
            pool,
            lcids: LcidSet::default(),
            metrics: Metrics::default(),
            modulus: config.tti_modulus,
        });
        info!(
            queues = services.queues.len(),
            workers = workers.get(),
            strategy = %placement.strategy,
            loop_core = ?placement.loop_core,
            "scheduler configured"
        );
        Ok((config, services, placement))
    }

    /// Builds a scheduler driven by the calling thread.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Spawn`] if the background pool cannot start.
    pub fn build(self) -> Result<Scheduler<S>, SchedulerError> {
        let (config, services, _) = self.into_parts()?;
        Ok(Scheduler::new(config, services))
    }
}

/// The loop-thread half of the scheduler: owns the timers and the deferred
/// buffer and runs one iteration per tick.
///
/// Not `Send`; build it on the thread that drives it.
pub struct Scheduler<S> {
    config: SchedulerConfig,
    services: Arc<Services<S>>,
    timers: TimerService<S>,
    deferred: DeferredBuffer<S>,
    tick: TickInstant,
    drain_order: Vec<QueueId>,
    /// Per-queue drain budget, reused every tick.
    budgets: Vec<usize>,
}

impl<S> Scheduler<S> {
    pub(crate) fn new(config: SchedulerConfig, services: Arc<Services<S>>) -> Self {
        let capacity = NonZeroUsize::new(config.max_timers).unwrap_or(NonZeroUsize::MIN);
        let drain_order: Vec<QueueId> = services.queues.ids().collect();
        Self {
            timers: TimerService::new(config.timer_wheel_slots, capacity),
            deferred: DeferredBuffer::new(config.max_deferral_rounds),
            tick: TickInstant::default(),
            budgets: vec![0; drain_order.len()],
            drain_order,
            services,
            config,
        }
    }

    /// Tick the next iteration will process.
    #[must_use]
    pub const fn tick(&self) -> TickInstant {
        self.tick
    }

    /// TTI the next iteration will process.
    #[must_use]
    pub const fn tti(&self) -> Tti {
        self.tick.to_tti(self.config.tti_modulus)
    }

    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[must_use]
    pub fn queues(&self) -> &StackQueues {
        &self.services.roles
    }

    /// Producer handle for any queue of this scheduler.
    #[must_use]
    pub fn queue(&self, id: QueueId) -> QueueHandle<S> {
        self.services.handle(id)
    }

    #[must_use]
    pub const fn timers(&self) -> &TimerService<S> {
        &self.timers
    }

    #[must_use]
    pub fn lcids(&self) -> &LcidSet {
        &self.services.lcids
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.services.snapshot()
    }

    /// Moves the tick counter forward to `tti` (forward distance modulo the
    /// TTI modulus). Timers whose deadlines are skipped fire on the next
    /// iteration. Returns the distance.
    pub fn resync(&mut self, tti: Tti) -> u32 {
        let current = self.tti();
        let distance = current.distance_to(tti, self.config.tti_modulus);
        if distance > 0 {
            debug!(from = %current, to = %tti, distance, "tick counter resynchronized");
        }
        self.tick = self.tick.add_span(TickSpan::from(distance));
        distance
    }

    /// Runs `f` with a context for the current tick outside an iteration,
    /// e.g. to create timers while building the stack. Deferred tasks run on
    /// the next iteration.
    pub fn context<R>(&mut self, f: impl FnOnce(&mut TaskContext<'_, S>) -> R) -> R {
        self.timers.begin_tick(self.tick);
        let mut ctx = TaskContext::new(self.tick, &self.timers, &mut self.deferred, &self.services);
        f(&mut ctx)
    }

    /// Stops the background pool and joins its workers.
    pub fn shutdown(&self) {
        self.services.pool.shutdown();
    }
}

impl<S: ProtocolStack> Scheduler<S> {
    /// Runs one loop iteration against `stack`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::FatalSchedulerFault`] if the background pool has
    /// faulted. Deferral loops are reported in the [`TickReport`] instead.
    pub fn run_tick(&mut self, stack: &mut S) -> Result<TickReport, SchedulerError> {
        if self.services.pool.is_faulted() {
            let reason = self
                .services
                .pool
                .fault_reason()
                .unwrap_or_else(|| "background pool faulted".to_owned());
            return Err(SchedulerError::fatal(reason));
        }

        let started = Instant::now();
        let now = self.tick;
        let services: &Services<S> = &self.services;
        let timers = &self.timers;
        let deferred = &mut self.deferred;
        let mut report = TickReport {
            tick: now,
            tti: now.to_tti(services.modulus),
            ..TickReport::default()
        };
        timers.begin_tick(now);

        for (budget, &id) in self.budgets.iter_mut().zip(&self.drain_order) {
            *budget = services.queues.depth(id);
        }
        for (&budget, &id) in self.budgets.iter().zip(&self.drain_order) {
            for task in services.queues.try_pop_n(id, budget) {
                let mut ctx = TaskContext::new(now, timers, deferred, services);
                task(stack, &mut ctx);
                report.tasks_run += 1;
            }
        }

        report.timers_fired = timers.advance_all(now, |callback| {
            let mut ctx = TaskContext::new(now, timers, deferred, services);
            callback(stack, &mut ctx);
        });

        flush_deferred(deferred, timers, services, now, stack, &mut report);
        {
            let mut ctx = TaskContext::new(now, timers, deferred, services);
            stack.run_tti(report.tti, &mut ctx);
        }
        flush_deferred(deferred, timers, services, now, stack, &mut report);

        services.metrics.record_timers(
            timers.armed(),
            timers.allocated(),
            timers.capacity(),
            timers.stats(),
        );
        services.metrics.record_tick(&report, started.elapsed());
        trace!(
            tti = %report.tti,
            tasks = report.tasks_run,
            timers = report.timers_fired,
            deferred = report.deferred_run,
            "tick complete"
        );
        self.tick = now.next();
        Ok(report)
    }
}

fn flush_deferred<S>(
    deferred: &mut DeferredBuffer<S>,
    timers: &TimerService<S>,
    services: &Services<S>,
    now: TickInstant,
    stack: &mut S,
    report: &mut TickReport,
) {
    let flushed = deferred.flush(|task, buffer| {
        let mut ctx = TaskContext::new(now, timers, buffer, services);
        task(stack, &mut ctx);
    });
    match flushed {
        Ok(ran) => report.deferred_run += ran,
        Err(err) => {
            services.metrics.record_deferral_loop();
            report.deferral_aborted = true;
            warn!(tti = %report.tti, error = %err, "deferred flush aborted");
        }
    }
}
