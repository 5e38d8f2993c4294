//! Dedicated loop thread driven by radio tick indications.
//!
//! [`SchedulerBuilder::spawn`] starts one named thread that owns the
//! [`Scheduler`] and the protocol stack. Every tick indication received while
//! the loop is running produces exactly one [`Scheduler::run_tick`]; the loop
//! parks between ticks.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped --start--> Running --stop--> Stopping --> Stopped
//!    \                  |
//!     +---shutdown------+--fatal fault--> Terminated
//! ```
//!
//! Tick indications arriving while the loop is not running are ignored and
//! counted. After a restart the first tick resynchronizes the counter with
//! the radio, so timers that expired while stopped fire on that tick.
//!
//! Dropping [`StackLoop`] signals the loop thread but does not join it. Use
//! [`StackLoop::shutdown`] to wait.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::error::SchedulerError;
use crate::interfaces::{
    GatewayInterface, LcidSet, MacInterface, ProtocolStack, RadioInterface, RxDataIndication,
};
use crate::runtime::background::{WorkerFailure, WorkerId, panic_message};
use crate::runtime::config::SchedulerConfig;
use crate::runtime::context::TaskContext;
use crate::runtime::metrics::MetricsSnapshot;
use crate::runtime::queue::{QueueHandle, QueueId, Task};
use crate::runtime::scheduler::{Scheduler, SchedulerBuilder, Services, StackQueues};
use crate::runtime::timing::Tti;
use crate::runtime::topology::pin_to_core;
use crate::trace::{debug, error, info, trace, warn};

/// Lifecycle state of the loop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum LoopState {
    /// Tick indications are ignored.
    Stopped = 0,
    /// Every tick indication runs one iteration.
    Running = 1,
    /// Finishing the current iteration before stopping.
    Stopping = 2,
    /// The loop thread has exited.
    Terminated = 3,
}

impl LoopState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Stopped,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Terminated,
        }
    }
}

const NO_TTI: u64 = u64::MAX;

/// Shared between the loop thread, [`StackLoop`] and every [`LoopHandle`].
struct Control {
    state: AtomicU8,
    /// Guards state transitions that others wait on.
    lock: Mutex<()>,
    changed: Condvar,
    /// Tick indications not processed yet.
    pending: AtomicU64,
    /// Set by `start`; the next iteration realigns with the radio.
    resync: AtomicBool,
    /// TTI of the first indication after `start`, or [`NO_TTI`].
    first_tti: AtomicU64,
    terminate: AtomicBool,
    initialized: AtomicBool,
    thread: OnceLock<Thread>,
    fault: Mutex<Option<String>>,
}

impl Control {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(LoopState::Stopped as u8),
            lock: Mutex::new(()),
            changed: Condvar::new(),
            pending: AtomicU64::new(0),
            resync: AtomicBool::new(false),
            first_tti: AtomicU64::new(NO_TTI),
            terminate: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            thread: OnceLock::new(),
            fault: Mutex::new(None),
        }
    }

    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, state: LoopState) {
        let _guard = self.guard();
        self.state.store(state as u8, Ordering::Release);
        self.changed.notify_all();
    }

    fn mark_initialized(&self) {
        let _guard = self.guard();
        self.initialized.store(true, Ordering::Release);
        self.changed.notify_all();
    }

    fn record_fault(&self, reason: String) {
        error!(reason = %reason, "loop thread fault");
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(reason);
    }

    fn fault(&self) -> Option<String> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fatal(&self) -> SchedulerError {
        SchedulerError::fatal(
            self.fault()
                .unwrap_or_else(|| "loop thread terminated".to_owned()),
        )
    }

    fn wake(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

impl<S: ProtocolStack> SchedulerBuilder<S> {
    /// Starts the loop thread. `factory` builds the protocol stack on that
    /// thread, with a context for creating timers. The loop starts
    /// [`Stopped`](LoopState::Stopped).
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Spawn`] if a thread cannot be created.
    /// - [`SchedulerError::FatalSchedulerFault`] if `factory` panics.
    pub fn spawn<F>(self, factory: F) -> Result<StackLoop<S>, SchedulerError>
    where
        F: FnOnce(&mut TaskContext<'_, S>) -> S + Send + 'static,
    {
        let (config, services, placement) = self.into_parts()?;
        let control = Arc::new(Control::new());
        let name = config.loop_thread_name.clone();
        let idle_park = config.idle_park;

        debug!(name = %name, "spawning loop thread");
        let thread_control = Arc::clone(&control);
        let thread_services = Arc::clone(&services);
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let control = thread_control;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(core) = placement.loop_core {
                    if pin_to_core(core) {
                        info!(core, "loop thread pinned");
                    } else {
                        warn!(core, "failed to pin loop thread, running unpinned");
                    }
                }
                let mut scheduler = Scheduler::new(config, thread_services);
                let mut stack = scheduler.context(factory);
                control.mark_initialized();
                run_loop(&control, &mut scheduler, &mut stack, idle_park);
            }));
            if let Err(payload) = outcome {
                control.record_fault(format!(
                    "loop thread panicked: {}",
                    panic_message(payload.as_ref())
                ));
            }
            control.transition(LoopState::Terminated);
        });

        let join = match spawned {
            Ok(join) => join,
            Err(source) => {
                services.pool.shutdown();
                return Err(SchedulerError::Spawn { name, source });
            }
        };
        let _ = control.thread.set(join.thread().clone());

        let guard = control.guard();
        let guard = control
            .changed
            .wait_while(guard, |_| {
                !control.initialized.load(Ordering::Acquire)
                    && control.state() != LoopState::Terminated
            })
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);

        if !control.initialized.load(Ordering::Acquire) {
            let _ = join.join();
            services.pool.shutdown();
            return Err(control.fatal());
        }
        info!(name = %name, "loop thread ready");

        Ok(StackLoop {
            control,
            services,
            join: Some(join),
        })
    }
}

fn run_loop<S: ProtocolStack>(
    control: &Control,
    scheduler: &mut Scheduler<S>,
    stack: &mut S,
    idle_park: Duration,
) {
    while !control.terminate.load(Ordering::Acquire) {
        match control.state() {
            LoopState::Running => {
                if control.pending.load(Ordering::Acquire) == 0 {
                    thread::park_timeout(idle_park);
                    continue;
                }
                if control.resync.load(Ordering::Acquire) {
                    let first = control.first_tti.load(Ordering::Acquire);
                    let Ok(tti) = u32::try_from(first) else {
                        // Counted by an indication that raced with `start` and
                        // carried no TTI; wait for one that does.
                        control.pending.fetch_sub(1, Ordering::AcqRel);
                        trace!("stale tick indication dropped before resync");
                        continue;
                    };
                    control.resync.store(false, Ordering::Release);
                    scheduler.resync(Tti::new(tti));
                }
                if let Err(err) = scheduler.run_tick(stack) {
                    control.record_fault(err.to_string());
                    break;
                }
                control.pending.fetch_sub(1, Ordering::AcqRel);
            }
            LoopState::Stopping => {
                control.pending.store(0, Ordering::Release);
                control.transition(LoopState::Stopped);
                info!(tti = %scheduler.tti(), "loop stopped");
            }
            LoopState::Stopped => thread::park_timeout(idle_park),
            LoopState::Terminated => break,
        }
    }
    debug!(tti = %scheduler.tti(), "loop thread exiting");
}

/// Owner of the loop thread.
pub struct StackLoop<S> {
    control: Arc<Control>,
    services: Arc<Services<S>>,
    join: Option<JoinHandle<()>>,
}

impl<S: ProtocolStack> StackLoop<S> {
    /// Shorthand for [`SchedulerBuilder::new`] followed by
    /// [`SchedulerBuilder::spawn`], for stacks without user queues.
    ///
    /// # Errors
    ///
    /// See [`SchedulerBuilder::new`] and [`SchedulerBuilder::spawn`].
    pub fn spawn<F>(config: SchedulerConfig, factory: F) -> Result<Self, SchedulerError>
    where
        F: FnOnce(&mut TaskContext<'_, S>) -> S + Send + 'static,
    {
        SchedulerBuilder::new(config)?.spawn(factory)
    }
}

impl<S> StackLoop<S> {
    /// Lets tick indications drive the loop.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::InvalidState`] if the loop is not stopped.
    /// - [`SchedulerError::FatalSchedulerFault`] if the loop thread is gone.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let _guard = self.control.guard();
        match self.control.state() {
            LoopState::Stopped => {}
            LoopState::Running => return Err(SchedulerError::InvalidState("loop already running")),
            LoopState::Stopping => return Err(SchedulerError::InvalidState("loop is stopping")),
            LoopState::Terminated => return Err(self.control.fatal()),
        }
        self.control.pending.store(0, Ordering::Release);
        self.control.first_tti.store(NO_TTI, Ordering::Release);
        self.control.resync.store(true, Ordering::Release);
        self.control
            .state
            .store(LoopState::Running as u8, Ordering::Release);
        self.control.changed.notify_all();
        self.control.wake();
        info!("loop started");
        Ok(())
    }

    /// Stops processing ticks once the current iteration finishes, and waits
    /// for it. Stopping a stopped loop is a no-op.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::FatalSchedulerFault`] if the loop thread is gone.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let guard = self.control.guard();
        match self.control.state() {
            LoopState::Running => {
                self.control
                    .state
                    .store(LoopState::Stopping as u8, Ordering::Release);
                self.control.wake();
            }
            LoopState::Stopping => {}
            LoopState::Stopped => return Ok(()),
            LoopState::Terminated => return Err(self.control.fatal()),
        }
        let guard = self
            .control
            .changed
            .wait_while(guard, |_| self.control.state() == LoopState::Stopping)
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        match self.control.state() {
            LoopState::Terminated => Err(self.control.fatal()),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        self.control.state()
    }

    /// Cloneable producer handle implementing the inbound interfaces.
    #[must_use]
    pub fn handle(&self) -> LoopHandle<S> {
        LoopHandle {
            control: Arc::clone(&self.control),
            services: Arc::clone(&self.services),
        }
    }

    #[must_use]
    pub fn queues(&self) -> &StackQueues {
        &self.services.roles
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.services.snapshot()
    }

    /// Stops the loop thread, joins it, then shuts the background pool down.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::FatalSchedulerFault`] if the loop thread panicked or
    /// terminated on a fatal fault.
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        info!("loop shutdown initiated");
        self.control.terminate.store(true, Ordering::Release);
        self.control.wake();
        let joined = self.join.take().map(JoinHandle::join);
        self.services.pool.shutdown();
        info!("loop shutdown complete");

        if let Some(Err(payload)) = joined {
            return Err(SchedulerError::fatal(format!(
                "loop thread panicked: {}",
                panic_message(payload.as_ref())
            )));
        }
        match self.control.fault() {
            Some(reason) => Err(SchedulerError::fatal(reason)),
            None => Ok(()),
        }
    }
}

impl<S> Drop for StackLoop<S> {
    fn drop(&mut self) {
        // Signal only; see `shutdown` for a joining variant.
        self.control.terminate.store(true, Ordering::Release);
        self.control.wake();
    }
}

/// Cloneable, thread-safe entry point into a running [`StackLoop`].
pub struct LoopHandle<S> {
    control: Arc<Control>,
    services: Arc<Services<S>>,
}

impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
            services: Arc::clone(&self.services),
        }
    }
}

impl<S> LoopHandle<S> {
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.control.state()
    }

    /// Producer handle for any queue of the scheduler.
    #[must_use]
    pub fn queue(&self, id: QueueId) -> QueueHandle<S> {
        self.services.handle(id)
    }

    #[must_use]
    pub fn queues(&self) -> &StackQueues {
        &self.services.roles
    }

    /// Pushes a task onto `id`, applying the queue's overflow policy.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Backpressure`] if the queue rejects the task.
    pub fn push<F>(&self, id: QueueId, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&mut S, &mut TaskContext<'_, S>) + Send + 'static,
    {
        self.services.queues.push(id, Box::new(f))
    }

    #[must_use]
    pub fn lcids(&self) -> &LcidSet {
        &self.services.lcids
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.services.snapshot()
    }

    fn backpressure(&self, id: QueueId) -> SchedulerError {
        SchedulerError::Backpressure {
            queue: self.services.queues.name(id).unwrap_or_default().to_owned(),
        }
    }
}

impl<S: 'static> LoopHandle<S> {
    /// Runs `work` on the background pool; `on_result` runs on the loop thread.
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

impl<S: ProtocolStack> RadioInterface for LoopHandle<S> {
    fn tick_indication(&self, tti: Tti) {
        if self.control.state() != LoopState::Running {
            self.services.metrics.record_ignored();
            trace!(tti = %tti, "tick ignored, loop not running");
            return;
        }
        if self.control.resync.load(Ordering::Acquire) {
            let _ = self.control.first_tti.compare_exchange(
                NO_TTI,
                u64::from(tti.get()),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        let previous = self.control.pending.fetch_add(1, Ordering::AcqRel);
        if previous > 0 {
            let overruns = self.services.metrics.record_overrun();
            warn!(tti = %tti, pending = previous + 1, overruns, "tick overrun");
        }
        self.control.wake();
    }

    fn rx_data_indication(&self, indication: RxDataIndication) -> Result<(), SchedulerError> {
        self.services.queues.push(
            self.services.roles.sync,
            Box::new(move |stack: &mut S, ctx: &mut TaskContext<'_, S>| {
                stack.rx_data_indication(indication, ctx);
            }),
        )
    }
}

impl<S: ProtocolStack> GatewayInterface for LoopHandle<S> {
    fn write_sdu(&self, lcid: u32, sdu: Bytes, blocking: bool) -> Result<(), SchedulerError> {
        let id = self.services.roles.gateway;
        let task: Task<S> = Box::new(move |stack: &mut S, ctx: &mut TaskContext<'_, S>| {
            stack.write_sdu(lcid, sdu, ctx);
        });
        if blocking {
            self.services.queues.push(id, task)
        } else {
            self.services
                .queues
                .try_push(id, task)
                .map_err(|_| self.backpressure(id))
        }
    }

    fn is_lcid_enabled(&self, lcid: u32) -> bool {
        self.services.lcids.is_enabled(lcid)
    }
}

impl<S: ProtocolStack> MacInterface for LoopHandle<S> {
    fn process_pdus(&self) -> Result<(), SchedulerError> {
        self.services.queues.push(
            self.services.roles.mac,
            Box::new(|stack: &mut S, ctx: &mut TaskContext<'_, S>| stack.process_pdus(ctx)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct Counter {
        ttis: Vec<u32>,
    }

    impl ProtocolStack for Counter {
        fn run_tti(&mut self, tti: Tti, _ctx: &mut TaskContext<'_, Self>) {
            self.ttis.push(tti.get());
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn spawn() -> StackLoop<Counter> {
        StackLoop::spawn(SchedulerConfig::simulation(), |_| Counter::default()).unwrap()
    }

    #[test]
    fn state_transitions() {
        let stack_loop = spawn();
        assert_eq!(stack_loop.state(), LoopState::Stopped);
        stack_loop.stop().unwrap();
        stack_loop.start().unwrap();
        assert_eq!(stack_loop.state(), LoopState::Running);
        assert!(matches!(
            stack_loop.start(),
            Err(SchedulerError::InvalidState(_))
        ));
        stack_loop.stop().unwrap();
        assert_eq!(stack_loop.state(), LoopState::Stopped);
        stack_loop.shutdown().unwrap();
    }

    #[test]
    fn ticks_while_stopped_are_ignored() {
        let stack_loop = spawn();
        let handle = stack_loop.handle();
        handle.tick_indication(Tti::new(1));
        handle.tick_indication(Tti::new(2));
        assert_eq!(stack_loop.metrics().ticks_ignored, 2);
        assert_eq!(stack_loop.metrics().ticks, 0);
        stack_loop.shutdown().unwrap();
    }

    #[test]
    fn each_indication_runs_one_tick() {
        let stack_loop = spawn();
        let handle = stack_loop.handle();
        stack_loop.start().unwrap();
        for tti in 40..45 {
            handle.tick_indication(Tti::new(tti));
            wait_for(|| stack_loop.metrics().ticks == u64::from(tti - 39));
        }
        assert_eq!(stack_loop.metrics().tti, 44);
        stack_loop.shutdown().unwrap();
    }

    #[test]
    fn indication_racing_start_does_not_skip_resync() {
        let stack_loop = spawn();
        let handle = stack_loop.handle();
        stack_loop.start().unwrap();

        // Passed the running check before a restart, counted after it.
        stack_loop.control.pending.fetch_add(1, Ordering::AcqRel);
        stack_loop.control.wake();
        wait_for(|| stack_loop.control.pending.load(Ordering::Acquire) == 0);
        assert_eq!(stack_loop.metrics().ticks, 0);

        handle.tick_indication(Tti::new(70));
        wait_for(|| stack_loop.metrics().ticks == 1);
        assert_eq!(stack_loop.metrics().tti, 70);
        stack_loop.shutdown().unwrap();
    }

    #[test]
    fn factory_panic_is_fatal() {
        let result = SchedulerBuilder::<Counter>::new(SchedulerConfig::simulation())
            .unwrap()
            .spawn(|_| panic!("stack init failed"));
        match result {
            Err(err) => assert!(err.is_fatal()),
            Ok(_) => panic!("spawn should fail"),
        }
    }
}
