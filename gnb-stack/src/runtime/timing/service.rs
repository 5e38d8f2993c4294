//! Loop-thread timer service and move-only timer handles.
//!
//! The registry is shared between the scheduler and every live
//! [`TimerHandle`] through an `Rc<RefCell<_>>`, so neither the service nor the
//! handles are `Send`: timers only exist on the loop thread. Borrows of the
//! registry are short and never span user code; callbacks run with the borrow
//! released and any callback evicted from the registry is dropped after the
//! borrow ends, since callbacks may own other handles.

use core::cell::RefCell;
use core::fmt;
use core::num::NonZeroUsize;
use std::rc::{Rc, Weak};

use crate::error::SchedulerError;
use crate::runtime::context::TaskContext;
use crate::runtime::timing::tick::{TickInstant, TickSpan};
use crate::runtime::timing::wheel::{Due, TimerId, TimerRegistry, TimerState, WheelStats};

/// Timer callback; runs on the loop thread each time the timer fires.
pub type TimerCallback<S> = Box<dyn FnMut(&mut S, &mut TaskContext<'_, S>)>;

type Registry<S> = TimerRegistry<TimerCallback<S>>;

/// Owner of the timer registry on the loop thread.
pub struct TimerService<S> {
    registry: Rc<RefCell<Registry<S>>>,
    /// Reused due-set buffer.
    due: RefCell<Vec<Due>>,
}

impl<S> TimerService<S> {
    /// Creates the service with `slots` wheel slots and `capacity` timers.
    #[must_use]
    pub fn new(slots: usize, capacity: NonZeroUsize) -> Self {
        Self {
            registry: Rc::new(RefCell::new(TimerRegistry::new(slots, capacity))),
            due: RefCell::new(Vec::with_capacity(capacity.get().min(1024))),
        }
    }

    /// Allocates an idle timer.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ResourceExhausted`] when every slot is in use.
    pub fn create(&self) -> Result<TimerHandle<S>, SchedulerError> {
        let mut registry = self.registry.borrow_mut();
        let id = registry
            .alloc(false)
            .ok_or(SchedulerError::ResourceExhausted {
                resource: "timers",
                capacity: registry.capacity(),
            })?;
        Ok(TimerHandle {
            registry: Rc::downgrade(&self.registry),
            id,
        })
    }

    /// Arms a handle-less one-shot timer; its slot is freed after it fires.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ResourceExhausted`] when every slot is in use.
    pub fn create_detached(
        &self,
        duration: u32,
        callback: TimerCallback<S>,
    ) -> Result<TimerId, SchedulerError> {
        let outcome = {
            let mut registry = self.registry.borrow_mut();
            match registry.alloc(true) {
                Some(id) => Ok((id, registry.set(id, TickSpan::from(duration), callback))),
                None => Err(registry.capacity()),
            }
        };
        match outcome {
            Ok((id, _)) => Ok(id),
            Err(capacity) => Err(SchedulerError::ResourceExhausted {
                resource: "timers",
                capacity,
            }),
        }
    }

    /// Rearms `id` with its stored duration. `false` if stale or never set.
    pub fn run(&self, id: TimerId) -> bool {
        self.registry.borrow_mut().run(id)
    }

    /// Disarms `id` without releasing it.
    pub fn stop(&self, id: TimerId) -> bool {
        self.registry.borrow_mut().stop(id)
    }

    #[must_use]
    pub fn state(&self, id: TimerId) -> Option<TimerState> {
        self.registry.borrow().state(id)
    }

    /// Timers linked into the wheel.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.registry.borrow().armed()
    }

    /// Allocated timer slots.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.registry.borrow().allocated()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.registry.borrow().capacity()
    }

    #[must_use]
    pub fn stats(&self) -> WheelStats {
        self.registry.borrow().stats()
    }

    /// Sets the base tick for timers armed during this tick.
    pub(crate) fn begin_tick(&self, now: TickInstant) {
        self.registry.borrow_mut().begin_tick(now);
    }

    /// Fires every timer due at or before `now` through `fire`, in
    /// `(deadline, arm order)` order. Returns the number fired.
    ///
    /// A timer released, stopped or rearmed by an earlier callback of the same
    /// advance does not fire.
    pub(crate) fn advance_all(
        &self,
        now: TickInstant,
        mut fire: impl FnMut(&mut TimerCallback<S>),
    ) -> usize {
        let mut due = self.due.take();
        self.registry.borrow_mut().collect_due(now, &mut due);
        let mut fired = 0;
        for entry in &due {
            let callback = self.registry.borrow_mut().take_for_fire(entry);
            let Some(mut callback) = callback else {
                continue;
            };
            fire(&mut callback);
            fired += 1;
            let orphan = self.registry.borrow_mut().finish_fire(entry, callback);
            drop(orphan);
        }
        due.clear();
        *self.due.borrow_mut() = due;
        fired
    }
}

/// Move-only handle to one timer slot. Dropping it cancels the timer and frees
/// the slot.
pub struct TimerHandle<S> {
    registry: Weak<RefCell<Registry<S>>>,
    id: TimerId,
}

impl<S> TimerHandle<S> {
    /// Identity of the slot, usable with [`TimerService::run`] from inside
    /// the callback.
    #[must_use]
    pub const fn id(&self) -> TimerId {
        self.id
    }

    /// Sets the duration (in ticks) and callback, and arms the timer.
    ///
    /// Rearming an armed timer moves its deadline. Returns `false` if the
    /// scheduler is gone.
    pub fn set<F>(&mut self, duration: u32, callback: F) -> bool
    where
        F: FnMut(&mut S, &mut TaskContext<'_, S>) + 'static,
    {
        let outcome = self.with(|registry| {
            registry.set(self.id, TickSpan::from(duration), Box::new(callback))
        });
        matches!(outcome, Some(Ok(_)))
    }

    /// Rearms with the stored duration. `false` if never set.
    pub fn run(&mut self) -> bool {
        self.with(|registry| registry.run(self.id)).unwrap_or(false)
    }

    /// Disarms without releasing the slot.
    pub fn stop(&mut self) -> bool {
        self.with(|registry| registry.stop(self.id)).unwrap_or(false)
    }

    /// A duration and callback have been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.duration().is_some()
    }

    /// Armed and not fired yet.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            Some(TimerState::Armed | TimerState::Firing)
        )
    }

    /// Fired and not rearmed since.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.state() == Some(TimerState::Expired)
    }

    /// Stored duration in ticks.
    #[must_use]
    pub fn duration(&self) -> Option<u32> {
        self.with(|registry| registry.duration(self.id))
            .flatten()
            .map(|span| u32::try_from(span.get()).unwrap_or(u32::MAX))
    }

    #[must_use]
    pub fn state(&self) -> Option<TimerState> {
        self.with(|registry| registry.state(self.id)).flatten()
    }

    /// Cancels and frees the slot.
    pub fn release(self) {}

    fn with<R>(&self, f: impl FnOnce(&mut Registry<S>) -> R) -> Option<R> {
        let registry = self.registry.upgrade()?;
        let result = f(&mut registry.borrow_mut());
        Some(result)
    }
}

impl<S> Drop for TimerHandle<S> {
    fn drop(&mut self) {
        let orphan = self.with(|registry| registry.release(self.id));
        drop(orphan);
    }
}

impl<S> fmt::Debug for TimerHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").field("id", &self.id).finish()
    }
}
