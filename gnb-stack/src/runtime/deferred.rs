//! Deferred-task buffer owned by the loop thread.
//!
//! Lets code running on the loop thread schedule more work for the current
//! tick without pushing onto a producer queue (which could block on itself).
//! Tasks deferred while a flush is running run in the next round of the same
//! flush; a round limit catches tasks that keep deferring forever.

use std::collections::VecDeque;

use crate::error::SchedulerError;
use crate::runtime::context::TaskContext;

/// Deferred task; never leaves the loop thread, so it need not be `Send`.
pub type LocalTask<S> = Box<dyn FnOnce(&mut S, &mut TaskContext<'_, S>)>;

/// Append-only buffer flushed to empty before each tick ends.
pub struct DeferredBuffer<S> {
    tasks: VecDeque<LocalTask<S>>,
    /// Round limit per flush.
    max_rounds: usize,
}

impl<S> DeferredBuffer<S> {
    /// Creates an empty buffer allowing `max_rounds` rounds per flush.
    #[must_use]
    pub fn new(max_rounds: usize) -> Self {
        Self {
            tasks: VecDeque::new(),
            max_rounds: max_rounds.max(1),
        }
    }

    /// Appends a task.
    pub fn defer(&mut self, task: LocalTask<S>) {
        self.tasks.push_back(task);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs buffered tasks in FIFO rounds until the buffer stays empty.
    ///
    /// `run` receives each task together with the buffer, so the task can defer
    /// more work into the next round. Returns the number of tasks run.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::DeferralLoopDetected`] once the round limit is
    /// reached with tasks still buffered; those tasks are discarded.
    pub fn flush(
        &mut self,
        mut run: impl FnMut(LocalTask<S>, &mut Self),
    ) -> Result<usize, SchedulerError> {
        let mut executed = 0;
        let mut rounds = 0;
        let mut batch = VecDeque::new();
        while !self.tasks.is_empty() {
            if rounds == self.max_rounds {
                let discarded = self.tasks.len();
                self.tasks.clear();
                return Err(SchedulerError::DeferralLoopDetected { rounds, discarded });
            }
            rounds += 1;
            std::mem::swap(&mut batch, &mut self.tasks);
            while let Some(task) = batch.pop_front() {
                run(task, self);
                executed += 1;
            }
        }
        Ok(executed)
    }
}
