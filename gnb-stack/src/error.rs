//! Error taxonomy for the scheduling core.
//!
//! Everything except [`SchedulerError::FatalSchedulerFault`] is local and
//! recoverable: the caller gets the error, the condition is logged and counted,
//! and the loop keeps running.

use crate::runtime::background::WorkerFailure;
use crate::runtime::config::ConfigError;

/// Errors surfaced by queues, timers, the background pool and the loop.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A fixed capacity (timer slots, background job ring) is used up.
    #[error("{resource} exhausted (capacity {capacity})")]
    ResourceExhausted {
        /// Which resource ran out.
        resource: &'static str,
        /// Configured capacity.
        capacity: usize,
    },
    /// A bounded queue stayed full for the whole push attempt.
    #[error("queue '{queue}' is full")]
    Backpressure {
        /// Name of the queue that rejected the task.
        queue: String,
    },
    /// Deferred tasks kept deferring more work past the round limit.
    #[error("deferral loop detected: {rounds} rounds, {discarded} tasks discarded")]
    DeferralLoopDetected {
        /// Rounds executed before aborting.
        rounds: usize,
        /// Tasks still buffered when the flush was aborted.
        discarded: usize,
    },
    /// A background task failed at the worker boundary.
    #[error(transparent)]
    WorkerFailure(#[from] WorkerFailure),
    /// Unrecoverable invariant violation; the loop terminates.
    #[error("fatal scheduler fault: {reason}")]
    FatalSchedulerFault {
        /// What went wrong.
        reason: String,
    },
    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// Operation not valid in the current loop/pool state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Spawning a thread failed.
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        /// Thread name.
        name: String,
        /// Underlying OS error.
        source: std::io::Error,
    },
}

impl SchedulerError {
    /// Creates a fatal fault with the given reason.
    pub(crate) fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalSchedulerFault {
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that terminate the stack.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalSchedulerFault { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fatal_fault_is_fatal() {
        assert!(SchedulerError::fatal("loop thread gone").is_fatal());
        assert!(
            !SchedulerError::Backpressure {
                queue: "gateway".into()
            }
            .is_fatal()
        );
        assert!(
            !SchedulerError::DeferralLoopDetected {
                rounds: 3,
                discarded: 1
            }
            .is_fatal()
        );
    }

    #[test]
    fn worker_failure_converts_and_stays_local() {
        use crate::runtime::background::WorkerId;

        fn unwrap_result(result: Result<u64, WorkerFailure>) -> Result<u64, SchedulerError> {
            Ok(result?)
        }

        let failure = WorkerFailure {
            worker: WorkerId(1),
            message: "decoder exploded".into(),
        };
        let err = unwrap_result(Err(failure.clone())).unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(&err, SchedulerError::WorkerFailure(f) if *f == failure));
        assert_eq!(
            err.to_string(),
            "background task failed on gnb-bg-1: decoder exploded"
        );
        assert_eq!(unwrap_result(Ok(7)).unwrap(), 7);
    }

    #[test]
    fn messages_name_the_resource() {
        let err = SchedulerError::ResourceExhausted {
            resource: "timers",
            capacity: 8,
        };
        assert_eq!(err.to_string(), "timers exhausted (capacity 8)");
    }
}
