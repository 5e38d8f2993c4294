//! Scheduling runtime.
//!
//! - `timing`: tick coordinates, the timer wheel and timer handles.
//! - `queue`: bounded task queues drained once per tick.
//! - `deferred`: same-tick deferred tasks.
//! - `background`: worker pool whose results re-enter through a queue.
//! - `scheduler`: one tick of the loop.
//! - `stack_loop`: the dedicated loop thread and its producer handle.

pub mod background;
pub mod config;
pub mod context;
pub mod deferred;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod stack_loop;
pub mod timing;
pub mod topology;
