//! Task scheduling core for a gNB L2/L3 protocol stack.
//!
//! One loop thread owns the protocol stack and advances once per radio tick
//! indication: it drains a fixed set of bounded task queues in priority
//! order, fires due timers, flushes same-tick deferred tasks and finally calls
//! [`ProtocolStack::run_tti`]. Other threads only ever enqueue. Work too slow
//! for the tick path goes to a background pool whose results come back
//! through a queue.
//!
//! ```no_run
//! use gnb_stack::{
//!     ProtocolStack, RadioInterface, SchedulerBuilder, SchedulerConfig, TaskContext, Tti,
//! };
//!
//! struct Stack;
//!
//! impl ProtocolStack for Stack {
//!     fn run_tti(&mut self, _tti: Tti, _ctx: &mut TaskContext<'_, Self>) {}
//! }
//!
//! # fn main() -> Result<(), gnb_stack::SchedulerError> {
//! let stack_loop = SchedulerBuilder::new(SchedulerConfig::simulation())?.spawn(|_| Stack)?;
//! let radio = stack_loop.handle();
//! stack_loop.start()?;
//! radio.tick_indication(Tti::new(0));
//! stack_loop.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod interfaces;
pub mod runtime;
pub mod sync;
pub mod trace;

pub use error::SchedulerError;
pub use interfaces::{
    GatewayInterface, LcidSet, MacInterface, ProtocolStack, RadioInterface, RxDataIndication,
};
pub use runtime::background::{BackgroundPool, PoolStats, WorkerFailure, WorkerId};
pub use runtime::config::{ConfigError, SchedulerConfig};
pub use runtime::context::TaskContext;
pub use runtime::deferred::{DeferredBuffer, LocalTask};
pub use runtime::metrics::{MetricsSnapshot, TimerGauge};
pub use runtime::queue::{
    OverflowPolicy, QueueConfig, QueueHandle, QueueId, QueueSet, QueueSetBuilder, QueueStats, Task,
};
pub use runtime::scheduler::{Scheduler, SchedulerBuilder, StackQueues, TickReport};
pub use runtime::stack_loop::{LoopHandle, LoopState, StackLoop};
pub use runtime::timing::{
    TickInstant, TickSpan, TimerHandle, TimerId, TimerService, TimerState, Tti,
};
pub use runtime::topology::{CpuConfig, PlacementStrategy};
pub use sync::Timeout;
pub use trace::init_tracing;
