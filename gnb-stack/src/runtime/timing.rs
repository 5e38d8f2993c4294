//! Tick-based timing: coordinate types, the timer wheel and the loop-thread
//! timer service.
//!
//! [`TimerRegistry`] is the plain data structure, generic over its callback
//! type. [`TimerService`] wraps it for the loop thread and hands out
//! [`TimerHandle`]s that release their slot on drop.

mod service;
mod slab;
mod tick;
pub mod wheel;

pub use service::{TimerCallback, TimerHandle, TimerService};
pub use tick::{DEFAULT_TTI_MODULUS, TickInstant, TickSpan, Tti};
pub use wheel::{Due, TimerId, TimerRegistry, TimerState, WheelStats};
