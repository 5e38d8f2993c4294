//! Synchronization primitives for in-process communication.
//!
//! This module provides the lock-free bounded ring used by the task queues
//! and the background job queue.

pub mod ring;

pub use ring::{Ring, Timeout};
