//! Capabilities the scheduler offers to neighbouring layers, and the
//! protocol-stack contract it drives.
//!
//! Inbound interfaces ([`RadioInterface`], [`GatewayInterface`],
//! [`MacInterface`]) are implemented by [`LoopHandle`](crate::LoopHandle) and
//! are safe to call from any thread: they only enqueue. The protocol stack
//! itself implements [`ProtocolStack`] and is only ever touched by the loop
//! thread.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::error::SchedulerError;
use crate::runtime::context::TaskContext;
use crate::runtime::timing::Tti;

/// Data received by the radio for one UE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxDataIndication {
    pub tti: Tti,
    pub rnti: u16,
    pub payload: Bytes,
}

/// Entry points used by the radio layer.
pub trait RadioInterface {
    /// One TTI boundary. Drives exactly one loop iteration while running.
    fn tick_indication(&self, tti: Tti);

    /// Queues received data on the sync queue.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Backpressure`] if the sync queue stays full.
    fn rx_data_indication(&self, indication: RxDataIndication) -> Result<(), SchedulerError>;
}

/// Entry points used by the gateway (user-plane SDUs).
pub trait GatewayInterface {
    /// Queues an SDU for `lcid`. With `blocking` the gateway queue's overflow
    /// policy applies; otherwise a full queue fails immediately.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Backpressure`] if the SDU was not queued.
    fn write_sdu(&self, lcid: u32, sdu: Bytes, blocking: bool) -> Result<(), SchedulerError>;

    /// Whether the stack currently accepts SDUs on `lcid`.
    fn is_lcid_enabled(&self, lcid: u32) -> bool;
}

/// Entry point used by the MAC when PDUs are ready.
pub trait MacInterface {
    /// Queues PDU processing on the MAC queue.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Backpressure`] if the MAC queue rejects the trigger.
    fn process_pdus(&self) -> Result<(), SchedulerError>;
}

/// The protocol layers driven by the scheduler. Every method runs on the loop
/// thread with exclusive access to the stack.
pub trait ProtocolStack: Sized + 'static {
    /// Per-TTI entry point, called once per tick after queues and timers.
    fn run_tti(&mut self, tti: Tti, ctx: &mut TaskContext<'_, Self>);

    /// Handles data queued through [`RadioInterface::rx_data_indication`].
    fn rx_data_indication(&mut self, _indication: RxDataIndication, _ctx: &mut TaskContext<'_, Self>) {}

    /// Handles an SDU queued through [`GatewayInterface::write_sdu`].
    fn write_sdu(&mut self, _lcid: u32, _sdu: Bytes, _ctx: &mut TaskContext<'_, Self>) {}

    /// Handles a trigger queued through [`MacInterface::process_pdus`].
    fn process_pdus(&mut self, _ctx: &mut TaskContext<'_, Self>) {}
}

/// Lock-free bitmap of enabled logical channels (0..64).
///
/// Written by the stack through [`TaskContext::lcids`], read by the gateway.
#[derive(Debug, Default)]
pub struct LcidSet(AtomicU64);

impl LcidSet {
    /// Highest representable LCID plus one.
    pub const CAPACITY: u32 = 64;

    /// Enables `lcid`. `false` if it is out of range.
    pub fn enable(&self, lcid: u32) -> bool {
        let Some(bit) = Self::bit(lcid) else {
            return false;
        };
        self.0.fetch_or(bit, Ordering::AcqRel);
        true
    }

    /// Disables `lcid`.
    pub fn disable(&self, lcid: u32) {
        if let Some(bit) = Self::bit(lcid) {
            self.0.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn is_enabled(&self, lcid: u32) -> bool {
        Self::bit(lcid).is_some_and(|bit| self.0.load(Ordering::Acquire) & bit != 0)
    }

    fn bit(lcid: u32) -> Option<u64> {
        (lcid < Self::CAPACITY).then(|| 1u64 << lcid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcid_bitmap() {
        let set = LcidSet::default();
        assert!(!set.is_enabled(4));
        assert!(set.enable(4));
        assert!(set.enable(63));
        assert!(set.is_enabled(4));
        assert!(set.is_enabled(63));
        set.disable(4);
        assert!(!set.is_enabled(4));
        assert!(!set.enable(64), "out of range");
        assert!(!set.is_enabled(64));
    }
}
