//! Scheduler configuration.
//!
//! # Tuning Guidelines
//!
//! - **Real-time deployment**: short blocking timeouts on the producer queues
//!   so a stalled loop thread shows up as backpressure quickly, a pinned loop
//!   thread and a short idle park.
//! - **Simulation / tests**: unpinned, one background worker, generous
//!   timeouts so slow CI machines do not trip backpressure.
//!
//! Parsing a configuration file is left to the embedder; the struct derives
//! `serde::Deserialize` with `#[serde(default)]` so partial documents work.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::queue::QueueConfig;
use crate::runtime::timing::DEFAULT_TTI_MODULUS;
use crate::runtime::topology::CpuConfig;

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The TTI modulus was zero.
    #[error("tti_modulus must be non-zero")]
    ZeroTtiModulus,
    /// Wheel slots must be a non-zero power of two.
    #[error("timer_wheel_slots must be a power of two, got {0}")]
    WheelSlots(usize),
    /// A count that must be positive was zero.
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    /// Timer ids are 32-bit.
    #[error("max_timers must fit in u32, got {0}")]
    TooManyTimers(usize),
    /// A queue was configured with zero capacity.
    #[error("queue '{0}' must have non-zero capacity")]
    QueueCapacity(&'static str),
    /// The loop thread needs a name.
    #[error("loop_thread_name must not be empty")]
    EmptyThreadName,
}

/// Configuration of the scheduling core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// TTI wrap-around: the radio-visible tick is the internal tick modulo this.
    ///
    /// **Default**: 10240 (one NR hyper-frame of 1024 frames x 10 subframes)
    pub tti_modulus: u32,

    /// Maximum number of concurrently allocated timers.
    ///
    /// **Default**: 4096
    pub max_timers: usize,

    /// Slots in the timer wheel. Timers further out than one lap stay in their
    /// slot and are skipped until due, so this only bounds per-tick work.
    ///
    /// **Default**: 1024
    pub timer_wheel_slots: usize,

    /// Rounds a single deferred-task flush may run before it is aborted.
    ///
    /// **Default**: 64
    pub max_deferral_rounds: usize,

    /// Radio-side synchronization tasks (received data indications).
    pub sync_queue: QueueConfig,
    /// SDUs written by the gateway.
    pub gateway_queue: QueueConfig,
    /// MAC PDU processing triggers.
    pub mac_queue: QueueConfig,
    /// Generic tasks from other layers.
    pub generic_queue: QueueConfig,
    /// Results of background work.
    pub background_queue: QueueConfig,

    /// Background worker count. `None` sizes the pool from the CPU topology.
    pub background_workers: Option<usize>,

    /// Background jobs that may wait for a worker.
    ///
    /// **Default**: 256
    pub background_capacity: usize,

    /// Cores left to other real-time threads when sizing the pool and
    /// choosing the loop core.
    ///
    /// **Default**: 2
    pub reserved_cores: usize,

    /// How long an idle loop thread or worker parks before rechecking.
    ///
    /// **Default**: 1ms
    pub idle_park: Duration,

    /// Name of the loop thread.
    pub loop_thread_name: String,

    /// Loop thread pinning.
    pub cpu: CpuConfig,
}

impl SchedulerConfig {
    /// Configuration for a real-time deployment: pinned loop thread, tight
    /// producer timeouts, 100us idle park.
    #[must_use]
    pub fn realtime() -> Self {
        Self::default()
            .with_sync_queue(QueueConfig::blocking(256, Duration::from_micros(500)))
            .with_gateway_queue(QueueConfig::blocking(1024, Duration::from_millis(5)))
            .with_idle_park(Duration::from_micros(100))
            .with_cpu(CpuConfig::Auto)
    }

    /// Configuration for simulation and tests: unpinned, one background
    /// worker, generous timeouts.
    #[must_use]
    pub fn simulation() -> Self {
        Self::default()
            .with_sync_queue(QueueConfig::blocking(1024, Duration::from_millis(100)))
            .with_gateway_queue(QueueConfig::blocking(1024, Duration::from_millis(100)))
            .with_background_queue(QueueConfig::blocking(256, Duration::from_millis(100)))
            .with_background_workers(Some(1))
            .with_cpu(CpuConfig::Disabled)
    }

    /// Checks every value the scheduler relies on.
    ///
    /// # Errors
    ///
    /// Returns the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tti_modulus == 0 {
            return Err(ConfigError::ZeroTtiModulus);
        }
        if !self.timer_wheel_slots.is_power_of_two() {
            return Err(ConfigError::WheelSlots(self.timer_wheel_slots));
        }
        if self.max_timers == 0 {
            return Err(ConfigError::Zero("max_timers"));
        }
        if u32::try_from(self.max_timers).is_err() {
            return Err(ConfigError::TooManyTimers(self.max_timers));
        }
        if self.max_deferral_rounds == 0 {
            return Err(ConfigError::Zero("max_deferral_rounds"));
        }
        if self.background_capacity == 0 {
            return Err(ConfigError::Zero("background_capacity"));
        }
        if self.background_workers == Some(0) {
            return Err(ConfigError::Zero("background_workers"));
        }
        for (name, queue) in self.role_queues() {
            if queue.capacity == 0 {
                return Err(ConfigError::QueueCapacity(name));
            }
        }
        if self.loop_thread_name.is_empty() {
            return Err(ConfigError::EmptyThreadName);
        }
        Ok(())
    }

    /// Built-in queues in drain order.
    #[must_use]
    pub fn role_queues(&self) -> [(&'static str, QueueConfig); 5] {
        [
            ("sync", self.sync_queue),
            ("gateway", self.gateway_queue),
            ("mac", self.mac_queue),
            ("generic", self.generic_queue),
            ("background", self.background_queue),
        ]
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tti_modulus: DEFAULT_TTI_MODULUS,
            max_timers: 4096,
            timer_wheel_slots: 1024,
            max_deferral_rounds: 64,
            sync_queue: QueueConfig::blocking(256, Duration::from_millis(1)),
            gateway_queue: QueueConfig::blocking(1024, Duration::from_millis(10)),
            mac_queue: QueueConfig::drop_oldest(256),
            generic_queue: QueueConfig::blocking(512, Duration::from_millis(1)),
            background_queue: QueueConfig::blocking(256, Duration::from_millis(10)),
            background_workers: None,
            background_capacity: 256,
            reserved_cores: 2,
            idle_park: Duration::from_millis(1),
            loop_thread_name: "gnb-stack".into(),
            cpu: CpuConfig::Disabled,
        }
    }
}

impl SchedulerConfig {
    /// Builder-style setter for the TTI modulus.
    #[must_use]
    pub fn with_tti_modulus(mut self, modulus: u32) -> Self {
        self.tti_modulus = modulus;
        self
    }

    /// Builder-style setter for the timer capacity.
    #[must_use]
    pub fn with_max_timers(mut self, max: usize) -> Self {
        self.max_timers = max;
        self
    }

    /// Builder-style setter for the wheel size.
    #[must_use]
    pub fn with_timer_wheel_slots(mut self, slots: usize) -> Self {
        self.timer_wheel_slots = slots;
        self
    }

    /// Builder-style setter for the deferral round limit.
    #[must_use]
    pub fn with_max_deferral_rounds(mut self, rounds: usize) -> Self {
        self.max_deferral_rounds = rounds;
        self
    }

    #[must_use]
    pub fn with_sync_queue(mut self, queue: QueueConfig) -> Self {
        self.sync_queue = queue;
        self
    }

    #[must_use]
    pub fn with_gateway_queue(mut self, queue: QueueConfig) -> Self {
        self.gateway_queue = queue;
        self
    }

    #[must_use]
    pub fn with_mac_queue(mut self, queue: QueueConfig) -> Self {
        self.mac_queue = queue;
        self
    }

    #[must_use]
    pub fn with_generic_queue(mut self, queue: QueueConfig) -> Self {
        self.generic_queue = queue;
        self
    }

    #[must_use]
    pub fn with_background_queue(mut self, queue: QueueConfig) -> Self {
        self.background_queue = queue;
        self
    }

    /// Builder-style setter for the background worker count.
    #[must_use]
    pub fn with_background_workers(mut self, workers: Option<usize>) -> Self {
        self.background_workers = workers;
        self
    }

    /// Builder-style setter for the background job capacity.
    #[must_use]
    pub fn with_background_capacity(mut self, capacity: usize) -> Self {
        self.background_capacity = capacity;
        self
    }

    /// Builder-style setter for the reserved real-time cores.
    #[must_use]
    pub fn with_reserved_cores(mut self, cores: usize) -> Self {
        self.reserved_cores = cores;
        self
    }

    /// Builder-style setter for the idle park interval.
    #[must_use]
    pub fn with_idle_park(mut self, park: Duration) -> Self {
        self.idle_park = park;
        self
    }

    /// Builder-style setter for the loop thread name.
    #[must_use]
    pub fn with_loop_thread_name(mut self, name: impl Into<String>) -> Self {
        self.loop_thread_name = name.into();
        self
    }

    /// Builder-style setter for CPU pinning.
    #[must_use]
    pub fn with_cpu(mut self, cpu: CpuConfig) -> Self {
        self.cpu = cpu;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        assert_eq!(SchedulerConfig::default().validate(), Ok(()));
        assert_eq!(SchedulerConfig::realtime().validate(), Ok(()));
        assert_eq!(SchedulerConfig::simulation().validate(), Ok(()));
    }

    #[test]
    fn default_matches_hyper_frame() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tti_modulus, 10240);
        assert_eq!(config.role_queues()[0].0, "sync");
        assert_eq!(config.role_queues()[4].0, "background");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = SchedulerConfig::simulation;
        assert_eq!(
            base().with_tti_modulus(0).validate(),
            Err(ConfigError::ZeroTtiModulus)
        );
        assert_eq!(
            base().with_timer_wheel_slots(1000).validate(),
            Err(ConfigError::WheelSlots(1000))
        );
        assert_eq!(
            base().with_max_deferral_rounds(0).validate(),
            Err(ConfigError::Zero("max_deferral_rounds"))
        );
        assert_eq!(
            base().with_mac_queue(QueueConfig::drop_oldest(0)).validate(),
            Err(ConfigError::QueueCapacity("mac"))
        );
        assert_eq!(
            base().with_background_workers(Some(0)).validate(),
            Err(ConfigError::Zero("background_workers"))
        );
        assert_eq!(
            base().with_loop_thread_name("").validate(),
            Err(ConfigError::EmptyThreadName)
        );
    }
}
