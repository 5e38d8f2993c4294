//! Lock-free counters published by the loop thread, readable from any thread.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::runtime::background::PoolStats;
use crate::runtime::queue::QueueStats;
use crate::runtime::scheduler::TickReport;
use crate::runtime::timing::WheelStats;

/// Timer occupancy as last published by the loop thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimerGauge {
    pub armed: usize,
    pub allocated: usize,
    pub capacity: usize,
    pub high_water: usize,
    pub max_fired_per_tick: usize,
    pub max_slot_depth: usize,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// TTI of the last completed tick.
    pub tti: u32,
    /// Completed loop iterations.
    pub ticks: u64,
    /// Tick indications that arrived before the previous one was processed.
    pub overruns: u64,
    /// Tick indications received while the loop was not running.
    pub ticks_ignored: u64,
    pub tasks_run: u64,
    pub timers_fired: u64,
    pub deferred_run: u64,
    /// Deferred flushes aborted by the round limit.
    pub deferral_loops: u64,
    pub last_tick_latency_ns: u64,
    pub max_tick_latency_ns: u64,
    pub timers: TimerGauge,
    pub queues: Vec<QueueStats>,
    pub pool: PoolStats,
}

/// Counters shared between the loop thread and every handle.
#[derive(Debug, Default)]
pub struct Metrics {
    tti: AtomicU32,
    ticks: AtomicU64,
    overruns: AtomicU64,
    ticks_ignored: AtomicU64,
    tasks_run: AtomicU64,
    timers_fired: AtomicU64,
    deferred_run: AtomicU64,
    deferral_loops: AtomicU64,
    last_tick_latency_ns: AtomicU64,
    max_tick_latency_ns: AtomicU64,
    timers_armed: AtomicUsize,
    timers_allocated: AtomicUsize,
    timers_capacity: AtomicUsize,
    timer_high_water: AtomicUsize,
    max_fired_per_tick: AtomicUsize,
    max_slot_depth: AtomicUsize,
}

impl Metrics {
    pub(crate) fn record_tick(&self, report: &TickReport, latency: Duration) {
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.tti.store(report.tti.get(), Ordering::Relaxed);
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.tasks_run
            .fetch_add(report.tasks_run as u64, Ordering::Relaxed);
        self.timers_fired
            .fetch_add(report.timers_fired as u64, Ordering::Relaxed);
        self.deferred_run
            .fetch_add(report.deferred_run as u64, Ordering::Relaxed);
        self.last_tick_latency_ns.store(ns, Ordering::Relaxed);
        self.max_tick_latency_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub(crate) fn record_timers(&self, armed: usize, allocated: usize, capacity: usize, stats: WheelStats) {
        self.timers_armed.store(armed, Ordering::Relaxed);
        self.timers_allocated.store(allocated, Ordering::Relaxed);
        self.timers_capacity.store(capacity, Ordering::Relaxed);
        self.timer_high_water
            .store(stats.high_water, Ordering::Relaxed);
        self.max_fired_per_tick
            .store(stats.max_fired_per_tick, Ordering::Relaxed);
        self.max_slot_depth
            .store(stats.max_slot_depth, Ordering::Relaxed);
    }

    pub(crate) fn record_overrun(&self) -> u64 {
        self.overruns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_ignored(&self) {
        self.ticks_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deferral_loop(&self) {
        self.deferral_loops.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed loop iterations.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Combines the counters with queue and pool statistics.
    #[must_use]
    pub fn snapshot(&self, queues: Vec<QueueStats>, pool: PoolStats) -> MetricsSnapshot {
        MetricsSnapshot {
            tti: self.tti.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            ticks_ignored: self.ticks_ignored.load(Ordering::Relaxed),
            tasks_run: self.tasks_run.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            deferred_run: self.deferred_run.load(Ordering::Relaxed),
            deferral_loops: self.deferral_loops.load(Ordering::Relaxed),
            last_tick_latency_ns: self.last_tick_latency_ns.load(Ordering::Relaxed),
            max_tick_latency_ns: self.max_tick_latency_ns.load(Ordering::Relaxed),
            timers: TimerGauge {
                armed: self.timers_armed.load(Ordering::Relaxed),
                allocated: self.timers_allocated.load(Ordering::Relaxed),
                capacity: self.timers_capacity.load(Ordering::Relaxed),
                high_water: self.timer_high_water.load(Ordering::Relaxed),
                max_fired_per_tick: self.max_fired_per_tick.load(Ordering::Relaxed),
                max_slot_depth: self.max_slot_depth.load(Ordering::Relaxed),
            },
            queues,
            pool,
        }
    }
}
