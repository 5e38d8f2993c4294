//! CPU topology detection and placement for the loop thread and the
//! background pool.
//!
//! # Placement Strategy
//!
//! - The **loop thread** is latency critical: every tick drains all queues and
//!   fires the due timers. It gets a core of its own when one is available.
//! - **Background workers** take what is left after the loop thread and the
//!   cores reserved for other real-time threads (radio, PHY workers), with a
//!   floor of one worker. They are never pinned.
//!
//! # Detection
//!
//! Uses `num_cpus` for physical/logical core counts and `core_affinity` for
//! pinning. On most systems, core IDs 0..N map to separate physical cores
//! before SMT siblings are enumerated.

use core_affinity::CoreId;
use serde::{Deserialize, Serialize};

/// CPU topology information detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Total logical cores (including SMT/hyperthreads).
    pub logical_cores: usize,
    /// Total physical cores.
    pub physical_cores: usize,
    /// Whether SMT (hyperthreading) is enabled.
    pub has_smt: bool,
    /// Available core IDs for pinning.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Detects the CPU topology of the current system.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        let has_smt = logical_cores > physical_cores;

        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            has_smt,
            available_cores,
        }
    }

    /// Chooses a core for the loop thread and sizes the background pool.
    ///
    /// `reserved` cores (the lowest ids) are left to other real-time threads;
    /// the loop thread takes the next one.
    #[must_use]
    pub fn select_placement(&self, reserved: usize) -> LoopPlacement {
        let strategy = if self.physical_cores > reserved + 1 {
            PlacementStrategy::Dedicated
        } else if self.physical_cores == reserved + 1 && self.has_smt {
            PlacementStrategy::SmtShare
        } else {
            PlacementStrategy::NoPin
        };

        let loop_core = match strategy {
            PlacementStrategy::Dedicated | PlacementStrategy::SmtShare => {
                self.available_cores.get(reserved).copied()
            }
            PlacementStrategy::NoPin | PlacementStrategy::Manual => None,
        };

        LoopPlacement {
            loop_core,
            background_workers: self.default_workers(reserved),
            strategy,
        }
    }

    /// Logical cores left after the reserved ones and the loop thread.
    #[must_use]
    pub fn default_workers(&self, reserved: usize) -> usize {
        self.logical_cores.saturating_sub(reserved + 1).max(1)
    }
}

/// Placement decisions for the scheduler threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopPlacement {
    /// Core ID for the loop thread (None = unpinned).
    pub loop_core: Option<usize>,
    /// Number of background workers to start.
    pub background_workers: usize,
    /// Strategy used for placement.
    pub strategy: PlacementStrategy,
}

impl LoopPlacement {
    /// Unpinned loop thread with `background_workers` workers.
    #[must_use]
    pub fn unpinned(background_workers: usize) -> Self {
        Self {
            loop_core: None,
            background_workers,
            strategy: PlacementStrategy::NoPin,
        }
    }

    /// Overrides the worker count chosen by detection.
    #[must_use]
    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        if let Some(n) = workers {
            self.background_workers = n.max(1);
        }
        self
    }
}

/// Strategy used for thread placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlacementStrategy {
    /// Loop thread on a physical core of its own.
    Dedicated,
    /// Loop thread pinned, sharing its physical core with an SMT sibling.
    SmtShare,
    /// No pinning (fallback).
    NoPin,
    /// Manual assignment by user.
    Manual,
}

impl std::fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dedicated => write!(f, "dedicated"),
            Self::SmtShare => write!(f, "smt-share"),
            Self::NoPin => write!(f, "no-pin"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Configuration for CPU pinning behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuConfig {
    /// Auto-detect topology and choose placement.
    Auto,
    /// User-specified loop core.
    Manual {
        /// Core for the loop thread (None = unpinned).
        loop_core: Option<usize>,
    },
    /// Disable CPU pinning entirely.
    #[default]
    Disabled,
}

impl CpuConfig {
    /// Resolves the config to a concrete placement.
    ///
    /// `workers` overrides the detected background worker count.
    #[must_use]
    pub fn resolve(&self, reserved: usize, workers: Option<usize>) -> LoopPlacement {
        let placement = match self {
            Self::Auto => CpuTopology::detect().select_placement(reserved),
            Self::Manual { loop_core } => LoopPlacement {
                loop_core: *loop_core,
                background_workers: CpuTopology::detect().default_workers(reserved),
                strategy: PlacementStrategy::Manual,
            },
            Self::Disabled => {
                LoopPlacement::unpinned(CpuTopology::detect().default_workers(reserved))
            }
        };
        placement.with_workers(workers)
    }
}

/// Pins the current thread to the specified core.
///
/// Returns `true` if pinning succeeded, `false` otherwise.
/// Pinning may fail if the core ID is invalid or the OS denies the request.
pub fn pin_to_core(core_id: usize) -> bool {
    let core = CoreId { id: core_id };
    core_affinity::set_for_current(core)
}
