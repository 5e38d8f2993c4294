//! Tick-space coordinate types.
//!
//! The loop advances a monotonic [`TickInstant`] once per processed tick
//! indication. The radio layer only sees the wrapped [`Tti`], which is the
//! instant modulo the configured TTI modulus (10240 for an NR hyper-frame).
//! Timers are always scheduled against the monotonic instant so wrap-around
//! never reorders deadlines.

use core::fmt;
use core::ops::Add;

use serde::{Deserialize, Serialize};

/// Default TTI modulus: 1024 frames of 10 subframes.
pub const DEFAULT_TTI_MODULUS: u32 = 10240;

/// A point on the monotonic tick lattice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct TickInstant(u64);

impl TickInstant {
    /// Creates a new tick instant from a raw tick count.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying tick count.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Adds a tick span to this instant.
    ///
    /// # Panics
    ///
    /// Overflow is treated as an impossible invariant and is not checked in release builds.
    #[inline]
    #[must_use]
    pub fn add_span(self, span: TickSpan) -> Self {
        Self(self.0 + span.0)
    }

    /// The following instant.
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        self.add_span(TickSpan::ONE)
    }

    /// Ticks elapsed since `earlier`, saturating at zero.
    #[inline]
    #[must_use]
    pub const fn since(self, earlier: Self) -> TickSpan {
        TickSpan(self.0.saturating_sub(earlier.0))
    }

    /// Projects this instant onto the wrapped TTI space.
    ///
    /// # Panics
    ///
    /// Panics if `modulus` is zero.
    #[inline]
    #[must_use]
    pub const fn to_tti(self, modulus: u32) -> Tti {
        Tti((self.0 % modulus as u64) as u32)
    }
}

/// A span in tick space (number of ticks).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct TickSpan(u64);

impl TickSpan {
    /// A single tick.
    pub const ONE: Self = Self(1);

    /// Creates a new tick span from a raw tick count.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying tick count.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u32> for TickSpan {
    fn from(ticks: u32) -> Self {
        Self(u64::from(ticks))
    }
}

impl Add<TickSpan> for TickInstant {
    type Output = Self;

    #[inline]
    fn add(self, rhs: TickSpan) -> Self::Output {
        self.add_span(rhs)
    }
}

/// Wrapped tick number as exchanged with the radio layer.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Tti(u32);

impl Tti {
    /// Creates a TTI from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Forward distance from `self` to `target`, modulo `modulus`.
    ///
    /// Both values are reduced modulo `modulus` first, so an out-of-range
    /// TTI from the radio still yields a distance below `modulus`.
    #[inline]
    #[must_use]
    pub const fn distance_to(self, target: Self, modulus: u32) -> u32 {
        let from = self.0 % modulus;
        let to = target.0 % modulus;
        if to >= from {
            to - from
        } else {
            modulus - from + to
        }
    }
}

impl fmt::Display for Tti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tti_wraps_at_modulus() {
        let before = TickInstant::new(u64::from(DEFAULT_TTI_MODULUS) - 1);
        assert_eq!(before.to_tti(DEFAULT_TTI_MODULUS), Tti::new(10239));
        assert_eq!(before.next().to_tti(DEFAULT_TTI_MODULUS), Tti::new(0));
    }

    #[test]
    fn distance_is_forward_and_wraps() {
        assert_eq!(Tti::new(5).distance_to(Tti::new(8), 10), 3);
        assert_eq!(Tti::new(8).distance_to(Tti::new(5), 10), 7);
        assert_eq!(Tti::new(4).distance_to(Tti::new(4), 10), 0);
        assert_eq!(Tti::new(3).distance_to(Tti::new(14), 10), 1);
    }

    #[test]
    fn distance_with_modulus_near_u32_max() {
        let modulus = 3_000_000_000;
        assert_eq!(Tti::new(10).distance_to(Tti::new(2_999_999_000), modulus), 2_999_998_990);
        assert_eq!(Tti::new(2_999_999_000).distance_to(Tti::new(10), modulus), 1010);
        assert_eq!(Tti::new(u32::MAX).distance_to(Tti::new(0), u32::MAX), 0);
        assert_eq!(Tti::new(u32::MAX - 1).distance_to(Tti::new(1), u32::MAX), 2);
    }

    #[test]
    fn since_saturates() {
        let a = TickInstant::new(10);
        let b = TickInstant::new(4);
        assert_eq!(a.since(b), TickSpan::new(6));
        assert_eq!(b.since(a), TickSpan::new(0));
    }
}
