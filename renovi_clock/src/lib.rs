//! Clock abstractions and second-resolution time primitives
//!
//! Token lifetime math only ever needs whole-second resolution, so the types
//! here deliberately stay on `u64` seconds rather than `std::time::Duration`.
//! The [`Clock`] trait makes the current time an injectable dependency so
//! expiry and scheduling logic can be tested without waiting on a wall clock.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]

use std::{
    ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix time
///
/// Seconds elapsed since 1970-01-01T00:00:00Z.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct UnixTime(pub u64);

impl From<SystemTime> for UnixTime {
    #[inline]
    fn from(t: SystemTime) -> Self {
        let secs = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        UnixTime(secs)
    }
}

impl ops::Add<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn add(self, rhs: DurationSecs) -> UnixTime {
        UnixTime(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn sub(self, rhs: DurationSecs) -> UnixTime {
        UnixTime(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Sub<UnixTime> for UnixTime {
    type Output = DurationSecs;

    /// Duration since an earlier instant, saturating at zero
    #[inline]
    fn sub(self, rhs: UnixTime) -> DurationSecs {
        DurationSecs(self.0.saturating_sub(rhs.0))
    }
}

#[cfg(feature = "serde")]
impl Serialize for UnixTime {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for UnixTime {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(u64::deserialize(deserializer)?))
    }
}

/// A duration measured in whole seconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DurationSecs(pub u64);

impl DurationSecs {
    /// A zero-length duration
    pub const ZERO: DurationSecs = DurationSecs(0);

    /// The smaller of two durations
    #[inline]
    #[must_use]
    pub fn min(self, other: DurationSecs) -> DurationSecs {
        DurationSecs(self.0.min(other.0))
    }

    /// The larger of two durations
    #[inline]
    #[must_use]
    pub fn max(self, other: DurationSecs) -> DurationSecs {
        DurationSecs(self.0.max(other.0))
    }
}

impl ops::Add for DurationSecs {
    type Output = DurationSecs;

    #[inline]
    fn add(self, rhs: DurationSecs) -> DurationSecs {
        DurationSecs(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub for DurationSecs {
    type Output = DurationSecs;

    /// Saturating at zero
    #[inline]
    fn sub(self, rhs: DurationSecs) -> DurationSecs {
        DurationSecs(self.0.saturating_sub(rhs.0))
    }
}

impl ops::Mul<f64> for DurationSecs {
    type Output = DurationSecs;

    /// Scales the duration, truncating toward zero; negative factors clamp to zero
    #[inline]
    fn mul(self, rhs: f64) -> DurationSecs {
        DurationSecs((self.0 as f64 * rhs).max(0.0) as u64)
    }
}

impl From<DurationSecs> for Duration {
    #[inline]
    fn from(d: DurationSecs) -> Duration {
        Duration::from_secs(d.0)
    }
}

#[cfg(feature = "serde")]
impl Serialize for DurationSecs {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for DurationSecs {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(u64::deserialize(deserializer)?))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixTime;
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime::from(SystemTime::now())
    }
}

/// A test clock whose current time is shared mutable state
///
/// Clones observe the same underlying instant, so a test can hand a clone to
/// the component under test and then advance time from the outside.
#[derive(Clone, Debug, Default)]
pub struct TestClock {
    now: Arc<AtomicU64>,
}

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime(self.now.load(Ordering::SeqCst))
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    pub fn new(time: UnixTime) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(time.0)),
        }
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: UnixTime) {
        self.now.store(val.0, Ordering::SeqCst);
    }

    /// Increments the clock's current time by `inc` seconds
    pub fn inc(&self, inc: u64) {
        self.now.fetch_add(inc, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_time_arithmetic_saturates() {
        let t = UnixTime(100);
        assert_eq!(t + DurationSecs(50), UnixTime(150));
        assert_eq!(t - DurationSecs(200), UnixTime(0));
        assert_eq!(UnixTime(80) - t, DurationSecs(0));
        assert_eq!(t - UnixTime(30), DurationSecs(70));
    }

    #[test]
    fn duration_scaling_truncates() {
        assert_eq!(DurationSecs(100) * 0.8, DurationSecs(80));
        assert_eq!(DurationSecs(3) * 0.5, DurationSecs(1));
        assert_eq!(DurationSecs(10) * -1.0, DurationSecs(0));
    }

    #[test]
    fn test_clock_clones_share_time() {
        let clock = TestClock::new(UnixTime(1000));
        let other = clock.clone();
        clock.inc(500);
        assert_eq!(other.now(), UnixTime(1500));
        other.set(UnixTime(10));
        assert_eq!(clock.now(), UnixTime(10));
    }
}
