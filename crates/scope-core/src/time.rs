//! Log time: an exact `(sec, nsec)` pair.
//!
//! All playback arithmetic happens in integer nanoseconds; conversions are
//! exact and ordering is total. `nsec` is always kept in `[0, 1e9)`.

use serde::{Deserialize, Serialize};

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// A point in log time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time {
    pub sec: i64,
    pub nsec: u32,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };

    /// Construct from components, normalizing `nsec` overflow into `sec`.
    pub fn new(sec: i64, nsec: u32) -> Self {
        let carry = i64::from(nsec) / NSEC_PER_SEC;
        Time {
            sec: sec + carry,
            nsec: (i64::from(nsec) % NSEC_PER_SEC) as u32,
        }
    }

    pub fn from_nanos(nanos: i64) -> Self {
        let sec = nanos.div_euclid(NSEC_PER_SEC);
        let nsec = nanos.rem_euclid(NSEC_PER_SEC) as u32;
        Time { sec, nsec }
    }

    pub fn as_nanos(&self) -> i64 {
        self.sec * NSEC_PER_SEC + i64::from(self.nsec)
    }

    pub fn add_nanos(&self, nanos: i64) -> Self {
        Time::from_nanos(self.as_nanos() + nanos)
    }

    /// Nanoseconds from `earlier` to `self`; negative when `self < earlier`.
    pub fn nanos_since(&self, earlier: Time) -> i64 {
        self.as_nanos() - earlier.as_nanos()
    }

    pub fn clamp_to(&self, start: Time, end: Time) -> Self {
        if *self < start {
            start
        } else if *self > end {
            end
        } else {
            *self
        }
    }

    /// Position of `self` within `[start, end]` as a fraction in `[0, 1]`.
    ///
    /// Returns 0 for an empty span.
    pub fn fraction_between(&self, start: Time, end: Time) -> f64 {
        let span = end.nanos_since(start);
        if span <= 0 {
            return 0.0;
        }
        let offset = self.clamp_to(start, end).nanos_since(start);
        offset as f64 / span as f64
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}
