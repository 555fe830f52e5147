//! Normalized progress ranges.
//!
//! Loaded regions of a log are reported to the UI as fractions of the total
//! timespan in `[0, 1]`. Overlapping or touching ranges are merged before
//! emission so the progress bar renders contiguous segments.

use serde::{Deserialize, Serialize};

/// A loaded region expressed as fractions of the log timespan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractionRange {
    pub start: f64,
    pub end: f64,
}

impl FractionRange {
    pub fn new(start: f64, end: f64) -> Self {
        FractionRange { start, end }
    }
}

/// Merge overlapping or touching ranges into a minimal sorted set.
pub fn merge_ranges(mut ranges: Vec<FractionRange>) -> Vec<FractionRange> {
    ranges.retain(|r| r.end >= r.start);
    ranges.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));

    let mut merged: Vec<FractionRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match merged.last_mut() {
            Some(last) if r.start <= last.end => {
                if r.end > last.end {
                    last.end = r.end;
                }
            }
            _ => merged.push(r),
        }
    }
    merged
}
