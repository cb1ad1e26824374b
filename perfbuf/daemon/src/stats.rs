//! Atomic statistics cells
//!
//! A `StatCell` is the smallest unit of the counter grids: one
//! bytes/count/lost triple. Every field is updated with a single atomic
//! read-modify-write, so concurrent writers on the same cell never lose
//! updates. Reads across fields (or across cells) are not a snapshot.

use probe_common::PerfMapStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Saturating difference between two readings of a monotonic kernel counter
///
/// A counter that went backwards (map reload, reset, wraparound) yields 0.
#[inline]
pub fn delta(previous: u64, current: u64) -> u64 {
    current.saturating_sub(previous)
}

/// One (bytes, count, lost) triple
#[derive(Debug, Default)]
pub struct StatCell {
    bytes: AtomicU64,
    count: AtomicU64,
    lost: AtomicU64,
}

impl StatCell {
    /// Add `count` events totalling `bytes` bytes
    #[inline]
    pub fn add(&self, count: u64, bytes: u64) {
        self.count.fetch_add(count, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Swap the count to zero, returning the previous value
    pub fn take_count(&self) -> u64 {
        self.count.swap(0, Ordering::Relaxed)
    }

    /// Swap the bytes to zero, returning the previous value
    pub fn take_bytes(&self) -> u64 {
        self.bytes.swap(0, Ordering::Relaxed)
    }

    /// Store a fresh kernel reading and return its delta against the previous one
    pub fn replace(&self, current: PerfMapStats) -> PerfMapStats {
        let bytes = self.bytes.swap(current.bytes, Ordering::Relaxed);
        let count = self.count.swap(current.count, Ordering::Relaxed);
        let lost = self.lost.swap(current.lost, Ordering::Relaxed);

        PerfMapStats {
            bytes: delta(bytes, current.bytes),
            count: delta(count, current.count),
            lost: delta(lost, current.lost),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_saturates() {
        assert_eq!(delta(10, 25), 15);
        assert_eq!(delta(25, 25), 0);
        assert_eq!(delta(25, 10), 0);
        assert_eq!(delta(u64::MAX, 0), 0);
    }

    #[test]
    fn test_take_resets() {
        let cell = StatCell::default();
        cell.add(3, 300);
        cell.add(2, 200);

        assert_eq!(cell.take_count(), 5);
        assert_eq!(cell.take_bytes(), 500);
        assert_eq!(cell.take_count(), 0);
        assert_eq!(cell.bytes(), 0);
    }

    #[test]
    fn test_replace_per_field_decrease() {
        let cell = StatCell::default();
        cell.replace(PerfMapStats {
            bytes: 1000,
            count: 10,
            lost: 4,
        });

        // bytes went backwards (map reload), count and lost kept growing
        let diff = cell.replace(PerfMapStats {
            bytes: 200,
            count: 12,
            lost: 9,
        });
        assert_eq!(
            diff,
            PerfMapStats {
                bytes: 0,
                count: 2,
                lost: 5,
            }
        );
        assert_eq!(cell.bytes(), 200);
    }
}
