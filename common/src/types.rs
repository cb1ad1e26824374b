//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code. Integers are stored in the
//! host byte order, the order the kernel writes them in.

use crate::constants::{EVENT_HEADER_SIZE, PERF_MAP_STATS_SIZE};

/// Returned when a buffer is too short to hold the expected layout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotEnoughData {
    /// Minimum number of bytes required
    pub expected: usize,
    /// Number of bytes provided
    pub actual: usize,
}

impl core::fmt::Display for NotEnoughData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "not enough data: expected {} bytes, got {}",
            self.expected, self.actual
        )
    }
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_ne_bytes(raw)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

/// One per-CPU entry of a perf buffer statistics map
///
/// Written by the kernel for every (event type, CPU) pair of a perf buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfMapStats {
    /// Number of bytes written to the perf buffer
    pub bytes: u64,
    /// Number of events written to the perf buffer
    pub count: u64,
    /// Number of events the kernel failed to write
    pub lost: u64,
}

impl PerfMapStats {
    /// Parse a statistics map entry
    ///
    /// Buffers longer than 24 bytes are truncated to the first 24 bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, NotEnoughData> {
        if data.len() < PERF_MAP_STATS_SIZE {
            return Err(NotEnoughData {
                expected: PERF_MAP_STATS_SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            bytes: read_u64(data, 0),
            count: read_u64(data, 8),
            lost: read_u64(data, 16),
        })
    }

    /// Encode the entry the way the kernel lays it out
    pub fn to_bytes(&self) -> [u8; PERF_MAP_STATS_SIZE] {
        let mut out = [0u8; PERF_MAP_STATS_SIZE];
        out[0..8].copy_from_slice(&self.bytes.to_ne_bytes());
        out[8..16].copy_from_slice(&self.count.to_ne_bytes());
        out[16..24].copy_from_slice(&self.lost.to_ne_bytes());
        out
    }
}

/// Header at the start of every perf buffer record
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventHeader {
    /// Event type id (see `EventType`)
    pub event_type: u32,
    /// CPU the event was produced on
    pub cpu: u32,
    /// Kernel timestamp of the event (nanoseconds)
    pub timestamp_ns: u64,
}

impl EventHeader {
    /// Parse the header of a perf buffer record, ignoring the payload
    pub fn from_bytes(data: &[u8]) -> Result<Self, NotEnoughData> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(NotEnoughData {
                expected: EVENT_HEADER_SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            event_type: read_u32(data, 0),
            cpu: read_u32(data, 4),
            timestamp_ns: read_u64(data, 8),
        })
    }

    /// Encode the header the way the kernel lays it out
    pub fn to_bytes(&self) -> [u8; EVENT_HEADER_SIZE] {
        let mut out = [0u8; EVENT_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.event_type.to_ne_bytes());
        out[4..8].copy_from_slice(&self.cpu.to_ne_bytes());
        out[8..16].copy_from_slice(&self.timestamp_ns.to_ne_bytes());
        out
    }
}

// Compile-time layout checks
const _: () = {
    assert!(core::mem::size_of::<PerfMapStats>() == PERF_MAP_STATS_SIZE);
    assert!(core::mem::size_of::<PerfMapStats>() % core::mem::align_of::<PerfMapStats>() == 0);
    assert!(core::mem::size_of::<EventHeader>() == EVENT_HEADER_SIZE);
    assert!(core::mem::size_of::<EventHeader>() % core::mem::align_of::<EventHeader>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    // Pod trait implementations for reading from BPF maps in userspace
    unsafe impl aya::Pod for PerfMapStats {}
    unsafe impl aya::Pod for EventHeader {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_short_buffer() {
        for len in 0..PERF_MAP_STATS_SIZE {
            let data = [0u8; PERF_MAP_STATS_SIZE];
            let err = PerfMapStats::from_bytes(&data[..len]).unwrap_err();
            assert_eq!(err.expected, PERF_MAP_STATS_SIZE);
            assert_eq!(err.actual, len);
        }
    }

    #[test]
    fn test_stats_trailing_bytes_ignored() {
        let stats = PerfMapStats {
            bytes: 4096,
            count: 12,
            lost: 3,
        };
        let mut data = [0xffu8; 32];
        data[..PERF_MAP_STATS_SIZE].copy_from_slice(&stats.to_bytes());

        assert_eq!(PerfMapStats::from_bytes(&data), Ok(stats));
    }

    #[test]
    fn test_stats_field_offsets() {
        let mut data = [0u8; PERF_MAP_STATS_SIZE];
        data[8..16].copy_from_slice(&7u64.to_ne_bytes());

        let stats = PerfMapStats::from_bytes(&data).unwrap();
        assert_eq!(stats.bytes, 0);
        assert_eq!(stats.count, 7);
        assert_eq!(stats.lost, 0);
    }

    #[test]
    fn test_header_short_buffer() {
        let data = [0u8; EVENT_HEADER_SIZE - 1];
        assert!(EventHeader::from_bytes(&data).is_err());
    }

    #[test]
    fn test_header_payload_ignored() {
        let header = EventHeader {
            event_type: 5,
            cpu: 1,
            timestamp_ns: 1_000_000,
        };
        let mut record = [0u8; 64];
        record[..EVENT_HEADER_SIZE].copy_from_slice(&header.to_bytes());

        assert_eq!(EventHeader::from_bytes(&record), Ok(header));
    }
}
