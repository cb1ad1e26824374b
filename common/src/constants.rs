//! Shared constants for the perf buffer monitor
//!
//! These constants are used by both kernel and userspace programs
//! to ensure consistency in layouts and limits.

// ============================================================================
// Binary Layout Sizes
// ============================================================================

/// Size of one per-CPU entry of a perf buffer statistics map
pub const PERF_MAP_STATS_SIZE: usize = 24;

/// Size of the header that prefixes every perf buffer record
pub const EVENT_HEADER_SIZE: usize = 16;

// ============================================================================
// Perf Ring Buffers
// ============================================================================

/// Page size assumed when converting ring buffer sizes to page counts
pub const PAGE_SIZE: u64 = 4096;

/// Default size of a perf ring buffer, per CPU (256 KiB)
pub const DEFAULT_PERF_RING_BUFFER_SIZE: u64 = 64 * PAGE_SIZE;

/// Key 0 of a statistics map is reserved, event types start at 1
pub const RESERVED_STATS_KEY: u32 = 0;
