//! Interfaces of the monitor's collaborators
//!
//! The eBPF manager owns the kernel maps, the probe owns the custom event
//! pipeline and the dentry cache. The monitor only sees them through these
//! traits.

use crate::{
    error::{MonitorError, TableError},
    registry::PerfBufferSpec,
};
use probe_common::PerfMapStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One key of a kernel statistics map, with its per-CPU values
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsEntry {
    /// Encoded event type id
    pub key: u32,
    /// One entry per possible CPU
    pub per_cpu: Vec<PerfMapStats>,
}

/// Kernel-maintained perf buffer statistics map
pub trait StatsTable: Send + Sync {
    /// Walk every entry of the map
    ///
    /// Each call restarts from the first key. `TableError::Decode` items only
    /// concern their own entry; `TableError::Iteration` ends the walk.
    fn entries(&self) -> Box<dyn Iterator<Item = Result<StatsEntry, TableError>> + '_>;
}

/// The eBPF manager, as seen by the monitor
pub trait EbpfManager {
    /// Perf buffers declared by the loaded programs
    fn perf_buffers(&self) -> Vec<PerfBufferSpec>;

    /// (perf buffer name, statistics map name) pairs
    fn statistics_maps(&self) -> Vec<(String, String)>;

    /// Resolve a statistics map by name
    fn resolve_statistics_table(&mut self, name: &str) -> Result<Box<dyn StatsTable>, MonitorError>;

    /// Ring buffer size used for buffers without an explicit size
    fn default_ring_buffer_size(&self) -> u64;

    /// Number of CPUs the per-CPU maps are sized for
    fn host_cpu_count(&self) -> Result<usize, MonitorError>;
}

/// Events the monitor sends back into the probe's event pipeline
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CustomEvent {
    /// Userspace readers were notified of lost records
    LostEventsRead { map: String, lost: u64 },
    /// The kernel failed to write records to a perf buffer
    LostEventsWrite {
        map: String,
        per_event: BTreeMap<String, u64>,
    },
}

/// Callbacks into the owning probe
pub trait ProbeHooks: Send + Sync {
    fn dispatch_custom_event(&self, event: CustomEvent);

    /// Invalidate the path resolution caches
    fn bump_cache_generations(&self);
}
