//! Perf buffer registry
//!
//! Perf buffer names are resolved to dense `BufferId`s once, when the monitor
//! is built. The hot path only ever indexes by id.

use std::collections::HashMap;

/// Dense index of a registered perf buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) usize);

impl BufferId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A perf buffer exposed by the eBPF manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerfBufferSpec {
    /// Name of the perf event array map
    pub name: String,
    /// Ring buffer size in bytes, None to use the manager default
    pub ring_buffer_size: Option<u64>,
}

/// Registered perf buffer
#[derive(Clone, Debug)]
pub struct BufferEntry {
    pub name: String,
    /// Kernel statistics map paired with the buffer, if any
    pub stats_map: Option<String>,
    pub ring_buffer_size: u64,
}

/// Immutable buffer ↔ statistics map registry
#[derive(Clone, Debug, Default)]
pub struct BufferRegistry {
    buffers: Vec<BufferEntry>,
    by_name: HashMap<String, BufferId>,
    by_stats_map: HashMap<String, BufferId>,
}

impl BufferRegistry {
    /// Register every perf buffer, applying `default_size` where no size is configured
    ///
    /// Duplicate names keep their first registration.
    pub fn new(buffers: &[PerfBufferSpec], default_size: u64) -> Self {
        let mut registry = Self::default();

        for spec in buffers {
            if registry.by_name.contains_key(&spec.name) {
                continue;
            }
            let id = BufferId(registry.buffers.len());
            registry.buffers.push(BufferEntry {
                name: spec.name.clone(),
                stats_map: None,
                ring_buffer_size: spec.ring_buffer_size.unwrap_or(default_size),
            });
            registry.by_name.insert(spec.name.clone(), id);
        }

        registry
    }

    /// Pair a statistics map with a registered buffer
    pub(crate) fn attach_stats_map(&mut self, buffer: BufferId, stats_map: &str) {
        if let Some(entry) = self.buffers.get_mut(buffer.0) {
            entry.stats_map = Some(stats_map.to_string());
            self.by_stats_map.insert(stats_map.to_string(), buffer);
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn id(&self, name: &str) -> Option<BufferId> {
        self.by_name.get(name).copied()
    }

    /// Buffer fed by the given statistics map
    pub fn buffer_for_stats_map(&self, stats_map: &str) -> Option<BufferId> {
        self.by_stats_map.get(stats_map).copied()
    }

    pub fn get(&self, id: BufferId) -> Option<&BufferEntry> {
        self.buffers.get(id.0)
    }

    pub fn name(&self, id: BufferId) -> Option<&str> {
        self.get(id).map(|entry| entry.name.as_str())
    }

    pub fn ring_buffer_size(&self, id: BufferId) -> Option<u64> {
        self.get(id).map(|entry| entry.ring_buffer_size)
    }

    /// Registered buffers, ordered by id
    pub fn iter(&self) -> impl Iterator<Item = (BufferId, &BufferEntry)> {
        self.buffers
            .iter()
            .enumerate()
            .map(|(i, entry)| (BufferId(i), entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, size: Option<u64>) -> PerfBufferSpec {
        PerfBufferSpec {
            name: name.to_string(),
            ring_buffer_size: size,
        }
    }

    #[test]
    fn test_registry_sizes() {
        let registry = BufferRegistry::new(&[spec("events", None), spec("dns", Some(8192))], 4096);

        let events = registry.id("events").unwrap();
        let dns = registry.id("dns").unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ring_buffer_size(events), Some(4096));
        assert_eq!(registry.ring_buffer_size(dns), Some(8192));
        assert_eq!(registry.id("missing"), None);
    }

    #[test]
    fn test_registry_duplicates_and_stats_maps() {
        let mut registry =
            BufferRegistry::new(&[spec("events", Some(1)), spec("events", Some(2))], 4096);
        assert_eq!(registry.len(), 1);

        let events = registry.id("events").unwrap();
        registry.attach_stats_map(events, "events_stats");
        assert_eq!(registry.buffer_for_stats_map("events_stats"), Some(events));
        assert_eq!(
            registry.get(events).unwrap().stats_map.as_deref(),
            Some("events_stats")
        );
        assert_eq!(registry.ring_buffer_size(events), Some(1));
    }
}
