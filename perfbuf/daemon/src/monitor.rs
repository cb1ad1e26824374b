//! Perf buffer monitor
//!
//! Keeps two views of every perf buffer:
//! - the **read** view, counted in userspace by the perf buffer readers, and
//! - the **write** view, maintained by the kernel in per-CPU statistics maps
//!   and mirrored here on every reporting cycle.
//!
//! ## Concurrency
//!
//! `count_event` and `count_lost_event` are called concurrently by one reader
//! per CPU. They only perform atomic operations on cells allocated at
//! construction. A single reporting task calls `send_stats`, which reconciles
//! the kernel maps, drains the read counters and reports both through the
//! metrics sink. Aggregates over several cells are not point-in-time
//! snapshots while writers are active.

use crate::{
    config::MonitorConfig,
    error::{MonitorError, TableError},
    grid::{CounterGrid, LostCounters, SortingErrors},
    manager::{CustomEvent, EbpfManager, ProbeHooks, StatsTable},
    registry::{BufferId, BufferRegistry},
    sink::*,
    stats::StatCell,
};
use log::{debug, warn};
use probe_common::{EventType, PerfMapStats, MAX_EVENT_TYPE, RESERVED_STATS_KEY};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// Event count and size for one event type
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub count: u64,
    pub bytes: u64,
}

/// Non-fatal outcome of a reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Buffers whose statistics map could not be walked this cycle
    pub failed_buffers: Vec<(String, TableError)>,
    /// Malformed entries that were ignored
    pub skipped_entries: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed_buffers.is_empty() && self.skipped_entries == 0
    }
}

struct KernelTable {
    buffer: BufferId,
    stats_map: String,
    table: Box<dyn StatsTable>,
}

/// Saturating conversion of a counter to a metric value
fn metric_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Statistics about the events read from, and written to, the perf buffers
pub struct PerfBufferMonitor {
    registry: BufferRegistry,
    cpus: usize,
    tables: Vec<KernelTable>,

    /// Events and bytes counted by the perf buffer readers
    stats: CounterGrid,
    /// Last values read from the kernel statistics maps
    kernel_stats: CounterGrid,
    /// Lost events reported to the perf buffer readers
    read_lost: LostCounters,
    /// Events that arrived with a timestamp older than the watermark
    sorting_errors: SortingErrors,

    /// Timestamp of the last in-order event, across all buffers and CPUs
    last_timestamp: AtomicU64,
    /// Set when the dentry cache generations must be bumped
    bump_generation: AtomicBool,

    sink: Arc<dyn MetricsSink>,
    hooks: Arc<dyn ProbeHooks>,

    /// Tags per buffer
    buffer_tags: Vec<Vec<String>>,
    /// Tags per (buffer, event type)
    event_tags: Vec<Vec<String>>,
}

impl PerfBufferMonitor {
    /// Build the monitor for every perf buffer of the manager
    ///
    /// Fails if the CPU count can't be determined, or if a statistics map is
    /// missing or paired with an unknown perf buffer.
    pub fn new<M: EbpfManager + ?Sized>(
        manager: &mut M,
        sink: Arc<dyn MetricsSink>,
        hooks: Arc<dyn ProbeHooks>,
        config: &MonitorConfig,
    ) -> Result<Self, MonitorError> {
        let cpus = manager.host_cpu_count()?;
        if cpus == 0 {
            return Err(MonitorError::CpuCount(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no CPU reported",
            )));
        }

        let mut registry =
            BufferRegistry::new(&manager.perf_buffers(), manager.default_ring_buffer_size());

        let mut tables = Vec::new();
        for (buffer_name, stats_map) in manager.statistics_maps() {
            let buffer = registry
                .id(&buffer_name)
                .ok_or_else(|| MonitorError::UnknownBuffer {
                    buffer: buffer_name.clone(),
                    stats_map: stats_map.clone(),
                })?;
            let table = manager.resolve_statistics_table(&stats_map)?;
            registry.attach_stats_map(buffer, &stats_map);
            tables.push(KernelTable {
                buffer,
                stats_map,
                table,
            });
        }

        let mut buffer_tags = Vec::with_capacity(registry.len());
        let mut event_tags = Vec::with_capacity(registry.len() * MAX_EVENT_TYPE);
        for (_, entry) in registry.iter() {
            let mut tags = config.tags.clone();
            tags.push(format!("map:{}", entry.name));
            for event_type in EventType::iter() {
                let mut tags = tags.clone();
                tags.push(format!("event_type:{}", event_type));
                event_tags.push(tags);
            }
            buffer_tags.push(tags);
        }

        let buffers = registry.len();
        debug!(
            "monitoring {} perf ring buffers on {} CPU, {} events",
            buffers, cpus, MAX_EVENT_TYPE
        );

        Ok(Self {
            registry,
            cpus,
            tables,
            stats: CounterGrid::new(buffers, cpus),
            kernel_stats: CounterGrid::new(buffers, cpus),
            read_lost: LostCounters::new(buffers, cpus),
            sorting_errors: SortingErrors::new(buffers),
            last_timestamp: AtomicU64::new(0),
            bump_generation: AtomicBool::new(false),
            sink,
            hooks,
            buffer_tags,
            event_tags,
        })
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus
    }

    /// Resolve a perf buffer name to the id used on the hot path
    pub fn buffer_id(&self, name: &str) -> Option<BufferId> {
        self.registry.id(name)
    }

    fn event_tags(&self, buffer: BufferId, event_type: EventType) -> &[String] {
        self.event_tags
            .get(buffer.index() * MAX_EVENT_TYPE + event_type.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn buffer_tags(&self, buffer: BufferId) -> &[String] {
        self.buffer_tags
            .get(buffer.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    // ------------------------------------------------------------------------
    // Hot path
    // ------------------------------------------------------------------------

    /// Count `count` events of `event_type`, totalling `size` bytes, read on `cpu`
    ///
    /// Out-of-range buffers or CPUs are ignored. An event older than the
    /// last in-order event is counted as a sorting error and schedules a cache
    /// generation bump.
    #[inline]
    pub fn count_event(
        &self,
        event_type: EventType,
        timestamp_ns: u64,
        count: u64,
        size: u64,
        buffer: BufferId,
        cpu: usize,
    ) {
        let Some(cell) = self.stats.cell(buffer, cpu, event_type) else {
            return;
        };

        let last = self.last_timestamp.load(Ordering::Relaxed);
        if timestamp_ns < last && last != 0 {
            if let Some(errors) = self.sorting_errors.cell(buffer, event_type) {
                errors.fetch_add(1, Ordering::Relaxed);
            }
            self.bump_generation.store(true, Ordering::Release);
        } else {
            // never moves back, even when a concurrent writer raced ahead
            self.last_timestamp.fetch_max(timestamp_ns, Ordering::Relaxed);
        }

        cell.add(count, size);
    }

    /// `count_event` for callers holding a buffer name
    pub fn count_event_by_name(
        &self,
        event_type: EventType,
        timestamp_ns: u64,
        count: u64,
        size: u64,
        buffer: &str,
        cpu: usize,
    ) {
        if let Some(buffer) = self.buffer_id(buffer) {
            self.count_event(event_type, timestamp_ns, count, size, buffer, cpu);
        }
    }

    /// Add `count` to the lost events reported to the reader of `cpu`
    #[inline]
    pub fn count_lost_event(&self, count: u64, buffer: BufferId, cpu: usize) {
        if let Some(cell) = self.read_lost.cell(buffer, cpu) {
            cell.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// `count_lost_event` for callers holding a buffer name
    pub fn count_lost_event_by_name(&self, count: u64, buffer: &str, cpu: usize) {
        if let Some(buffer) = self.buffer_id(buffer) {
            self.count_lost_event(count, buffer, cpu);
        }
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    /// Reconcile the kernel maps, then report the read counters
    ///
    /// Pending cache invalidations are forwarded to the probe even when the
    /// metrics transport fails. Counters drained before a transport failure
    /// are not replayed.
    pub fn send_stats(&self) -> Result<(), MonitorError> {
        let kernel = self.reconcile();

        if self.bump_generation.swap(false, Ordering::AcqRel) {
            debug!("bumping dentry cache generations");
            self.hooks.bump_cache_generations();
        }

        kernel?;
        self.emit_read_stats()
    }

    /// Walk every kernel statistics map and report the write counters
    pub fn reconcile(&self) -> Result<ReconcileReport, MonitorError> {
        self.collect_kernel_stats(Some(self.sink.as_ref()))
    }

    fn collect_kernel_stats(
        &self,
        sink: Option<&dyn MetricsSink>,
    ) -> Result<ReconcileReport, MonitorError> {
        let mut report = ReconcileReport::default();

        for kernel in &self.tables {
            let name = self.registry.name(kernel.buffer).unwrap_or_default();
            // total and per_event are used for alerting
            let mut total = 0u64;
            let mut per_event: BTreeMap<String, u64> = BTreeMap::new();
            let mut failure = None;

            for entry in kernel.table.entries() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(TableError::Decode(err)) => {
                        debug!("skipping entry of {}: {}", kernel.stats_map, err);
                        report.skipped_entries += 1;
                        continue;
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                };

                // first event type is 1
                if entry.key == RESERVED_STATS_KEY {
                    continue;
                }
                let Some(event_type) = EventType::from_index(entry.key % MAX_EVENT_TYPE as u32)
                else {
                    continue;
                };

                // path resolution caches are stale once a file was moved or removed
                if event_type.is_mutation() {
                    self.bump_generation.store(true, Ordering::Release);
                }

                let tags = self.event_tags(kernel.buffer, event_type);
                let event_lost = per_event.entry(event_type.name().to_string()).or_insert(0);

                for (cpu, current) in entry.per_cpu.iter().enumerate() {
                    // the kernel map may be sized for more CPUs than we track
                    let Some(cell) = self.kernel_stats.cell(kernel.buffer, cpu, event_type) else {
                        continue;
                    };

                    let diff = cell.replace(*current);
                    if let Some(sink) = sink {
                        send_kernel_stats(sink, &diff, tags)?;
                    }
                    total = total.wrapping_add(diff.lost);
                    *event_lost = event_lost.wrapping_add(diff.lost);
                }
            }

            if let Some(err) = failure {
                warn!("failed to dump the statistics map of {}: {}", name, err);
                report.failed_buffers.push((name.to_string(), err));
                continue;
            }

            // send an alert if events were lost
            if total > 0 {
                self.hooks.dispatch_custom_event(CustomEvent::LostEventsWrite {
                    map: name.to_string(),
                    per_event,
                });
            }
        }

        Ok(report)
    }

    /// Drain and report the counters of the perf buffer readers
    pub fn emit_read_stats(&self) -> Result<(), MonitorError> {
        self.send_events_and_bytes_read_stats()?;
        self.send_lost_events_read_stats()
    }

    fn send_events_and_bytes_read_stats(&self) -> Result<(), MonitorError> {
        for (buffer, _) in self.registry.iter() {
            for event_type in EventType::iter() {
                let tags = self.event_tags(buffer, event_type);

                for cell in self.stats.cells(buffer, None, event_type) {
                    let count = cell.take_count();
                    if count > 0 {
                        self.sink
                            .count(METRIC_EVENTS_READ, metric_value(count), tags)?;
                    }

                    let bytes = cell.take_bytes();
                    if bytes > 0 {
                        self.sink
                            .count(METRIC_BYTES_READ, metric_value(bytes), tags)?;
                    }
                }

                if let Some(errors) = self.sorting_errors.cell(buffer, event_type) {
                    let count = errors.swap(0, Ordering::Relaxed);
                    if count > 0 {
                        self.sink.count(METRIC_SORTING_ERROR, count, tags)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn send_lost_events_read_stats(&self) -> Result<(), MonitorError> {
        for (buffer, entry) in self.registry.iter() {
            let tags = self.buffer_tags(buffer);
            let mut total = 0u64;

            for cpu in 0..self.cpus {
                let lost = self.read_lost.take(buffer, Some(cpu));
                if lost > 0 {
                    self.sink.count(METRIC_LOST_READ, metric_value(lost), tags)?;
                    total = total.wrapping_add(lost);
                }
            }

            if total > 0 {
                self.hooks.dispatch_custom_event(CustomEvent::LostEventsRead {
                    map: entry.name.clone(),
                    lost: total,
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Lost events of a buffer, on one CPU or on all of them (`cpu` = None)
    pub fn lost_count(&self, buffer: &str, cpu: Option<usize>) -> u64 {
        match self.buffer_id(buffer) {
            Some(buffer) => self.read_lost.sum(buffer, cpu),
            None => 0,
        }
    }

    /// Same as `lost_count`, resetting the counters it read
    pub fn get_and_reset_lost_count(&self, buffer: &str, cpu: Option<usize>) -> u64 {
        match self.buffer_id(buffer) {
            Some(buffer) => self.read_lost.take(buffer, cpu),
            None => 0,
        }
    }

    /// Events of `event_type` read so far
    ///
    /// Aggregates over every buffer when `buffer` is None and over every CPU
    /// when `cpu` is None.
    pub fn event_stats(
        &self,
        event_type: EventType,
        buffer: Option<&str>,
        cpu: Option<usize>,
    ) -> EventStats {
        self.fold_event_stats(event_type, buffer, cpu, |cell| EventStats {
            count: cell.count(),
            bytes: cell.bytes(),
        })
    }

    /// Same as `event_stats`, resetting the counters it read
    pub fn get_and_reset_event_stats(
        &self,
        event_type: EventType,
        buffer: Option<&str>,
        cpu: Option<usize>,
    ) -> EventStats {
        self.fold_event_stats(event_type, buffer, cpu, |cell| EventStats {
            count: cell.take_count(),
            bytes: cell.take_bytes(),
        })
    }

    fn fold_event_stats(
        &self,
        event_type: EventType,
        buffer: Option<&str>,
        cpu: Option<usize>,
        read: impl Fn(&StatCell) -> EventStats,
    ) -> EventStats {
        let buffers: Vec<BufferId> = match buffer {
            None => self.registry.iter().map(|(id, _)| id).collect(),
            Some(name) => self.buffer_id(name).into_iter().collect(),
        };

        let mut total = EventStats::default();
        for buffer in buffers {
            for cell in self.stats.cells(buffer, cpu, event_type) {
                let stats = read(cell);
                total.count = total.count.wrapping_add(stats.count);
                total.bytes = total.bytes.wrapping_add(stats.bytes);
            }
        }
        total
    }

    /// Events the kernel failed to write to a buffer
    ///
    /// The kernel maps are read again first, without reporting the write
    /// counters: deltas picked up by this refresh are consumed and will not
    /// show up in the next `send_stats`. An empty `event_types` counts every
    /// event type.
    pub fn get_and_reset_kernel_lost_count(
        &self,
        buffer: &str,
        cpu: Option<usize>,
        event_types: &[EventType],
    ) -> u64 {
        if let Err(err) = self.collect_kernel_stats(None) {
            warn!("failed to refresh kernel statistics: {}", err);
        }

        let Some(buffer) = self.buffer_id(buffer) else {
            return 0;
        };

        EventType::iter()
            .filter(|event_type| event_types.is_empty() || event_types.contains(event_type))
            .flat_map(|event_type| self.kernel_stats.cells(buffer, cpu, event_type))
            .map(|cell| cell.lost())
            .fold(0u64, u64::wrapping_add)
    }

    /// Pending sorting errors of one buffer and event type
    pub fn sorting_error_count(&self, buffer: &str, event_type: EventType) -> i64 {
        self.buffer_id(buffer)
            .and_then(|buffer| self.sorting_errors.cell(buffer, event_type))
            .map(|cell| cell.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Whether the next `send_stats` will bump the cache generations
    pub fn generation_pending(&self) -> bool {
        self.bump_generation.load(Ordering::Acquire)
    }
}

fn send_kernel_stats(
    sink: &dyn MetricsSink,
    stats: &PerfMapStats,
    tags: &[String],
) -> Result<(), MonitorError> {
    if stats.count > 0 {
        sink.count(METRIC_EVENTS_WRITE, metric_value(stats.count), tags)?;
    }

    if stats.bytes > 0 {
        sink.count(METRIC_BYTES_WRITE, metric_value(stats.bytes), tags)?;
    }

    if stats.lost > 0 {
        sink.count(METRIC_LOST_WRITE, metric_value(stats.lost), tags)?;
    }

    Ok(())
}
