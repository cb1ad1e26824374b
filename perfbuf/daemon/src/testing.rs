//! In-memory collaborators for unit tests

use crate::{
    config::MonitorConfig,
    error::{MonitorError, SinkError, TableError},
    manager::{CustomEvent, EbpfManager, ProbeHooks, StatsEntry, StatsTable},
    monitor::PerfBufferMonitor,
    registry::PerfBufferSpec,
    sink::MetricsSink,
};
use probe_common::{NotEnoughData, PerfMapStats, PERF_MAP_STATS_SIZE};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

pub const DEFAULT_SIZE: u64 = 4096;

#[derive(Default)]
struct TableState {
    entries: BTreeMap<u32, Vec<PerfMapStats>>,
    malformed: BTreeSet<u32>,
    fail_after: Option<usize>,
}

/// Statistics map backed by a shared BTreeMap
#[derive(Clone, Default)]
pub struct MemoryTable {
    state: Arc<Mutex<TableState>>,
}

impl MemoryTable {
    pub fn set(&self, key: u32, per_cpu: Vec<PerfMapStats>) {
        self.state.lock().unwrap().entries.insert(key, per_cpu);
    }

    pub fn remove(&self, key: u32) {
        self.state.lock().unwrap().entries.remove(&key);
    }

    /// Report `key` as an entry too short to decode
    pub fn set_malformed(&self, key: u32) {
        self.state.lock().unwrap().malformed.insert(key);
    }

    /// Fail the walk after `n` entries
    pub fn fail_after(&self, n: Option<usize>) {
        self.state.lock().unwrap().fail_after = n;
    }
}

impl StatsTable for MemoryTable {
    fn entries(&self) -> Box<dyn Iterator<Item = Result<StatsEntry, TableError>> + '_> {
        let state = self.state.lock().unwrap();
        let mut items = Vec::new();

        for (i, (key, per_cpu)) in state.entries.iter().enumerate() {
            if state.fail_after == Some(i) {
                items.push(Err(TableError::Iteration("injected failure".to_string())));
                break;
            }
            if state.malformed.contains(key) {
                items.push(Err(TableError::Decode(NotEnoughData {
                    expected: PERF_MAP_STATS_SIZE,
                    actual: 8,
                })));
                continue;
            }
            items.push(Ok(StatsEntry {
                key: *key,
                per_cpu: per_cpu.clone(),
            }));
        }

        Box::new(items.into_iter())
    }
}

/// eBPF manager with in-memory statistics maps
pub struct MemoryManager {
    pub buffers: Vec<PerfBufferSpec>,
    pub statistics_maps: Vec<(String, String)>,
    pub tables: HashMap<String, MemoryTable>,
    pub cpus: Option<usize>,
}

impl MemoryManager {
    /// One buffer per name, each paired with a `<name>_stats` map
    pub fn with_buffers(names: &[&str], cpus: usize) -> Self {
        let mut manager = Self {
            buffers: Vec::new(),
            statistics_maps: Vec::new(),
            tables: HashMap::new(),
            cpus: Some(cpus),
        };

        for name in names {
            let stats_map = format!("{}_stats", name);
            manager.buffers.push(PerfBufferSpec {
                name: name.to_string(),
                ring_buffer_size: None,
            });
            manager
                .statistics_maps
                .push((name.to_string(), stats_map.clone()));
            manager.tables.insert(stats_map, MemoryTable::default());
        }

        manager
    }

    pub fn build(&mut self) -> Result<PerfBufferMonitor, MonitorError> {
        PerfBufferMonitor::new(
            self,
            Arc::new(RecordingSink::default()),
            Arc::new(RecordingHooks::default()),
            &MonitorConfig::default(),
        )
    }
}

impl EbpfManager for MemoryManager {
    fn perf_buffers(&self) -> Vec<PerfBufferSpec> {
        self.buffers.clone()
    }

    fn statistics_maps(&self) -> Vec<(String, String)> {
        self.statistics_maps.clone()
    }

    fn resolve_statistics_table(&mut self, name: &str) -> Result<Box<dyn StatsTable>, MonitorError> {
        self.tables
            .get(name)
            .map(|table| Box::new(table.clone()) as Box<dyn StatsTable>)
            .ok_or_else(|| MonitorError::StatisticsMapNotFound(name.to_string()))
    }

    fn default_ring_buffer_size(&self) -> u64 {
        DEFAULT_SIZE
    }

    fn host_cpu_count(&self) -> Result<usize, MonitorError> {
        self.cpus.ok_or_else(|| {
            MonitorError::CpuCount(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "cpu list unavailable",
            ))
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub name: String,
    pub value: i64,
    pub tags: Vec<String>,
}

/// Sink that records every counter, optionally failing after N calls
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<Record>>,
    calls: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    /// Sum of the values of `name` carrying `tag`
    pub fn total(&self, name: &str, tag: &str) -> i64 {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.name == name && r.tags.iter().any(|t| t == tag))
            .map(|r| r.value)
            .sum()
    }

    /// Fail every call once `n` calls have succeeded since this call
    pub fn fail_after(&self, n: Option<usize>) {
        self.calls.store(0, Ordering::SeqCst);
        *self.fail_after.lock().unwrap() = n;
    }
}

impl MetricsSink for RecordingSink {
    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), SinkError> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if calls >= limit {
                return Err(SinkError::Unavailable("injected failure".to_string()));
            }
        }

        self.records.lock().unwrap().push(Record {
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
        });
        Ok(())
    }
}

/// Hooks recording custom events and generation bumps
#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<CustomEvent>>,
    bumps: AtomicUsize,
}

impl RecordingHooks {
    pub fn events(&self) -> Vec<CustomEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn bumps(&self) -> usize {
        self.bumps.load(Ordering::SeqCst)
    }
}

impl ProbeHooks for RecordingHooks {
    fn dispatch_custom_event(&self, event: CustomEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn bump_cache_generations(&self) {
        self.bumps.fetch_add(1, Ordering::SeqCst);
    }
}

/// A monitor wired to in-memory collaborators
pub struct Fixture {
    pub monitor: Arc<PerfBufferMonitor>,
    pub sink: Arc<RecordingSink>,
    pub hooks: Arc<RecordingHooks>,
    tables: HashMap<String, MemoryTable>,
}

impl Fixture {
    pub fn new(buffers: &[&str], cpus: usize) -> Self {
        let mut manager = MemoryManager::with_buffers(buffers, cpus);
        let sink = Arc::new(RecordingSink::default());
        let hooks = Arc::new(RecordingHooks::default());
        let config = MonitorConfig {
            tags: vec!["cardinality:none".to_string()],
            ..MonitorConfig::default()
        };

        let monitor = PerfBufferMonitor::new(
            &mut manager,
            Arc::clone(&sink) as Arc<dyn MetricsSink>,
            Arc::clone(&hooks) as Arc<dyn ProbeHooks>,
            &config,
        )
        .unwrap();

        Self {
            monitor: Arc::new(monitor),
            sink,
            hooks,
            tables: manager.tables,
        }
    }

    /// Statistics map of `buffer`
    pub fn table(&self, buffer: &str) -> MemoryTable {
        self.tables[&format!("{}_stats", buffer)].clone()
    }
}
