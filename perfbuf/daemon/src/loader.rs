//! eBPF program loader
//!
//! Loads the eBPF object, attaches the configured kprobes and tracepoints,
//! and exposes the perf buffers and their statistics maps to the monitor.

use crate::{
    config::DaemonConfig,
    error::{MonitorError, TableError},
    manager::{EbpfManager, StatsEntry, StatsTable},
    registry::PerfBufferSpec,
};
use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData, PerCpuHashMap},
    programs::{KProbe, TracePoint},
    util::nr_cpus,
    Bpf,
};
use log::{info, warn};
use probe_common::{PerfMapStats, PERF_MAP_STATS_SIZE};
use std::path::Path;

type RawStatsMap = PerCpuHashMap<MapData, u32, [u8; PERF_MAP_STATS_SIZE]>;

/// Per-CPU statistics map of a perf buffer
pub struct KernelStatsTable {
    map: RawStatsMap,
}

impl StatsTable for KernelStatsTable {
    fn entries(&self) -> Box<dyn Iterator<Item = Result<StatsEntry, TableError>> + '_> {
        Box::new(self.map.iter().map(|item| {
            let (key, values) = item.map_err(|e| TableError::Iteration(e.to_string()))?;
            let per_cpu = values
                .iter()
                .map(|raw| PerfMapStats::from_bytes(raw))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(StatsEntry { key, per_cpu })
        }))
    }
}

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
    config: DaemonConfig,
}

impl ProbeLoader {
    /// Load eBPF program from file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the eBPF object file
    /// * `config` - Perf buffers and programs declared by the object
    pub fn load(path: &Path, config: DaemonConfig) -> Result<Self> {
        info!("Loading eBPF object from: {:?}", path);
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read eBPF object file: {:?}", path))?;
        let ebpf = Bpf::load(&data).context("Failed to load eBPF program")?;

        info!("eBPF program loaded successfully");

        Ok(Self { ebpf, config })
    }

    /// Attach every configured kprobe
    pub fn attach_kprobes(&mut self) -> Result<()> {
        info!("Attaching kprobes...");

        for kprobe in &self.config.kprobes {
            let program: &mut KProbe = self
                .ebpf
                .program_mut(&kprobe.program)
                .with_context(|| format!("{} program not found in eBPF object", kprobe.program))?
                .try_into()
                .with_context(|| format!("Failed to get {} as KProbe", kprobe.program))?;
            program
                .load()
                .with_context(|| format!("Failed to load {}", kprobe.program))?;
            program
                .attach(&kprobe.function, 0)
                .with_context(|| format!("Failed to attach {} kprobe", kprobe.function))?;
            info!("  ✓ Attached {} to {}", kprobe.program, kprobe.function);
        }

        Ok(())
    }

    /// Attach every configured tracepoint
    ///
    /// Tracepoints missing from the running kernel are skipped with a warning.
    pub fn attach_tracepoints(&mut self) -> Result<()> {
        info!("Attaching tracepoints...");

        for tracepoint in &self.config.tracepoints {
            let program: &mut TracePoint = self
                .ebpf
                .program_mut(&tracepoint.program)
                .with_context(|| {
                    format!("{} program not found in eBPF object", tracepoint.program)
                })?
                .try_into()
                .with_context(|| format!("Failed to get {} as TracePoint", tracepoint.program))?;
            program
                .load()
                .with_context(|| format!("Failed to load {}", tracepoint.program))?;
            match program.attach(&tracepoint.category, &tracepoint.name) {
                Ok(_) => info!(
                    "  ✓ Attached to {}:{} tracepoint",
                    tracepoint.category, tracepoint.name
                ),
                Err(e) => warn!(
                    "  ⚠ Failed to attach {}:{} tracepoint (not available on this kernel): {}",
                    tracepoint.category, tracepoint.name, e
                ),
            }
        }

        Ok(())
    }

    /// Take the perf event arrays of every configured perf buffer
    ///
    /// # Returns
    ///
    /// (perf buffer name, AsyncPerfEventArray) pairs
    pub fn take_perf_buffers(&mut self) -> Result<Vec<(String, AsyncPerfEventArray<MapData>)>> {
        let mut arrays = Vec::with_capacity(self.config.perf_buffers.len());

        for buffer in &self.config.perf_buffers {
            let map = self
                .ebpf
                .take_map(&buffer.name)
                .with_context(|| format!("{} map not found in eBPF object", buffer.name))?;
            let array = AsyncPerfEventArray::try_from(map).with_context(|| {
                format!("Failed to create AsyncPerfEventArray from {} map", buffer.name)
            })?;
            arrays.push((buffer.name.clone(), array));
        }

        Ok(arrays)
    }
}

impl EbpfManager for ProbeLoader {
    fn perf_buffers(&self) -> Vec<PerfBufferSpec> {
        self.config.perf_buffer_specs()
    }

    fn statistics_maps(&self) -> Vec<(String, String)> {
        self.config.statistics_maps()
    }

    fn resolve_statistics_table(&mut self, name: &str) -> Result<Box<dyn StatsTable>, MonitorError> {
        let map = self
            .ebpf
            .take_map(name)
            .ok_or_else(|| MonitorError::StatisticsMapNotFound(name.to_string()))?;
        let map = RawStatsMap::try_from(map).map_err(|e| MonitorError::Map {
            name: name.to_string(),
            detail: e.to_string(),
        })?;

        Ok(Box::new(KernelStatsTable { map }))
    }

    fn default_ring_buffer_size(&self) -> u64 {
        self.config.default_ring_buffer_size
    }

    fn host_cpu_count(&self) -> Result<usize, MonitorError> {
        possible_cpu_count()
    }
}

/// Number of possible CPUs, the length of every per-CPU map value
///
/// The online set can be smaller, which would hide kernel CPU slots.
pub fn possible_cpu_count() -> Result<usize, MonitorError> {
    nr_cpus().map_err(MonitorError::CpuCount)
}
