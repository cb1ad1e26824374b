//! Daemon configuration
//!
//! Loaded from a JSON file passed on the command line. Describes the perf
//! buffers to monitor, their statistics maps and the programs to attach.

use crate::registry::PerfBufferSpec;
use anyhow::{bail, Context, Result};
use probe_common::{DEFAULT_PERF_RING_BUFFER_SIZE, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path};

/// Monitor reporting options
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    /// Prefix prepended to every metric name
    pub namespace: String,
    /// Tags attached to every metric
    pub tags: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            namespace: "runtime_security".to_string(),
            tags: Vec::new(),
        }
    }
}

/// A perf buffer and its kernel statistics map
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PerfBufferConfig {
    /// Name of the perf event array map
    pub name: String,
    /// Name of the per-CPU statistics map
    pub statistics_map: String,
    /// Ring buffer size in bytes, per CPU
    #[serde(default)]
    pub ring_buffer_size: Option<u64>,
}

/// Kprobe to attach
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KprobeConfig {
    /// Program name in the eBPF object
    pub program: String,
    /// Kernel function to attach to
    pub function: String,
}

/// Tracepoint to attach
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TracepointConfig {
    /// Program name in the eBPF object
    pub program: String,
    pub category: String,
    pub name: String,
}

/// Complete daemon configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DaemonConfig {
    pub perf_buffers: Vec<PerfBufferConfig>,
    #[serde(default = "default_ring_buffer_size")]
    pub default_ring_buffer_size: u64,
    #[serde(default)]
    pub kprobes: Vec<KprobeConfig>,
    #[serde(default)]
    pub tracepoints: Vec<TracepointConfig>,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_ring_buffer_size() -> u64 {
    DEFAULT_PERF_RING_BUFFER_SIZE
}

fn check_ring_buffer_size(name: &str, size: u64) -> Result<()> {
    if size == 0 || size % PAGE_SIZE != 0 || !(size / PAGE_SIZE).is_power_of_two() {
        bail!(
            "ring buffer size of {} must be a power-of-two multiple of {} bytes, got {}",
            name,
            PAGE_SIZE,
            size
        );
    }
    Ok(())
}

impl DaemonConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: DaemonConfig = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.perf_buffers.is_empty() {
            bail!("at least one perf buffer must be configured");
        }

        check_ring_buffer_size("default", self.default_ring_buffer_size)?;

        let mut names = HashSet::new();
        for buffer in &self.perf_buffers {
            if !names.insert(buffer.name.as_str()) {
                bail!("perf buffer {} is configured twice", buffer.name);
            }
            if let Some(size) = buffer.ring_buffer_size {
                check_ring_buffer_size(&buffer.name, size)?;
            }
        }

        Ok(())
    }

    pub fn perf_buffer_specs(&self) -> Vec<PerfBufferSpec> {
        self.perf_buffers
            .iter()
            .map(|buffer| PerfBufferSpec {
                name: buffer.name.clone(),
                ring_buffer_size: buffer.ring_buffer_size,
            })
            .collect()
    }

    pub fn statistics_maps(&self) -> Vec<(String, String)> {
        self.perf_buffers
            .iter()
            .map(|buffer| (buffer.name.clone(), buffer.statistics_map.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "perf_buffers": [
            { "name": "events", "statistics_map": "events_stats" },
            { "name": "dns", "statistics_map": "dns_stats", "ring_buffer_size": 32768 }
        ],
        "kprobes": [{ "program": "kprobe_vfs_rename", "function": "vfs_rename" }],
        "monitor": { "tags": ["cardinality:none"] }
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config: DaemonConfig = serde_json::from_str(CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.default_ring_buffer_size, DEFAULT_PERF_RING_BUFFER_SIZE);
        assert_eq!(config.monitor.namespace, "runtime_security");
        assert_eq!(config.monitor.tags, vec!["cardinality:none".to_string()]);
        assert!(config.tracepoints.is_empty());

        let specs = config.perf_buffer_specs();
        assert_eq!(specs[0].ring_buffer_size, None);
        assert_eq!(specs[1].ring_buffer_size, Some(32768));
        assert_eq!(
            config.statistics_maps()[1],
            ("dns".to_string(), "dns_stats".to_string())
        );
    }

    #[test]
    fn test_validation() {
        let mut config: DaemonConfig = serde_json::from_str(CONFIG).unwrap();
        config.perf_buffers[1].ring_buffer_size = Some(3 * PAGE_SIZE);
        assert!(config.validate().is_err());

        let mut config: DaemonConfig = serde_json::from_str(CONFIG).unwrap();
        config.perf_buffers[1].name = "events".to_string();
        assert!(config.validate().is_err());

        let mut config: DaemonConfig = serde_json::from_str(CONFIG).unwrap();
        config.perf_buffers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("perfbuf-config-{}.json", std::process::id()));
        std::fs::write(&path, CONFIG).unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.perf_buffers.len(), 2);
        assert_eq!(config.kprobes[0].function, "vfs_rename");

        let _ = std::fs::remove_file(&path);
        assert!(DaemonConfig::load(&path).is_err());
    }
}
