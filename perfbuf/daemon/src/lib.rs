//! Perf Buffer Monitor Library
//!
//! Counts the events read from the perf buffers of an eBPF probe, reconciles
//! them with the statistics the kernel keeps about what it wrote, and reports
//! both as tagged counters.

pub mod config;
pub mod error;
pub mod events;
pub mod grid;
pub mod hooks;
pub mod loader;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod sink;
pub mod stats;

#[cfg(test)]
mod testing;

pub use config::{DaemonConfig, MonitorConfig};
pub use error::{MonitorError, SinkError, TableError};
pub use events::{EventProcessor, Reporter};
pub use hooks::DaemonHooks;
pub use loader::ProbeLoader;
pub use manager::{CustomEvent, EbpfManager, ProbeHooks, StatsEntry, StatsTable};
pub use monitor::{EventStats, PerfBufferMonitor, ReconcileReport};
pub use registry::{BufferId, BufferRegistry, PerfBufferSpec};
pub use sink::{JsonLinesSink, LogSink, MetricsSink, SinkType, StatsdSink};
