//! Error types for the perf buffer monitor

use probe_common::NotEnoughData;

/// Errors raised while building the monitor or reporting its statistics
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("statistics map {0} not found")]
    StatisticsMapNotFound(String),
    #[error("statistics map {stats_map} references unknown perf buffer {buffer}")]
    UnknownBuffer { buffer: String, stats_map: String },
    #[error("couldn't fetch the host CPU count: {0}")]
    CpuCount(#[source] std::io::Error),
    #[error("invalid statistics map {name}: {detail}")]
    Map { name: String, detail: String },
    #[error("failed to emit metrics: {0}")]
    Emission(#[from] SinkError),
}

/// Errors raised while walking a kernel statistics map
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("malformed statistics entry: {0}")]
    Decode(NotEnoughData),
    #[error("failed to dump the statistics map: {0}")]
    Iteration(String),
}

impl From<NotEnoughData> for TableError {
    fn from(err: NotEnoughData) -> Self {
        TableError::Decode(err)
    }
}

/// Errors raised by a metrics transport
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("metrics transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metrics serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("metrics transport unavailable: {0}")]
    Unavailable(String),
}
