//! Metrics sinks
//!
//! Provides the transports the monitor reports its counters through
//! (DogStatsD over UDP, log lines, JSON lines).

use crate::error::SinkError;
use log::info;
use serde::Serialize;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    net::{SocketAddr, UdpSocket},
    path::PathBuf,
    sync::Mutex,
};

pub const METRIC_EVENTS_READ: &str = "perf_buffer.events.read";
pub const METRIC_BYTES_READ: &str = "perf_buffer.bytes.read";
pub const METRIC_SORTING_ERROR: &str = "perf_buffer.sorting_error";
pub const METRIC_LOST_READ: &str = "perf_buffer.lost_events.read";
pub const METRIC_EVENTS_WRITE: &str = "perf_buffer.events.write";
pub const METRIC_BYTES_WRITE: &str = "perf_buffer.bytes.write";
pub const METRIC_LOST_WRITE: &str = "perf_buffer.lost_events.write";

/// Trait for counter transports
pub trait MetricsSink: Send + Sync {
    /// Report `value` occurrences of the counter `name`
    ///
    /// # Arguments
    ///
    /// * `name` - Metric name, without namespace
    /// * `value` - Increment
    /// * `tags` - `key:value` tags
    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), SinkError>;
}

/// Sink selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkType {
    /// DogStatsD datagrams over UDP
    Statsd,
    /// Log lines
    Log,
    /// JSON lines file
    Json,
}

/// Format one DogStatsD counter datagram
fn statsd_line(namespace: &str, name: &str, value: i64, tags: &[String]) -> String {
    let mut line = if namespace.is_empty() {
        format!("{}:{}|c", name, value)
    } else {
        format!("{}.{}:{}|c", namespace, name, value)
    };

    let tags: Vec<&str> = tags
        .iter()
        .map(String::as_str)
        .filter(|t| !t.is_empty())
        .collect();
    if !tags.is_empty() {
        line.push_str("|#");
        line.push_str(&tags.join(","));
    }

    line
}

/// DogStatsD sink
pub struct StatsdSink {
    socket: UdpSocket,
    namespace: String,
}

impl StatsdSink {
    /// Create a sink sending to `addr`
    ///
    /// # Arguments
    ///
    /// * `addr` - Address of the DogStatsD server
    /// * `namespace` - Prefix prepended to every metric name
    pub fn connect(addr: SocketAddr, namespace: impl Into<String>) -> Result<Self, SinkError> {
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(addr)?;

        Ok(Self {
            socket,
            namespace: namespace.into(),
        })
    }
}

impl MetricsSink for StatsdSink {
    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), SinkError> {
        let line = statsd_line(&self.namespace, name, value, tags);
        self.socket.send(line.as_bytes())?;
        Ok(())
    }
}

/// Log sink, for dry runs
pub struct LogSink {
    namespace: String,
}

impl LogSink {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl MetricsSink for LogSink {
    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), SinkError> {
        info!("{}", statsd_line(&self.namespace, name, value, tags));
        Ok(())
    }
}

#[derive(Serialize)]
struct CounterRecord<'a> {
    timestamp: String,
    name: String,
    value: i64,
    tags: &'a [String],
}

/// JSON lines sink
pub struct JsonLinesSink {
    file: Mutex<File>,
    namespace: String,
}

impl JsonLinesSink {
    /// Create a JSON lines sink
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file, appended to
    /// * `namespace` - Prefix prepended to every metric name
    pub fn create(output_path: PathBuf, namespace: impl Into<String>) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output_path)?;

        Ok(Self {
            file: Mutex::new(file),
            namespace: namespace.into(),
        })
    }
}

impl MetricsSink for JsonLinesSink {
    fn count(&self, name: &str, value: i64, tags: &[String]) -> Result<(), SinkError> {
        let name = if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.namespace, name)
        };
        let record = CounterRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            name,
            value,
            tags,
        };

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| SinkError::Unavailable("json sink lock poisoned".to_string()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statsd_line_format() {
        let tags = vec![
            "cardinality:none".to_string(),
            "map:events".to_string(),
            "event_type:exec".to_string(),
        ];
        let line = statsd_line("runtime_security", METRIC_EVENTS_READ, 42, &tags);

        assert_eq!(
            line,
            "runtime_security.perf_buffer.events.read:42|c|#cardinality:none,map:events,event_type:exec"
        );
    }

    #[test]
    fn test_statsd_line_without_tags() {
        assert_eq!(statsd_line("", METRIC_LOST_READ, 1, &[]), "perf_buffer.lost_events.read:1|c");
    }

    #[test]
    fn test_statsd_sink_sends_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink = StatsdSink::connect(server.local_addr().unwrap(), "ns").unwrap();

        sink.count(METRIC_BYTES_WRITE, 512, &["map:dns".to_string()])
            .unwrap();

        let mut buf = [0u8; 256];
        let len = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ns.perf_buffer.bytes.write:512|c|#map:dns");
    }

    #[test]
    fn test_json_lines_sink() {
        let path = std::env::temp_dir().join(format!("perfbuf-sink-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let sink = JsonLinesSink::create(path.clone(), "ns").unwrap();
        sink.count(METRIC_SORTING_ERROR, 3, &["map:events".to_string()])
            .unwrap();
        sink.count(METRIC_EVENTS_READ, 7, &[]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["name"], "ns.perf_buffer.sorting_error");
        assert_eq!(lines[0]["value"], 3);
        assert_eq!(lines[1]["tags"], serde_json::json!([]));

        let _ = std::fs::remove_file(&path);
    }
}
