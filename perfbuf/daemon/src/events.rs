//! Event processing from eBPF perf buffers
//!
//! Reads records from per-CPU perf buffers, feeds them to the monitor, and
//! runs the periodic reporting cycle.

use crate::{error::MonitorError, monitor::PerfBufferMonitor, registry::BufferId};
use anyhow::{bail, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    util::online_cpus,
};
use bytes::BytesMut;
use log::{debug, info, warn};
use probe_common::{EventHeader, EventType};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    task::{JoinError, JoinHandle},
    time::{interval, timeout, MissedTickBehavior},
};

/// Number of records read from a perf buffer in one call
const READ_BATCH: usize = 10;

/// Initial capacity of each record buffer
const RECORD_CAPACITY: usize = 4096;

/// Count one perf buffer record read on `cpu`
///
/// Records without a valid header are dropped.
pub fn record_event(monitor: &PerfBufferMonitor, buffer: BufferId, cpu: usize, record: &[u8]) -> bool {
    let header = match EventHeader::from_bytes(record) {
        Ok(header) => header,
        Err(e) => {
            debug!("dropping record from CPU {}: {}", cpu, e);
            return false;
        }
    };

    let Some(event_type) = EventType::from_index(header.event_type) else {
        debug!("dropping record from CPU {}: unknown event type {}", cpu, header.event_type);
        return false;
    };

    monitor.count_event(
        event_type,
        header.timestamp_ns,
        1,
        record.len() as u64,
        buffer,
        cpu,
    );
    true
}

/// Runs the reporting cycles of a monitor, one at a time
///
/// A cycle runs on the blocking pool. When it overruns its deadline it keeps
/// running in the background, and no other cycle starts until it is done.
pub struct Reporter {
    monitor: Arc<PerfBufferMonitor>,
    deadline: Duration,
    in_flight: Mutex<Option<JoinHandle<Result<(), MonitorError>>>>,
}

impl Reporter {
    /// Create a reporter
    ///
    /// # Arguments
    ///
    /// * `monitor` - Shared perf buffer monitor
    /// * `deadline` - Maximum duration of one reporting cycle
    pub fn new(monitor: Arc<PerfBufferMonitor>, deadline: Duration) -> Self {
        Self {
            monitor,
            deadline,
            in_flight: Mutex::new(None),
        }
    }

    /// Run one cycle, skipped while an overrunning cycle is still in flight
    pub async fn cycle(&self) -> Result<()> {
        let mut in_flight = self.in_flight.lock().await;

        if let Some(previous) = in_flight.take() {
            if !previous.is_finished() {
                *in_flight = Some(previous);
                bail!("previous reporting cycle still running, skipping");
            }
            log_overrun_result(previous.await);
        }

        self.run(&mut in_flight).await
    }

    /// Wait for an overrunning cycle, then run a last one
    pub async fn flush(&self) -> Result<()> {
        let mut in_flight = self.in_flight.lock().await;

        if let Some(mut previous) = in_flight.take() {
            match timeout(self.deadline, &mut previous).await {
                Ok(result) => log_overrun_result(result),
                Err(_) => {
                    *in_flight = Some(previous);
                    bail!("previous reporting cycle still running after {:?}", self.deadline);
                }
            }
        }

        self.run(&mut in_flight).await
    }

    async fn run(
        &self,
        in_flight: &mut Option<JoinHandle<Result<(), MonitorError>>>,
    ) -> Result<()> {
        let monitor = Arc::clone(&self.monitor);
        let mut cycle = tokio::task::spawn_blocking(move || monitor.send_stats());

        match timeout(self.deadline, &mut cycle).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                *in_flight = Some(cycle);
                bail!("reporting cycle exceeded {:?}", self.deadline)
            }
        }
    }
}

fn log_overrun_result(result: Result<Result<(), MonitorError>, JoinError>) {
    match result {
        Ok(Ok(())) => debug!("overrunning reporting cycle completed"),
        Ok(Err(e)) => warn!("overrunning reporting cycle failed: {}", e),
        Err(e) => warn!("overrunning reporting cycle panicked: {}", e),
    }
}

/// Event processor that reads from perf buffers
pub struct EventProcessor {
    monitor: Arc<PerfBufferMonitor>,
    verbose: bool,
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `monitor` - Shared perf buffer monitor
    /// * `verbose` - Enable verbose logging
    pub fn new(monitor: Arc<PerfBufferMonitor>, verbose: bool) -> Self {
        Self { monitor, verbose }
    }

    /// Spawn per-CPU event readers for one perf buffer
    ///
    /// # Arguments
    ///
    /// * `buffer` - Registered perf buffer the array belongs to
    /// * `perf_array` - Perf event array from the eBPF program
    /// * `page_count` - Ring buffer size in pages, None for the aya default
    pub fn spawn_cpu_readers(
        &self,
        buffer: BufferId,
        mut perf_array: AsyncPerfEventArray<MapData>,
        page_count: Option<usize>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let cpus = online_cpus()?;
        let name = self.monitor.registry().name(buffer).unwrap_or_default().to_string();
        info!("Spawning {} readers for {} CPUs", name, cpus.len());

        let mut handles = Vec::with_capacity(cpus.len());
        for cpu_id in cpus {
            let mut buf = perf_array.open(cpu_id, page_count)?;
            let monitor = Arc::clone(&self.monitor);
            let verbose = self.verbose;
            let cpu = cpu_id as usize;

            handles.push(tokio::spawn(async move {
                let mut buffers = (0..READ_BATCH)
                    .map(|_| BytesMut::with_capacity(RECORD_CAPACITY))
                    .collect::<Vec<_>>();

                loop {
                    let events = match buf.read_events(&mut buffers).await {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("Error reading events from CPU {}: {}", cpu_id, e);
                            continue;
                        }
                    };

                    if events.lost > 0 {
                        if verbose {
                            debug!("CPU {}: {} records lost", cpu_id, events.lost);
                        }
                        monitor.count_lost_event(events.lost as u64, buffer, cpu);
                    }

                    for record in buffers.iter().take(events.read) {
                        record_event(&monitor, buffer, cpu, record);
                    }
                }
            }));
        }

        Ok(handles)
    }

    /// Spawn the periodic reporter
    ///
    /// # Arguments
    ///
    /// * `reporter` - Reporter shared with the final flush
    /// * `period` - Reporting interval
    pub fn spawn_reporter(&self, reporter: Arc<Reporter>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if let Err(e) = reporter.cycle().await {
                    warn!("failed to send perf buffer statistics: {:#}", e);
                }
            }
        })
    }
}
