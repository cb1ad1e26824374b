//! Perf Buffer Monitor - Userspace Daemon
//!
//! Loads the eBPF programs, reads their perf buffers, and periodically
//! reports how many events and bytes were written, read and lost.
//!
//! ## Usage
//!
//! ```bash
//! # Report to a local DogStatsD server every 10 seconds
//! sudo ./perfbuf-monitor --config monitor.json --ebpf-object probe.o
//!
//! # Dry run, counters printed as log lines
//! sudo ./perfbuf-monitor --config monitor.json --ebpf-object probe.o --sink log
//!
//! # Capture counters to a JSON lines file for 60 seconds
//! sudo ./perfbuf-monitor --config monitor.json --ebpf-object probe.o \
//!     --sink json --output counters.jsonl --duration 60
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use perfbuf_monitor::{
    config::DaemonConfig,
    events::{EventProcessor, Reporter},
    hooks::DaemonHooks,
    loader::ProbeLoader,
    monitor::PerfBufferMonitor,
    sink::{JsonLinesSink, LogSink, MetricsSink, SinkType, StatsdSink},
};
use probe_common::PAGE_SIZE;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::{signal, time::sleep};

/// Perf buffer telemetry monitor for eBPF probes
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[clap(short, long)]
    config: PathBuf,

    /// Path to eBPF object file
    #[clap(long)]
    ebpf_object: PathBuf,

    /// Reporting interval in seconds
    #[clap(short, long, default_value_t = 10)]
    interval: u64,

    /// Deadline of one reporting cycle in seconds
    #[clap(long, default_value_t = 5)]
    timeout: u64,

    /// Metrics sink (statsd, log, json)
    #[clap(short, long, default_value = "statsd")]
    sink: String,

    /// DogStatsD server address
    #[clap(long, default_value = "127.0.0.1:8125")]
    statsd_addr: SocketAddr,

    /// Output file of the json sink
    #[clap(short, long, default_value = "perfbuf-counters.jsonl")]
    output: PathBuf,

    /// Duration to run the monitor (in seconds, 0 = infinite)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    info!("Starting perf buffer monitor...");
    info!("   Config: {:?}", args.config);
    info!("   Interval: {} seconds", args.interval);
    info!("   Sink: {}", args.sink);

    if args.interval == 0 {
        anyhow::bail!("Interval must be >= 1");
    }

    let sink_type = match args.sink.to_lowercase().as_str() {
        "statsd" | "dogstatsd" => SinkType::Statsd,
        "log" => SinkType::Log,
        "json" | "jsonl" => SinkType::Json,
        _ => anyhow::bail!("Unsupported sink: {}. Use statsd, log, or json", args.sink),
    };

    let config = DaemonConfig::load(&args.config)?;
    let namespace = config.monitor.namespace.clone();

    let sink: Arc<dyn MetricsSink> = match sink_type {
        SinkType::Statsd => Arc::new(
            StatsdSink::connect(args.statsd_addr, namespace)
                .with_context(|| format!("Failed to reach DogStatsD at {}", args.statsd_addr))?,
        ),
        SinkType::Log => Arc::new(LogSink::new(namespace)),
        SinkType::Json => Arc::new(
            JsonLinesSink::create(args.output.clone(), namespace)
                .with_context(|| format!("Failed to open output file: {:?}", args.output))?,
        ),
    };

    // Load eBPF program and attach its hooks
    let mut loader = ProbeLoader::load(&args.ebpf_object, config.clone())?;
    loader.attach_kprobes()?;
    loader.attach_tracepoints()?;

    let hooks = Arc::new(DaemonHooks::new());
    let monitor = Arc::new(
        PerfBufferMonitor::new(&mut loader, sink, hooks.clone(), &config.monitor)
            .context("Failed to create the perf buffer monitor")?,
    );

    let processor = EventProcessor::new(Arc::clone(&monitor), args.verbose);

    // Spawn per-CPU readers for every perf buffer
    for (name, perf_array) in loader.take_perf_buffers()? {
        let buffer = monitor
            .buffer_id(&name)
            .with_context(|| format!("perf buffer {} is not registered", name))?;
        let page_count = monitor
            .registry()
            .ring_buffer_size(buffer)
            .map(|size| (size / PAGE_SIZE) as usize);
        processor.spawn_cpu_readers(buffer, perf_array, page_count)?;
    }

    let reporter = Arc::new(Reporter::new(
        Arc::clone(&monitor),
        Duration::from_secs(args.timeout),
    ));
    processor.spawn_reporter(Arc::clone(&reporter), Duration::from_secs(args.interval));

    info!("Monitoring perf buffers...");

    // Run for specified duration or until interrupted
    if args.duration > 0 {
        tokio::select! {
            _ = sleep(Duration::from_secs(args.duration)) => {
                info!("Duration reached, shutting down...");
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
            }
        }
    } else {
        signal::ctrl_c().await?;
        info!("Interrupted, shutting down...");
    }

    // Flush what was counted since the last cycle
    reporter
        .flush()
        .await
        .context("Failed to send the final statistics")?;

    print_summary(&monitor, &hooks);

    Ok(())
}

fn print_summary(monitor: &PerfBufferMonitor, hooks: &DaemonHooks) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  CPUs:                {}", monitor.cpu_count());
    info!("  Perf buffers:");
    for (_, entry) in monitor.registry().iter() {
        info!(
            "    {:<16} {:>10} bytes  stats: {}",
            entry.name,
            entry.ring_buffer_size,
            entry.stats_map.as_deref().unwrap_or("-")
        );
    }
    info!("  Cache generations:   {}", hooks.generation());
    info!("  Custom events:       {}", hooks.custom_events());
    info!("");
    info!("============================================");
}
