//! rblk-bench: drives the remote I/O engine with a synthetic page workload.
//!
//! Builds the configured transport (an in-process ring peer, a loopback
//! memory server for the fabric path, or local memory), pushes a fixed
//! number of multi-segment requests through the engine with a bounded
//! number outstanding, and reports throughput and completion latency.
//!
//! # Usage
//!
//! ```text
//! rblk-bench --transport ring --requests 20000 --segments 8 --write-ratio 30
//! rblk-bench --config rblk.toml
//! rblk-bench --generate-config rblk.toml
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::Parser;
use flume::Receiver;
use rblk_core::{PAGE_SIZE, RblkError, Result};
use rblk_engine::{
    ChannelSink, CompletedRequest, Engine, EngineConfig, IoRequest, Segment, build_transport,
};
use rblk_io::TransportKind;
use rblk_net::{Fabric, LoopbackFabric, ServerOptions};
use tracing::{error, info, warn};

/// rblk remote I/O engine benchmark
#[derive(Parser, Debug, Clone)]
#[command(name = "rblk-bench", about = "Load generator for the rblk remote I/O engine")]
struct Args {
    /// Engine configuration file (.toml or .json)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Transport override: ring, fabric or local
    #[arg(long, short = 't')]
    transport: Option<String>,

    /// Number of requests to complete
    #[arg(long, short = 'n', default_value = "10000")]
    requests: u64,

    /// Segments per request
    #[arg(long, short = 's', default_value = "4")]
    segments: u64,

    /// Bytes per segment
    #[arg(long, default_value = "4096")]
    segment_size: usize,

    /// Percentage of requests that evict (write) instead of fault (read)
    #[arg(long, short = 'w', default_value = "50")]
    write_ratio: u64,

    /// Requests outstanding at once
    #[arg(long, short = 'p', default_value = "64")]
    pipeline: u64,

    /// Write a default configuration file and exit
    #[arg(long)]
    generate_config: Option<PathBuf>,
}

/// Request latency at the usual cut points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct LatencySummary {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    p999: Duration,
    max: Duration,
}

impl LatencySummary {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort_unstable();
        let at = |p: f64| -> Duration {
            if samples.is_empty() {
                return Duration::ZERO;
            }
            let rank = ((p / 100.0) * (samples.len() - 1) as f64).round() as usize;
            samples[rank.min(samples.len() - 1)]
        };
        Self {
            p50: at(50.0),
            p95: at(95.0),
            p99: at(99.0),
            p999: at(99.9),
            max: samples.last().copied().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "p50={} p95={} p99={} p999={} max={}",
            format_latency(self.p50),
            format_latency(self.p95),
            format_latency(self.p99),
            format_latency(self.p999),
            format_latency(self.max),
        )
    }
}

/// Page operations sit in the microsecond range; anything slower is
/// shown in milliseconds.
fn format_latency(latency: Duration) -> String {
    let us = latency.as_secs_f64() * 1_000_000.0;
    if us < 1_000.0 {
        format!("{us:.1}µs")
    } else {
        format!("{:.2}ms", us / 1_000.0)
    }
}

/// Pages moved per second, with the equivalent MiB/s.
fn format_page_rate(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let pages = bytes.div_ceil(PAGE_SIZE as u64) as f64 / secs;
    format!("{pages:.0} pages/s ({:.1} MiB/s)", bytes as f64 / secs / (1024.0 * 1024.0))
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rblk=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn generate_config(path: &Path) -> Result<()> {
    let content = format!(
        "# rblk engine configuration\n# Generated by: rblk-bench --generate-config {}\n#\n# All values shown are defaults.\n\n{}",
        path.display(),
        EngineConfig::default().to_toml()?
    );
    std::fs::write(path, content)?;
    Ok(())
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(kind) = &args.transport {
        config.transport.kind = match kind.as_str() {
            "ring" => TransportKind::Ring,
            "fabric" => TransportKind::Fabric,
            "local" => TransportKind::Local,
            other => return Err(RblkError::Config(format!("unknown transport: {other}"))),
        };
    }
    config.tracker.max_segment_size = config.tracker.max_segment_size.max(args.segment_size);
    config.validate()?;
    Ok(config)
}

/// Deterministic workload: request `id` touches `segments` pages spread over
/// the device, and every `write_ratio` out of 100 requests evicts.
fn build_request(args: &Args, id: u64, slots: u64) -> IoRequest {
    let is_write = id % 100 < args.write_ratio;
    let segments = (0..args.segments)
        .map(|s| {
            let slot = (id * args.segments + s).wrapping_mul(7919) % slots;
            let position = slot * args.segment_size as u64;
            if is_write {
                Segment::write(position, Bytes::from(vec![(id % 251) as u8; args.segment_size]))
            } else {
                Segment::read(position, args.segment_size)
            }
        })
        .collect();
    IoRequest::new(id, segments)
}

struct Outcome {
    completed: u64,
    failed: u64,
    latencies: Vec<Duration>,
    elapsed: Duration,
}

fn drive(args: &Args, engine: &Engine, rx: &Receiver<CompletedRequest>) -> Result<Outcome> {
    let slots = (engine.transport().capacity() / args.segment_size as u64).max(1);
    let mut submitted_at: Vec<Option<Instant>> = vec![None; args.requests as usize];
    let mut latencies = Vec::with_capacity(args.requests as usize);
    let (mut next, mut outstanding, mut completed, mut failed) = (0u64, 0u64, 0u64, 0u64);
    let start = Instant::now();

    while completed + failed < args.requests {
        while next < args.requests && outstanding < args.pipeline {
            match engine.submit(build_request(args, next, slots)) {
                Ok(()) => {
                    submitted_at[next as usize] = Some(Instant::now());
                    next += 1;
                    outstanding += 1;
                },
                Err(rejected) if rejected.is_busy() => break,
                Err(rejected) => {
                    warn!(target: "rblk::bench", error = %rejected.error, "Request refused");
                    failed += 1;
                    next += 1;
                },
            }
        }
        if outstanding == 0 {
            std::thread::yield_now();
            continue;
        }

        let done = rx
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| RblkError::Timeout("request completion"))?;
        outstanding -= 1;
        if done.is_ok() {
            completed += 1;
        } else {
            failed += 1;
        }
        if let Some(at) = submitted_at.get(done.request_id as usize).copied().flatten() {
            latencies.push(at.elapsed());
        }
    }

    Ok(Outcome {
        completed,
        failed,
        latencies,
        elapsed: start.elapsed(),
    })
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let fabric = (config.transport.kind == TransportKind::Fabric).then(|| {
        let fabric = LoopbackFabric::new();
        fabric.listen(&config.fabric.peer, ServerOptions::default());
        Arc::new(fabric) as Arc<dyn Fabric>
    });

    let mut handle = build_transport(&config, fabric)?;
    let (sink, rx) = ChannelSink::unbounded();
    let engine = Engine::start(&config, Arc::clone(&handle.transport), Arc::new(sink))?;

    info!(target: "rblk::bench", "╔══════════════════════════════════════════════════════════════╗");
    info!(target: "rblk::bench", "║                      RBLK BENCHMARK                          ║");
    info!(target: "rblk::bench", "╠══════════════════════════════════════════════════════════════╣");
    info!(target: "rblk::bench", "║  transport:   {:<47}║", config.transport.kind.to_string());
    info!(target: "rblk::bench", "║  depth:       {:<47}║", engine.queue_depth());
    info!(target: "rblk::bench", "║  requests:    {:<47}║", args.requests);
    info!(target: "rblk::bench", "║  segments:    {:<47}║", format!("{} x {} bytes", args.segments, args.segment_size));
    info!(target: "rblk::bench", "║  writes:      {:<47}║", format!("{}%", args.write_ratio));
    info!(target: "rblk::bench", "║  pipeline:    {:<47}║", args.pipeline);
    info!(target: "rblk::bench", "╚══════════════════════════════════════════════════════════════╝");

    let outcome = drive(args, &engine, &rx);
    let report = engine.shutdown()?;
    if let Some(peer) = handle.peer.as_mut() {
        let served = peer.stop()?;
        info!(target: "rblk::bench", served, "Ring peer stopped");
    }
    let outcome = outcome?;

    let latency = LatencySummary::from_samples(outcome.latencies);
    let secs = outcome.elapsed.as_secs_f64().max(f64::EPSILON);
    let bytes = outcome.completed * args.segments * args.segment_size as u64;
    let snapshot = engine.snapshot();

    info!(target: "rblk::bench", "completed:     {}", outcome.completed);
    info!(target: "rblk::bench", "failed:        {}", outcome.failed);
    info!(target: "rblk::bench", "elapsed:       {:.2}s", secs);
    info!(target: "rblk::bench", "requests/s:    {:.0}", outcome.completed as f64 / secs);
    info!(target: "rblk::bench", "throughput:    {}", format_page_rate(bytes, outcome.elapsed));
    info!(target: "rblk::bench", "page rate:     {:.2} Mbps", snapshot.throughput_mbps(outcome.elapsed));
    info!(target: "rblk::bench", "peak inflight: {}", engine.peak_in_flight());
    info!(target: "rblk::bench", "busy retries:  {}", snapshot.busy_retries);
    info!(target: "rblk::bench", "latency:       {latency}");
    if report.abandoned > 0 {
        warn!(target: "rblk::bench", abandoned = report.abandoned, "Requests abandoned at shutdown");
    }
    Ok(())
}

fn main() {
    init_tracing();

    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        match generate_config(path) {
            Ok(()) => info!(target: "rblk::bench", path = %path.display(), "Configuration written"),
            Err(e) => {
                error!(target: "rblk::bench", error = %e, "Failed to write configuration");
                std::process::exit(1);
            },
        }
        return;
    }

    if let Err(e) = run(&args) {
        error!(target: "rblk::bench", error = %e, "Benchmark failed");
        std::process::exit(1);
    }
}
