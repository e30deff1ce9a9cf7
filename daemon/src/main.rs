//! Flow Tracker - Userspace Daemon
//!
//! Loads the connection probes, feeds their events into the tracking
//! engine, polls it as a built-in client and exports diagnostics on exit.
//!
//! ## Usage
//!
//! ```bash
//! # Run until interrupted, export diagnostics as JSON
//! sudo ./flow-tracker --ebpf-object path/to/flow-probes.o
//!
//! # Run for 5 minutes with a config file
//! sudo ./flow-tracker --ebpf-object flow-probes.o --config tracker.json --duration 300
//!
//! # Export to Prometheus format
//! sudo ./flow-tracker --ebpf-object flow-probes.o --format prometheus --output flows.prom
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use flow_tracker::{
    config::EngineConfig,
    engine::Engine,
    events::{EventProcessor, RecordKind},
    exporter::ExporterType,
    loader::ProbeLoader,
    types::Protocol,
};
use log::info;
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal,
    time::{interval, sleep, MissedTickBehavior},
};

/// Name the daemon registers its own polling client under
const DAEMON_CLIENT: &str = "daemon";

/// Connection tracking and protocol classification daemon
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON engine configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Path to the compiled eBPF probe object
    #[clap(long)]
    ebpf_object: PathBuf,

    /// Duration to run (in seconds, 0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Seconds between polls of the built-in client
    #[clap(long, default_value_t = 10)]
    status_interval: u64,

    /// Output file for the diagnostics export
    #[clap(short, long, default_value = "flow-tracker-diagnostics.json")]
    output: PathBuf,

    /// Output format (json, prometheus)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Closed-connection buffer capacity (overrides the config file)
    #[clap(long)]
    closed_buffer_capacity: Option<usize>,

    /// Idle timeout in seconds (overrides the config file)
    #[clap(long)]
    idle_timeout: Option<u64>,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(capacity) = args.closed_buffer_capacity {
        config.closed_buffer_capacity = capacity;
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout = Duration::from_secs(secs);
    }
    config.validate()?;
    Ok(config)
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

    if args.status_interval == 0 {
        anyhow::bail!("Status interval must be >= 1");
    }
    let export_format = ExporterType::parse(&args.format).with_context(|| {
        format!(
            "Unsupported format: {}. Use json or prometheus",
            args.format
        )
    })?;
    let config = load_config(&args)?;

    info!("Starting flow tracker...");
    info!(
        "   Duration: {}",
        if args.duration == 0 {
            "until interrupted".to_string()
        } else {
            format!("{} seconds", args.duration)
        }
    );
    info!("   Closed buffer: {} slots", config.closed_buffer_capacity);
    info!("   Idle timeout: {:?}", config.idle_timeout);
    info!("   Output: {:?} ({:?})", args.output, export_format);

    let engine = Arc::new(Engine::new(config)?);

    // Load and attach probes
    let mut loader = ProbeLoader::load(&args.ebpf_object)?;
    loader.init_logger();
    loader.attach_kprobes()?;

    // Start ingestion
    let processor = EventProcessor::new(Arc::clone(&engine));
    for kind in RecordKind::ALL {
        if let Some(perf_array) = loader.take_perf_array(kind)? {
            processor.spawn_cpu_readers(kind, perf_array)?;
        }
    }

    engine.start_sweeper();
    engine.register_client(DAEMON_CLIENT);
    spawn_status_client(Arc::clone(&engine), Duration::from_secs(args.status_interval));

    info!("Tracking connections...");

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

    engine.shutdown().await;

    // Drain what shutdown closed before reporting
    if let Some(result) = engine.poll_since(DAEMON_CLIENT) {
        log_poll(&result.closed, result.active.len(), result.dropped);
    }
    engine.unregister_client(DAEMON_CLIENT);

    let diagnostics = engine.diagnostics();
    export_format.build(args.output.clone()).export(&diagnostics)?;
    info!("Diagnostics written to {:?}", args.output);
    info!("Summary: {}", diagnostics.summary());

    // Keep the probes attached until everything above is done
    drop(loader);

    Ok(())
}

/// Poll the engine as a regular client and log what it returns
fn spawn_status_client(engine: Arc<Engine>, period: Duration) {
    let mut shutdown = engine.shutdown_signal();
    let task_engine = Arc::clone(&engine);
    let handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(result) = task_engine.poll_since(DAEMON_CLIENT) else {
                        break;
                    };
                    log_poll(&result.closed, result.active.len(), result.dropped);
                    info!("Status: {}", task_engine.diagnostics().summary());
                }
                _ = shutdown.changed() => break,
            }
        }
    });
    engine.track_task(handle);
}

fn log_poll(closed: &[Arc<flow_tracker::closed::ClosedSlot>], active: usize, dropped: u64) {
    let mut by_protocol: HashMap<&'static str, usize> = HashMap::new();
    for slot in closed {
        let protocol = slot.snapshot.protocol.unwrap_or(Protocol::Unknown);
        *by_protocol.entry(protocol.as_str()).or_default() += 1;
    }
    let mut breakdown: Vec<_> = by_protocol.into_iter().collect();
    breakdown.sort();
    info!(
        "Poll: {} active touched, {} closed {:?}, {} dropped",
        active,
        closed.len(),
        breakdown,
        dropped
    );
}
