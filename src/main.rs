// The main program shall:
// - process command line arguments
// - load the optional YAML config and apply the arguments on top of it
// - set up logging
// - create the control plane: the relay client, or the simulated RAN
// - run the collection controller until it stops
// - log the collection summary
// Startup failures (no nodes, unwritable output, bad config, relay
// unreachable) end the process with a non-zero status.
// Command line arguments shall be:
// - <target>, target sample count, default 1000, 0 for no target
// - --output <path>, default /tmp/kpm_metrics_dataset.csv
// - --duration <duration>, e.g. 60 or 5m, default unlimited
// - --flush-every <rows>, default 100
// - --throughput, add the throughput service model columns
// - --primary <mac|kpm>, layer whose reports trigger rows, default mac
// - --interval <1_ms|2_ms|5_ms|10_ms|100_ms|1000_ms>, default 10_ms
// - --relay-host <host>, default 127.0.0.1
// - --relay-port <port>, default 36422
// - --simulate, generate reports in-process instead of using the relay
// - --config <path>, YAML file, overridden by the arguments above
// - --verbose, debug logging unless RUST_LOG says otherwise

mod assembler;
mod bus_client;
mod config;
mod control_plane;
mod controller;
mod dataset_writer;
mod discovery;
mod error;
mod measurement;
mod record_buffer;
mod simulator;
mod stop;
mod subscriber;

use bus_client::RelayControlPlane;
use clap::Parser;
use config::CollectorConfig;
use control_plane::ControlPlane;
use controller::CollectionController;
use measurement::{Layer, ReportInterval};
use simulator::SimulatedControlPlane;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Collects RAN layer statistics into a CSV dataset", long_about = None)]
struct Args {
    /// Rows to collect before stopping
    target: Option<u64>,

    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(short, long, value_parser = parse_duration)]
    duration: Option<Duration>,

    #[arg(long)]
    flush_every: Option<u64>,

    #[arg(long)]
    throughput: bool,

    #[arg(long)]
    primary: Option<Layer>,

    #[arg(long)]
    interval: Option<ReportInterval>,

    #[arg(long)]
    relay_host: Option<String>,

    #[arg(long)]
    relay_port: Option<u16>,

    #[arg(long)]
    simulate: bool,

    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn apply_args(config: &mut CollectorConfig, args: &Args) {
    if let Some(target) = args.target {
        config.target_samples = target;
    }
    if let Some(output) = &args.output {
        config.output = output.clone();
    }
    if let Some(duration) = args.duration {
        config.duration = Some(duration);
    }
    if let Some(flush_every) = args.flush_every {
        config.flush_every = flush_every;
    }
    if args.throughput {
        config.enable_throughput();
    }
    if let Some(primary) = args.primary {
        config.primary = primary;
    }
    if let Some(interval) = args.interval {
        config.interval = interval;
    }
    if let Some(host) = &args.relay_host {
        config.relay.host = host.clone();
    }
    if let Some(port) = args.relay_port {
        config.relay.port = port;
    }
    if args.simulate {
        config.simulate = true;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            CollectorConfig::load(path)?
        }
        None => CollectorConfig::default(),
    };
    apply_args(&mut config, &args);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    let control_plane: Arc<dyn ControlPlane> = if config.simulate {
        tracing::info!("Using the simulated RAN");
        Arc::new(SimulatedControlPlane::generating(
            SimulatedControlPlane::default_nodes(),
        ))
    } else {
        let relay = RelayControlPlane::connect(
            &config.relay.host,
            config.relay.port,
            config.relay.connect_attempts,
            config.relay.request_timeout,
        )
        .await?;
        Arc::new(relay)
    };

    let mut controller = CollectionController::new(control_plane, config);
    match controller.run().await {
        Ok(summary) => {
            summary.log();
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, state = ?controller.state(), "Collection failed");
            Err(e.into())
        }
    }
}
