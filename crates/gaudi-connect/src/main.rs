//! gaudi-connect entry point.
//!
//! Resolves the scale-up routing table against the local devices, checks
//! link state and optionally runs perf-test over every link.
//! Exit code: 0 when nothing failed, 1 when a connection failed or errored,
//! 2 when the run itself could not be carried out.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gaudi_connect::config::DEFAULT_CONFIG_PATH;
use gaudi_connect::{
    routing, ConnectionFilter, ConnectivityEngine, EndpointSelector, GaudiConnectConfig,
    InventoryProvider, ProbeMode, RoutingPreset, StaticInventory, SysfsInventory,
};

/// Gaudi scale-up connectivity checker
#[derive(Parser, Debug)]
#[command(name = "gaudi-connect")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Routing table file (src_module src_port dst_module dst_port per line)
    #[arg(short = 'c', long, value_name = "FILE")]
    connectivity: Option<PathBuf>,

    /// Shipped routing table for a server type
    #[arg(short = 't', long = "type", value_enum, value_name = "TYPE")]
    topology: Option<RoutingPreset>,

    /// Configuration file
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Read the device inventory from a JSON snapshot instead of the host
    #[arg(long, value_name = "FILE")]
    inventory_file: Option<PathBuf>,

    /// Only connections touching this module id
    #[arg(short = 'm', long)]
    module: Option<u32>,

    /// Only connections touching this port
    #[arg(short = 'p', long)]
    port: Option<u32>,

    /// Apply --module/--port to the source endpoint only
    #[arg(long, conflicts_with = "as_destination")]
    as_source: bool,

    /// Apply --module/--port to the destination endpoint only
    #[arg(long)]
    as_destination: bool,

    /// Run perf-test on every connection
    #[arg(long)]
    perf: bool,

    /// Probe connections concurrently
    #[arg(long)]
    parallel: bool,

    /// Concurrent probes with --parallel
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Per-connection timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Save each probe run's server/client output and a summary here
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Print probe commands instead of running them
    #[arg(long)]
    simulate: bool,

    /// Skip link state verification
    #[arg(long)]
    no_port_check: bool,

    /// Emit the report as JSON
    #[arg(long)]
    json: bool,

    /// Write the report to a file instead of stdout
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Print the device inventory
    #[arg(long)]
    devices: bool,
}

impl Args {
    fn apply_to(&self, config: &mut GaudiConnectConfig) {
        if let Some(path) = &self.connectivity {
            config.routing.file = Some(path.clone());
        }
        if let Some(preset) = self.topology {
            config.routing.preset = Some(preset);
            if self.connectivity.is_none() {
                config.routing.file = None;
            }
        }
        if let Some(workers) = self.workers {
            config.probe.max_workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.probe.timeout_secs = timeout;
        }
        if let Some(dir) = &self.log_dir {
            config.probe.log_dir = Some(dir.clone());
        }
        config.probe.parallel |= self.parallel;
        config.probe.simulate |= self.simulate;
        if self.no_port_check {
            config.verification.check_ports = false;
        }
    }

    fn filter(&self) -> ConnectionFilter {
        let selector = if self.as_source {
            EndpointSelector::SOURCE
        } else if self.as_destination {
            EndpointSelector::DESTINATION
        } else {
            EndpointSelector::BOTH
        };
        ConnectionFilter {
            module_id: self.module,
            port: self.port,
            selector,
        }
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{}'", level))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")?;
    Ok(())
}

/// Returns whether every connection passed.
async fn run(args: Args) -> anyhow::Result<bool> {
    let mut config = GaudiConnectConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    args.apply_to(&mut config);

    let provider: Arc<dyn InventoryProvider> = match &args.inventory_file {
        Some(path) => Arc::new(StaticInventory::load(path).context("Failed to load inventory snapshot")?),
        None => Arc::new(SysfsInventory::new(&config.inventory)),
    };

    let routing_path = config.routing_path();
    let engine = ConnectivityEngine::new(config, provider).context("Invalid configuration")?;
    let inventory = engine
        .collect_inventory()
        .await
        .context("Failed to collect device inventory")?;

    if args.devices {
        print!("{}", inventory.render_summary());
    }

    let Some(routing_path) = routing_path else {
        if args.devices {
            return Ok(true);
        }
        bail!("No routing table given; use --connectivity or --type");
    };
    let table = routing::load(&routing_path)
        .with_context(|| format!("Failed to load routing table {}", routing_path.display()))?;

    let mode = if args.perf {
        ProbeMode::Performance
    } else {
        ProbeMode::VerifyOnly
    };
    let report = engine
        .run_with_inventory(table, &inventory, mode, &args.filter())
        .await;

    match &args.output {
        Some(path) => report
            .write_to(path, args.json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?,
        None if args.json => println!("{}", report.to_json()?),
        None => print!("{}", report.render_text()),
    }

    Ok(report.summary.is_clean())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("gaudi-connect: {:#}", e);
        return ExitCode::from(2);
    }

    info!("Starting gaudi-connect");
    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!(error = %format!("{:#}", e), "gaudi-connect failed");
            eprintln!("gaudi-connect: {:#}", e);
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "gaudi-connect",
            "--type",
            "HLS3",
            "--parallel",
            "-w",
            "2",
            "--timeout",
            "9",
            "--no-port-check",
            "--log-dir",
            "/tmp/gaudi-logs",
        ]);
        let mut config = GaudiConnectConfig::default();
        config.routing.file = Some(PathBuf::from("/etc/table.csv"));
        args.apply_to(&mut config);

        assert_eq!(config.routing.preset, Some(RoutingPreset::Hls3));
        assert_eq!(config.routing.file, None);
        assert!(config.probe.parallel);
        assert_eq!(config.probe.max_workers, 2);
        assert_eq!(config.probe.timeout_secs, 9);
        assert!(!config.verification.check_ports);
        assert_eq!(config.probe.log_dir, Some(PathBuf::from("/tmp/gaudi-logs")));
    }

    #[test]
    fn test_filter_selector() {
        let args = Args::parse_from(["gaudi-connect", "-m", "3", "--as-destination"]);
        let filter = args.filter();
        assert_eq!(filter.module_id, Some(3));
        assert_eq!(filter.selector, EndpointSelector::DESTINATION);
    }
}
