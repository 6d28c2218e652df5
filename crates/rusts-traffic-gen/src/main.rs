//! CLI entry point for the sensor traffic generator.
//!
//! Configuration is read from traffic.yml in the current directory, or from
//! the path given with --config. Command line flags override file values.

use anyhow::Result;
use clap::Parser;
use rusts_traffic_gen::{
    audit::{AuditSink, FileAuditSink, TracingAuditSink},
    backend::{HttpBackend, MemoryBackend},
    config::{BackendKind, RunConfig},
    error::TrafficError,
    report::RunReport,
    workload::run_workload,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "traffic.yml";

#[derive(Parser)]
#[command(name = "rusts-traffic-gen")]
#[command(about = "Sensor telemetry traffic and fault-injection generator")]
#[command(version)]
struct Cli {
    /// Configuration file (default: traffic.yml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the default configuration to traffic.yml and exit
    #[arg(long)]
    generate_config: bool,

    /// Storage hosts (repeatable)
    #[arg(long, num_args = 1..)]
    hosts: Option<Vec<String>>,

    /// Keyspace name
    #[arg(long)]
    keyspace: Option<String>,

    /// Table name
    #[arg(long)]
    table: Option<String>,

    /// Number of concurrent sensor workers
    #[arg(short, long, visible_alias = "threads")]
    workers: Option<usize>,

    /// Base operations per second per worker
    #[arg(long)]
    base_ops: Option<u32>,

    /// Probability of corrupting a sample
    #[arg(long)]
    fault_probability: Option<f64>,

    /// Number of sensor identities targeted by reads
    #[arg(long)]
    num_sensors: Option<usize>,

    /// Relative jitter applied to the tick interval
    #[arg(long)]
    jitter: Option<f64>,

    /// Run duration in minutes (runs until interrupted when omitted)
    #[arg(short = 'D', long)]
    duration: Option<u64>,

    /// Read back recent rows of a random sensor every tick
    #[arg(long)]
    enable_read_storm: bool,

    /// Drive a single worker on one partition
    #[arg(long)]
    hotspot: bool,

    /// Open a new connection every tick
    #[arg(long)]
    connection_storm: bool,

    /// Burn CPU every tick
    #[arg(long)]
    cpu_spike: bool,

    /// Never close storm connections
    #[arg(long)]
    leak_mode: bool,

    /// Backend implementation: http or memory
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,

    /// Save the run report as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut RunConfig) {
        if let Some(hosts) = self.hosts {
            config.hosts = hosts;
        }
        if let Some(keyspace) = self.keyspace {
            config.keyspace = keyspace;
        }
        if let Some(table) = self.table {
            config.table = table;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(base_ops) = self.base_ops {
            config.base_ops = base_ops;
        }
        if let Some(p) = self.fault_probability {
            config.fault_probability = p;
        }
        if let Some(n) = self.num_sensors {
            config.num_sensors = n;
        }
        if let Some(jitter) = self.jitter {
            config.jitter = jitter;
        }
        if self.duration.is_some() {
            config.duration_minutes = self.duration;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if self.seed.is_some() {
            config.tuning.seed = self.seed;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        // Flags only switch modes on; a config file can enable them too
        config.modes.read_storm |= self.enable_read_storm;
        config.modes.hotspot |= self.hotspot;
        config.modes.connection_storm |= self.connection_storm;
        config.modes.cpu_spike |= self.cpu_spike;
        config.modes.leak_mode |= self.leak_mode;
    }
}

fn init_logging(config: &RunConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level().to_string()));

    let file_layer = config.logging.log_file.as_ref().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            ),
            Err(e) => {
                eprintln!("Warning: Failed to open log file {}: {}", path, e);
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
}

fn open_audit_sink(config: &RunConfig) -> Arc<dyn AuditSink> {
    let path = &config.logging.fault_log_file;
    match FileAuditSink::open(path, config.logging.audit_format) {
        Ok(sink) => {
            info!("Fault audit log: {}", path);
            Arc::new(sink)
        }
        Err(e) => {
            warn!(
                "Failed to open fault audit log {}: {}; auditing to the operational log",
                path, e
            );
            Arc::new(TracingAuditSink)
        }
    }
}

/// Cancels `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("SIGINT received, stopping workers..."),
            _ = terminate => info!("SIGTERM received, stopping workers..."),
        }

        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.generate_config {
        RunConfig::write_default(DEFAULT_CONFIG_PATH)?;
        println!("Generated default configuration: {}", DEFAULT_CONFIG_PATH);
        return Ok(());
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = if config_path.exists() {
        let config = RunConfig::from_file(&config_path)?;
        println!("Loaded configuration from: {}", config_path.display());
        config
    } else if cli.config.is_some() {
        anyhow::bail!("Configuration file not found: {}", config_path.display());
    } else {
        RunConfig::default()
    };

    let report_path = cli.report.clone();
    cli.apply(&mut config);
    config.validate()?;

    init_logging(&config);
    info!("Starting rusts-traffic-gen v{}", env!("CARGO_PKG_VERSION"));

    let audit = open_audit_sink(&config);
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let config = Arc::new(config);
    let result = match config.backend {
        BackendKind::Http => {
            let backend = Arc::new(HttpBackend::from_config(&config));
            run_workload(Arc::clone(&config), backend, audit, cancel).await
        }
        BackendKind::Memory => {
            let backend = Arc::new(MemoryBackend::from_config(&config));
            run_workload(Arc::clone(&config), backend, audit, cancel).await
        }
    };

    let report = match result {
        Ok(report) => report,
        Err(TrafficError::InitialConnection(e)) => {
            error!("Could not connect to {:?}: {}", config.hosts, e);
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    report.print_summary();
    if let Some(path) = report_path {
        save_report(&report, &path)?;
    }

    Ok(())
}

fn save_report(report: &RunReport, path: &Path) -> Result<()> {
    std::fs::write(path, report.to_json())?;
    info!("JSON report saved to: {}", path.display());
    Ok(())
}
