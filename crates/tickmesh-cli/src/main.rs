//! tickmesh CLI.
//!
//! Simulates a small distributed system of Lamport-clock machines talking
//! over TCP, then analyzes and verifies the logs they leave behind.
//!
//! # Quick Start
//!
//! ```bash
//! # Run three machines for 30 seconds
//! tickmesh run --duration 30
//!
//! # Summarize and check the logs
//! tickmesh analyze logs
//! tickmesh verify logs
//! ```

mod commands;
mod logging;
mod signal;
mod style;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tickmesh_config::{ConfigLoader, LogFormat, TickmeshConfig};

/// tickmesh - Lamport logical clocks over a mesh of simulated machines.
#[derive(Parser)]
#[command(name = "tickmesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory containing tickmesh.toml.
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    /// Log level (RUST_LOG takes precedence).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Console log format.
    #[arg(long, global = true, value_enum)]
    log_format: Option<FormatArg>,

    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<FormatArg> for LogFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Pretty => LogFormat::Pretty,
            FormatArg::Compact => LogFormat::Compact,
            FormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Run a cluster of machines.
    Run(RunArgs),

    /// Run a single machine (used by `run --processes`).
    Machine(MachineArgs),

    /// Print statistics for a log directory.
    Analyze {
        /// Directory containing machine_<id>.log files.
        log_dir: PathBuf,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check a log directory against the clock and connection invariants.
    Verify {
        /// Directory containing machine_<id>.log files.
        log_dir: PathBuf,
    },

    /// Run several timed clusters and save a report for each.
    Experiment(ExperimentArgs),

    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Args)]
pub struct RunArgs {
    /// Number of machines.
    #[arg(short, long)]
    pub machines: Option<u16>,

    /// First listening port.
    #[arg(short = 'p', long)]
    pub base_port: Option<u16>,

    /// Seconds to run (default: until Ctrl+C).
    #[arg(short, long)]
    pub duration: Option<u64>,

    /// Fixed clock rates, one per machine.
    #[arg(long, value_delimiter = ',')]
    pub clock_rates: Vec<u32>,

    /// Base RNG seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Directory for machine logs.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Run each machine as a separate process.
    #[arg(long)]
    pub processes: bool,

    /// Skip startup delays and use short retry timings.
    #[arg(long)]
    pub fast: bool,
}

#[derive(Args)]
pub struct MachineArgs {
    /// Port to listen on.
    #[arg(long)]
    pub port: u16,

    /// Ports of every other machine.
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<u16>,

    /// Host to bind and dial.
    #[arg(long)]
    pub host: Option<String>,

    /// Clock rate (default: random within configured bounds).
    #[arg(long)]
    pub clock_rate: Option<u32>,

    /// RNG seed for this machine.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Directory for the machine log.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct ExperimentArgs {
    /// Number of experiments.
    #[arg(short, long, default_value = "5")]
    pub count: u32,

    /// Seconds per experiment.
    #[arg(short, long, default_value = "60")]
    pub duration: u64,

    /// Directory for logs and results.
    #[arg(short, long, default_value = "results")]
    pub output: PathBuf,

    /// Number of machines.
    #[arg(short, long)]
    pub machines: Option<u16>,

    /// First listening port.
    #[arg(short = 'p', long)]
    pub base_port: Option<u16>,

    /// Skip startup delays and use short retry timings.
    #[arg(long)]
    pub fast: bool,
}

fn load_config(cli: &Cli) -> Result<TickmeshConfig> {
    let mut config = ConfigLoader::new()
        .with_project_dir(&cli.project)
        .load()
        .with_context(|| format!("Failed to load configuration from {}", cli.project.display()))?;

    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    style::set_no_color(cli.no_color);

    if let Commands::Version = cli.command {
        commands::version::run();
        return Ok(());
    }

    let config = load_config(&cli)?;
    logging::init(&config.logging);

    match cli.command {
        Commands::Version => Ok(()),
        Commands::Run(args) => commands::run::run(config, &args, &cli.project),
        Commands::Machine(args) => commands::machine::run(config, &args),
        Commands::Analyze { log_dir, json } => commands::analyze::run(&log_dir, json),
        Commands::Verify { log_dir } => commands::verify::run(&log_dir),
        Commands::Experiment(args) => commands::experiment::run(config, &args),
        Commands::Config => commands::config::show(&config),
    }
}
