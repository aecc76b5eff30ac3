//! CLI argument parsing for the batch runner.
//!
//! Flags only override values from the config file; every default lives in
//! `config`.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "simbatch",
    version,
    about = "Resumable batch runner for driving-simulator scenarios",
    after_help = "Commands:\n  run      Run every scenario the outcome ledger does not hold yet\n  status   Summarize the ledger against the catalog\n  probe    Check whether the simulator endpoint answers\n  kill     Stop running simulator processes\n  restart  Kill and relaunch the simulator\n\nExamples:\n  simbatch run --catalog all_ego_valid.json --scenarios-folder opscenarios --record-folder records\n  simbatch status --json\n  simbatch probe --port 2000",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Status(StatusArgs),
    Probe(SimulatorArgs),
    Kill(SimulatorArgs),
    Restart(SimulatorArgs),
}

impl Command {
    pub fn verbose(&self) -> bool {
        match self {
            Command::Run(args) => args.simulator.common.verbose,
            Command::Status(args) => args.common.verbose,
            Command::Probe(args) | Command::Kill(args) | Command::Restart(args) => {
                args.common.verbose
            }
        }
    }
}

/// Flags shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Config file (default: <config dir>/simbatch/config.json when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(long)]
    pub verbose: bool,
}

/// Simulator endpoint and process overrides.
#[derive(Args, Debug, Clone, Default)]
pub struct SimulatorArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Simulator host
    #[arg(long)]
    pub host: Option<String>,

    /// Simulator RPC port
    #[arg(long)]
    pub port: Option<u16>,

    /// Simulator client request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Simulator launcher executable
    #[arg(long, value_name = "PATH")]
    pub simulator: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Run every pending scenario in catalog order")]
pub struct RunArgs {
    #[command(flatten)]
    pub simulator: SimulatorArgs,

    #[command(flatten)]
    pub paths: PathArgs,

    /// Fixed simulation rate in frames per second
    #[arg(long)]
    pub fps: Option<f64>,
}

/// Input/output location overrides.
#[derive(Args, Debug, Clone, Default)]
pub struct PathArgs {
    /// Scenario catalog JSON
    #[arg(long, value_name = "PATH")]
    pub catalog: Option<PathBuf>,

    /// Folder holding the scenario files named by the catalog
    #[arg(long, value_name = "DIR")]
    pub scenarios_folder: Option<PathBuf>,

    /// Folder for per-scenario simulator recordings
    #[arg(long, value_name = "DIR")]
    pub record_folder: Option<PathBuf>,

    /// Outcome ledger JSON
    #[arg(long, value_name = "PATH")]
    pub ledger: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[command(about = "Summarize recorded outcomes against the catalog")]
pub struct StatusArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub paths: PathArgs,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}
