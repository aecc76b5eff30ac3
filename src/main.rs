//! `simbatch`: resumable batch execution of driving-simulator scenarios.
//!
//! Every pending scenario in the catalog gets a freshly restarted simulator,
//! a scenario interpreter process and an ego-driving control loop; its
//! terminal status is persisted before the next one starts, so an interrupted
//! batch resumes where it stopped.
use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod catalog;
mod cli;
mod config;
mod driver;
mod ledger;
mod outcome;
mod scheduler;
mod session;
mod status;
mod supervisor;
mod util;
mod workflow;

use cli::{Command, RootArgs};

fn main() -> Result<ExitCode> {
    let args = RootArgs::parse();
    init_tracing(args.command.verbose());

    match &args.command {
        Command::Run(run) => workflow::run_batch(run).map(|_| ExitCode::SUCCESS),
        Command::Status(status) => workflow::run_status(status).map(|()| ExitCode::SUCCESS),
        Command::Probe(simulator) => workflow::run_probe(simulator).map(|alive| {
            if alive {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }),
        Command::Kill(simulator) => workflow::run_kill(simulator).map(|()| ExitCode::SUCCESS),
        Command::Restart(simulator) => {
            workflow::run_restart(simulator).map(|()| ExitCode::SUCCESS)
        }
    }
}

/// Logs go to stderr so `status --json` stays machine-readable.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
