//! Command entry points.
//!
//! Each command resolves the config (file, then flag overrides), validates it,
//! and wires the production components together. Batch-fatal conditions are
//! checked here before any process is touched.
use crate::catalog::load_catalog;
use crate::cli::{CommonArgs, PathArgs, RunArgs, SimulatorArgs, StatusArgs};
use crate::config::{load_config, validate_config, BatchConfig};
use crate::driver::{Driver, ProcessLauncher};
use crate::ledger::OutcomeLedger;
use crate::scheduler::{BatchSummary, Scheduler};
use crate::session::BridgeConnector;
use crate::status::{build_status_summary, print_status};
use crate::supervisor::{KillReport, OsSimulatorProcess, Supervisor};
use anyhow::{anyhow, Context, Result};
use std::path::Path;

pub fn run_batch(args: &RunArgs) -> Result<BatchSummary> {
    let mut config = resolve_config(&args.simulator.common)?;
    apply_simulator_overrides(&mut config, &args.simulator);
    apply_path_overrides(&mut config, &args.paths);
    if let Some(fps) = args.fps {
        config.session.fps = fps;
    }
    validate_config(&config)?;

    let launcher = ProcessLauncher::new(&config.interpreter)
        .context("configure scenario interpreter")?;
    let connector = BridgeConnector::new(&config.session)?;
    preflight(&config, launcher.program(), connector.program())?;
    let catalog = load_catalog(&config.paths.catalog)?;
    let mut ledger = OutcomeLedger::load(&config.paths.ledger);
    tracing::info!(
        catalog = %config.paths.catalog.display(),
        ledger = %config.paths.ledger.display(),
        recorded = ledger.len(),
        "loaded batch inputs"
    );

    let supervisor = Supervisor::new(OsSimulatorProcess::new(&config.simulator), &config.simulator);
    let driver = Driver::new(launcher, &config.interpreter);
    let mut scheduler = Scheduler::new(supervisor, driver, connector, &config);
    let summary = scheduler.run_batch(&catalog, &mut ledger)?;
    print_batch_summary(&summary, ledger.path());
    Ok(summary)
}

pub fn run_status(args: &StatusArgs) -> Result<()> {
    let mut config = resolve_config(&args.common)?;
    apply_path_overrides(&mut config, &args.paths);
    let catalog = load_catalog(&config.paths.catalog)?;
    let ledger = OutcomeLedger::inspect(&config.paths.ledger);
    let summary = build_status_summary(&config.paths.catalog, &catalog, &ledger);
    if args.json {
        let text = serde_json::to_string_pretty(&summary).context("serialize status summary")?;
        println!("{text}");
    } else {
        print_status(&summary);
    }
    Ok(())
}

/// One liveness probe; `Ok(false)` is a normal answer, not an error.
pub fn run_probe(args: &SimulatorArgs) -> Result<bool> {
    let mut supervisor = simulator_supervisor(args)?;
    let alive = supervisor.is_alive();
    println!(
        "{}: {}",
        supervisor.endpoint(),
        if alive { "alive" } else { "not reachable" }
    );
    Ok(alive)
}

pub fn run_kill(args: &SimulatorArgs) -> Result<()> {
    let mut supervisor = simulator_supervisor(args)?;
    match supervisor.kill() {
        KillReport::Signalled => println!("simulator processes signalled"),
        KillReport::NoneMatched => println!("no simulator processes running"),
        KillReport::Unavailable => println!("could not signal simulator processes"),
    }
    Ok(())
}

pub fn run_restart(args: &SimulatorArgs) -> Result<()> {
    let mut config = resolve_config(&args.common)?;
    apply_simulator_overrides(&mut config, args);
    validate_config(&config)?;
    require_simulator_executable(&config)?;
    let mut supervisor =
        Supervisor::new(OsSimulatorProcess::new(&config.simulator), &config.simulator);
    supervisor.restart()?;
    println!("simulator restarted on {}", supervisor.endpoint());
    Ok(())
}

fn simulator_supervisor(args: &SimulatorArgs) -> Result<Supervisor<OsSimulatorProcess>> {
    let mut config = resolve_config(&args.common)?;
    apply_simulator_overrides(&mut config, args);
    validate_config(&config)?;
    Ok(Supervisor::new(
        OsSimulatorProcess::new(&config.simulator),
        &config.simulator,
    ))
}

fn resolve_config(common: &CommonArgs) -> Result<BatchConfig> {
    load_config(common.config.as_deref())
}

fn apply_simulator_overrides(config: &mut BatchConfig, args: &SimulatorArgs) {
    if let Some(host) = &args.host {
        config.simulator.host = host.clone();
    }
    if let Some(port) = args.port {
        config.simulator.port = port;
    }
    if let Some(timeout) = args.timeout {
        config.simulator.timeout_secs = timeout;
    }
    if let Some(executable) = &args.simulator {
        config.simulator.executable = executable.clone();
    }
}

fn apply_path_overrides(config: &mut BatchConfig, args: &PathArgs) {
    if let Some(catalog) = &args.catalog {
        config.paths.catalog = catalog.clone();
    }
    if let Some(dir) = &args.scenarios_folder {
        config.paths.scenarios_dir = dir.clone();
    }
    if let Some(dir) = &args.record_folder {
        config.paths.record_dir = Some(dir.clone());
    }
    if let Some(ledger) = &args.ledger {
        config.paths.ledger = ledger.clone();
    }
}

/// Conditions under which no scenario could succeed abort the batch up front.
fn preflight(config: &BatchConfig, interpreter: &str, bridge: &str) -> Result<()> {
    require_simulator_executable(config)?;
    for (role, program) in [("interpreter", interpreter), ("simulator bridge", bridge)] {
        let resolved = which::which(program)
            .map_err(|err| anyhow!("{role} program {program:?} not found: {err}"))?;
        tracing::debug!(role, path = %resolved.display(), "resolved program");
    }
    Ok(())
}

fn require_simulator_executable(config: &BatchConfig) -> Result<()> {
    let executable = &config.simulator.executable;
    if !executable.is_file() {
        return Err(anyhow!(
            "simulator executable not found at {}",
            executable.display()
        ));
    }
    Ok(())
}

fn print_batch_summary(summary: &BatchSummary, ledger: &Path) {
    println!(
        "batch complete: {} in catalog, {} run, {} already recorded, {} succeeded",
        summary.total,
        summary.attempted,
        summary.skipped,
        summary.succeeded()
    );
    for (status, count) in &summary.statuses {
        println!("  - {status}: {count}");
    }
    println!("ledger: {} ({} entries)", ledger.display(), summary.ledger_size);
}
