//! Batch scheduler: walks the catalog in order and records exactly one outcome
//! per pending scenario.
//!
//! Per scenario: validate inputs, restart the simulator, launch the
//! interpreter, run the control loop, terminate the interpreter, record. Every
//! per-scenario failure becomes a status; only a ledger write failure stops the
//! batch, because progress that cannot be persisted would be re-run anyway.
use crate::catalog::{Catalog, Pose, ScenarioTask};
use crate::config::{secs, BatchConfig};
use crate::driver::{Driver, DriverError, InterpreterHandle, InterpreterLauncher};
use crate::ledger::OutcomeLedger;
use crate::outcome::OutcomeStatus;
use crate::session::{ControlLoop, SimulatorConnector, TerminalState};
use crate::supervisor::{SimulatorProcess, Supervisor};
use crate::util::sanitized_stem;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Counts for the end-of-batch report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub attempted: usize,
    pub skipped: usize,
    pub statuses: BTreeMap<OutcomeStatus, usize>,
    pub ledger_size: usize,
}

impl BatchSummary {
    fn count(&mut self, status: OutcomeStatus) {
        self.attempted += 1;
        *self.statuses.entry(status).or_default() += 1;
    }

    pub fn succeeded(&self) -> usize {
        self.statuses
            .get(&OutcomeStatus::Success)
            .copied()
            .unwrap_or_default()
    }
}

pub fn status_for(terminal: TerminalState) -> OutcomeStatus {
    match terminal {
        TerminalState::Reached => OutcomeStatus::Success,
        TerminalState::TimedOut => OutcomeStatus::Timeout,
        TerminalState::Stuck => OutcomeStatus::Stuck,
        TerminalState::Fallen => OutcomeStatus::Fallen,
    }
}

pub struct Scheduler<P, L, C> {
    supervisor: Supervisor<P>,
    driver: Driver<L>,
    connector: C,
    control: ControlLoop,
    scenarios_dir: PathBuf,
    record_dir: Option<PathBuf>,
    inter_scenario_delay: Duration,
}

impl<P, L, C> Scheduler<P, L, C>
where
    P: SimulatorProcess,
    L: InterpreterLauncher,
    C: SimulatorConnector,
{
    pub fn new(
        supervisor: Supervisor<P>,
        driver: Driver<L>,
        connector: C,
        config: &BatchConfig,
    ) -> Self {
        Self {
            supervisor,
            driver,
            connector,
            control: ControlLoop::from_config(config),
            scenarios_dir: config.paths.scenarios_dir.clone(),
            record_dir: config.paths.record_dir.clone(),
            inter_scenario_delay: secs(config.inter_scenario_delay_secs),
        }
    }

    #[cfg(test)]
    pub fn supervisor(&self) -> &Supervisor<P> {
        &self.supervisor
    }

    /// Run every catalog entry the ledger does not already hold, then kill the
    /// simulator. The final kill happens even when the batch stops early.
    pub fn run_batch(
        &mut self,
        catalog: &Catalog,
        ledger: &mut OutcomeLedger,
    ) -> Result<BatchSummary> {
        if let Some(dir) = &self.record_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create record folder {}", dir.display()))?;
        }
        let mut summary = BatchSummary {
            total: catalog.len(),
            ..BatchSummary::default()
        };
        let pending = catalog
            .tasks()
            .iter()
            .filter(|task| !ledger.contains(&task.id))
            .count();
        if catalog.is_empty() {
            tracing::warn!("catalog is empty; nothing to run");
        } else if ledger.is_empty() {
            tracing::info!(total = catalog.len(), "no prior progress; starting fresh");
        }
        tracing::info!(
            total = catalog.len(),
            pending,
            recorded = ledger.len(),
            "batch starting"
        );

        let result = self.run_pending(catalog, ledger, &mut summary);

        tracing::info!("batch finished; stopping simulator");
        self.supervisor.kill();
        summary.ledger_size = ledger.len();
        result.map(|()| summary)
    }

    fn run_pending(
        &mut self,
        catalog: &Catalog,
        ledger: &mut OutcomeLedger,
        summary: &mut BatchSummary,
    ) -> Result<()> {
        let mut simulator_used = false;
        for task in catalog.tasks() {
            if ledger.contains(&task.id) {
                tracing::info!(scenario = %task.id, "already recorded; skipping");
                summary.skipped += 1;
                continue;
            }
            if simulator_used && !self.inter_scenario_delay.is_zero() {
                std::thread::sleep(self.inter_scenario_delay);
            }
            let started = Instant::now();
            let status = self.run_scenario(task);
            simulator_used = !status.is_input_defect();
            ledger.record(&task.id, status)?;
            summary.count(status);
            tracing::info!(
                scenario = %task.id,
                %status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "scenario finished"
            );
        }
        Ok(())
    }

    fn run_scenario(&mut self, task: &ScenarioTask) -> OutcomeStatus {
        tracing::info!(scenario = %task.id, "preparing scenario");
        let scenario_file = self.scenarios_dir.join(&task.id);
        if !scenario_file.is_file() {
            tracing::warn!(
                scenario = %task.id,
                path = %scenario_file.display(),
                "scenario file not found"
            );
            return OutcomeStatus::FileNotFound;
        }
        let Some(destination) = task.destination else {
            tracing::warn!(scenario = %task.id, "catalog entry has no destination");
            return OutcomeStatus::MissingDestination;
        };

        if let Err(err) = self.supervisor.restart() {
            tracing::warn!(scenario = %task.id, stage = "restart", error = %format!("{err:#}"), "simulator start failed");
            return OutcomeStatus::ServerStartFailed;
        }

        let mut handle = match self
            .driver
            .launch(&scenario_file, self.supervisor.endpoint())
        {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(scenario = %task.id, stage = "launch", error = %err, "interpreter launch failed");
                return OutcomeStatus::ScriptError;
            }
        };

        let status = match self.driver.await_initialization(&mut handle) {
            Ok(()) => self.drive(task, &destination, &mut handle),
            Err(err) => {
                tracing::warn!(scenario = %task.id, stage = "interpreter_init", error = %err, "interpreter failed to start");
                if let DriverError::EarlyExit { output, .. } = &err {
                    self.driver.surface_output(&task.id, output);
                }
                OutcomeStatus::ScriptError
            }
        };

        if let Err(err) = self.driver.terminate(&mut handle) {
            tracing::warn!(scenario = %task.id, error = %err, "interpreter termination failed");
        }
        status
    }

    fn drive(
        &mut self,
        task: &ScenarioTask,
        destination: &Pose,
        handle: &mut L::Handle,
    ) -> OutcomeStatus {
        let recording = self.recording_path(&task.id);
        let control = &self.control;
        let connector = &mut self.connector;
        let result = catch_unwind(AssertUnwindSafe(|| {
            control.run(connector, destination, recording.as_deref())
        }));

        match result {
            Ok(Ok(report)) => {
                tracing::info!(
                    scenario = %task.id,
                    terminal = %report.terminal,
                    ticks = report.ticks,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    last_location = ?report.last_location,
                    "control loop finished"
                );
                if !report.cleanup_ok {
                    tracing::warn!(scenario = %task.id, "session cleanup incomplete; simulator is restarted before the next scenario");
                }
                status_for(report.terminal)
            }
            Ok(Err(err)) => {
                tracing::warn!(scenario = %task.id, stage = "control_loop", error = %err, "control loop failed");
                self.surface_if_exited(&task.id, handle);
                OutcomeStatus::ProcessingError
            }
            Err(panic) => {
                tracing::error!(
                    scenario = %task.id,
                    stage = "control_loop",
                    panic = %panic_message(panic.as_ref()),
                    "control loop panicked"
                );
                self.surface_if_exited(&task.id, handle);
                OutcomeStatus::ProcessingError
            }
        }
    }

    /// An interpreter that died mid-run usually explains the failure.
    fn surface_if_exited(&self, scenario_id: &str, handle: &mut L::Handle) {
        if let Ok(Some(status)) = handle.exit_status() {
            tracing::warn!(scenario = %scenario_id, %status, "interpreter exited during the run");
            let output = handle.captured_output();
            self.driver.surface_output(scenario_id, &output);
        }
    }

    fn recording_path(&self, scenario_id: &str) -> Option<PathBuf> {
        self.record_dir
            .as_deref()
            .map(|dir| recording_file(dir, scenario_id))
    }
}

pub fn recording_file(record_dir: &Path, scenario_id: &str) -> PathBuf {
    record_dir.join(format!("{}.log", sanitized_stem(scenario_id)))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
