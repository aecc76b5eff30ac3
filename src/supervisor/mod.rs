//! External simulator lifecycle supervision.
//!
//! The OS-level operations sit behind [`SimulatorProcess`] so the restart
//! sequencing (kill, settle, grace, start, settle, probe) can be exercised
//! without spawning a simulator.
mod os;

pub use os::OsSimulatorProcess;

use crate::config::{secs, Endpoint, SimulatorConfig};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What a best-effort kill observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReport {
    /// At least one matching process was signalled.
    Signalled,
    /// Nothing matched; the simulator was already gone.
    NoneMatched,
    /// The kill mechanism itself was unavailable or failed.
    Unavailable,
}

/// Capability over "the external simulator process".
pub trait SimulatorProcess {
    /// Lightweight handshake; unreachable or slow endpoints report `false`.
    fn is_alive(&mut self, endpoint: &Endpoint, timeout: Duration) -> bool;

    /// Signal every matching simulator process. Never fails.
    fn kill(&mut self) -> KillReport;

    /// Launch the simulator detached from the orchestrator's session.
    fn start(&mut self, executable: &Path, port: u16) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimings {
    pub kill_settle: Duration,
    pub restart_grace: Duration,
    pub start_settle: Duration,
    pub probe_timeout: Duration,
}

impl SupervisorTimings {
    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self {
            kill_settle: secs(config.kill_settle_secs),
            restart_grace: secs(config.restart_grace_secs),
            start_settle: secs(config.start_settle_secs),
            probe_timeout: secs(config.probe_timeout_secs),
        }
    }
}

pub struct Supervisor<P> {
    process: P,
    executable: PathBuf,
    endpoint: Endpoint,
    timings: SupervisorTimings,
}

impl<P: SimulatorProcess> Supervisor<P> {
    pub fn new(process: P, config: &SimulatorConfig) -> Self {
        Self {
            process,
            executable: config.executable.clone(),
            endpoint: config.endpoint(),
            timings: SupervisorTimings::from_config(config),
        }
    }

    #[cfg(test)]
    pub fn with_timings(mut self, timings: SupervisorTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[cfg(test)]
    pub fn process(&self) -> &P {
        &self.process
    }

    pub fn is_alive(&mut self) -> bool {
        self.process
            .is_alive(&self.endpoint, self.timings.probe_timeout)
    }

    /// Kill matching processes and wait the fixed settle window.
    pub fn kill(&mut self) -> KillReport {
        let report = self.process.kill();
        match report {
            KillReport::Signalled => tracing::info!("sent kill signal to simulator processes"),
            KillReport::NoneMatched => tracing::info!("no simulator processes running"),
            KillReport::Unavailable => {
                tracing::warn!("could not signal simulator processes; continuing")
            }
        }
        std::thread::sleep(self.timings.kill_settle);
        report
    }

    /// Launch the simulator and wait the fixed settle window for it to listen.
    pub fn start(&mut self) -> Result<()> {
        tracing::info!(
            executable = %self.executable.display(),
            port = self.endpoint.port,
            "starting simulator"
        );
        self.process
            .start(&self.executable, self.endpoint.port)
            .with_context(|| format!("start simulator {}", self.executable.display()))?;
        tracing::debug!(
            settle_ms = self.timings.start_settle.as_millis() as u64,
            "waiting for simulator to initialize"
        );
        std::thread::sleep(self.timings.start_settle);
        Ok(())
    }

    /// Kill, grace delay, start. A failed start is returned to the caller; an
    /// unreachable simulator after start is only logged, since the session's own
    /// connect timeout decides the scenario's fate.
    pub fn restart(&mut self) -> Result<()> {
        self.kill();
        std::thread::sleep(self.timings.restart_grace);
        self.start()?;
        if self.is_alive() {
            tracing::info!(endpoint = %self.endpoint, "simulator reachable after restart");
        } else {
            tracing::warn!(
                endpoint = %self.endpoint,
                "simulator not reachable after restart; continuing"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use anyhow::anyhow;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ProcessCall {
        Probe,
        Kill,
        Start(PathBuf, u16),
    }

    /// Records calls; `start` fails for the first `failing_starts` attempts.
    #[derive(Debug, Default)]
    pub struct FakeProcess {
        pub calls: Vec<ProcessCall>,
        pub alive: bool,
        pub failing_starts: usize,
    }

    impl FakeProcess {
        pub fn kills(&self) -> usize {
            self.calls
                .iter()
                .filter(|call| **call == ProcessCall::Kill)
                .count()
        }

        pub fn starts(&self) -> usize {
            self.calls
                .iter()
                .filter(|call| matches!(call, ProcessCall::Start(..)))
                .count()
        }
    }

    impl SimulatorProcess for FakeProcess {
        fn is_alive(&mut self, _endpoint: &Endpoint, _timeout: Duration) -> bool {
            self.calls.push(ProcessCall::Probe);
            self.alive
        }

        fn kill(&mut self) -> KillReport {
            self.calls.push(ProcessCall::Kill);
            if std::mem::take(&mut self.alive) {
                KillReport::Signalled
            } else {
                KillReport::NoneMatched
            }
        }

        fn start(&mut self, executable: &Path, port: u16) -> Result<()> {
            self.calls
                .push(ProcessCall::Start(executable.to_path_buf(), port));
            if self.failing_starts > 0 {
                self.failing_starts -= 1;
                return Err(anyhow!("exec failed"));
            }
            self.alive = true;
            Ok(())
        }
    }

    pub fn zero_timings() -> SupervisorTimings {
        SupervisorTimings {
            kill_settle: Duration::ZERO,
            restart_grace: Duration::ZERO,
            start_settle: Duration::ZERO,
            probe_timeout: Duration::ZERO,
        }
    }
}
