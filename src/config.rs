//! Batch configuration.
//!
//! Every knob lives in one explicit value threaded through constructors. Defaults
//! are only applied here, at the outermost entry point; inner components never
//! reach for globals.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR_NAME: &str = "simbatch";
pub const CONFIG_FILE_NAME: &str = "config.json";
/// Upper bound for every seconds-valued setting (one week).
pub const MAX_CONFIG_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Host/port pair of the simulator's RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub simulator: SimulatorConfig,
    pub interpreter: InterpreterConfig,
    pub session: SessionConfig,
    pub detectors: DetectorConfig,
    pub paths: PathsConfig,
    /// Pause between consecutive scenarios.
    pub inter_scenario_delay_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorConfig {
    pub executable: PathBuf,
    /// Port argument; `{port}` is replaced with the configured port.
    pub port_arg: String,
    /// Extra arguments appended after the port argument.
    pub extra_args: Vec<String>,
    /// Pattern matched against full command lines when killing.
    pub kill_pattern: String,
    pub host: String,
    pub port: u16,
    /// Per-request timeout for the simulator client, including tick acknowledgement.
    pub timeout_secs: f64,
    /// Timeout for the liveness probe.
    pub probe_timeout_secs: f64,
    pub kill_settle_secs: f64,
    pub restart_grace_secs: f64,
    pub start_settle_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterpreterConfig {
    /// Command prefix, split with shell-words (e.g. `python3 scenario_runner.py`).
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub init_wait_secs: f64,
    /// Caps for the captured output surfaced on failure.
    pub snippet_max_lines: usize,
    pub snippet_max_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    /// Host wall-clock time.
    Wall,
    /// Ticks multiplied by the fixed tick duration.
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Bridge process speaking the JSON-lines client protocol.
    pub bridge_command: String,
    pub fps: f64,
    pub ego_role_name: String,
    /// Upper bound on ego polling; one probe per `ego_poll_interval_secs`.
    pub ego_wait_secs: u32,
    pub ego_poll_interval_secs: f64,
    pub target_speed: f64,
    pub clock: ClockSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    pub stuck_distance: f64,
    pub stuck_secs: f64,
    pub fallen_z: f64,
    pub max_duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub catalog: PathBuf,
    pub scenarios_dir: PathBuf,
    pub ledger: PathBuf,
    pub record_dir: Option<PathBuf>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("CarlaUE4.sh"),
            port_arg: "-carla-rpc-port={port}".to_string(),
            extra_args: Vec::new(),
            kill_pattern: "CarlaUE4-Linux-".to_string(),
            host: "localhost".to_string(),
            port: 2000,
            timeout_secs: 20.0,
            probe_timeout_secs: 5.0,
            kill_settle_secs: 3.0,
            restart_grace_secs: 2.0,
            start_settle_secs: 10.0,
        }
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            command: "python3 scenario_runner.py".to_string(),
            working_dir: None,
            init_wait_secs: 7.0,
            snippet_max_lines: 40,
            snippet_max_bytes: 8 * 1024,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bridge_command: "python3 simbatch_bridge.py".to_string(),
            fps: 100.0,
            ego_role_name: "ego_vehicle".to_string(),
            ego_wait_secs: 20,
            ego_poll_interval_secs: 1.0,
            target_speed: 30.0,
            clock: ClockSource::Wall,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            stuck_distance: 0.1,
            stuck_secs: 2.0,
            fallen_z: 0.0,
            max_duration_secs: 180.0,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            catalog: PathBuf::from("all_ego_valid.json"),
            scenarios_dir: PathBuf::from("opscenarios"),
            ledger: PathBuf::from("srunner_outcomes.json"),
            record_dir: None,
        }
    }
}

impl SimulatorConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }
}

impl SessionConfig {
    /// Seconds of simulated time advanced per tick.
    pub fn fixed_delta_seconds(&self) -> f64 {
        1.0 / self.fps
    }
}

/// Convert a seconds value into a `Duration`. Negatives and NaN clamp to zero,
/// values beyond `Duration::MAX` saturate.
pub fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// Location of the per-user config file, when a config dir exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load config from an explicit path, the per-user default, or built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<BatchConfig> {
    if let Some(path) = explicit {
        return read_config(path);
    }
    match default_config_path() {
        Some(path) if path.is_file() => read_config(&path),
        _ => Ok(BatchConfig::default()),
    }
}

fn read_config(path: &Path) -> Result<BatchConfig> {
    let bytes = std::fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: BatchConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Reject values that would make the batch meaningless before any process is touched.
pub fn validate_config(config: &BatchConfig) -> Result<()> {
    if !(config.session.fps.is_finite() && config.session.fps > 0.0) {
        return Err(anyhow!("session.fps must be positive (got {})", config.session.fps));
    }
    if config.simulator.kill_pattern.trim().is_empty() {
        return Err(anyhow!("simulator.kill_pattern must not be empty"));
    }
    if config.interpreter.command.trim().is_empty() {
        return Err(anyhow!("interpreter.command must not be empty"));
    }
    if config.session.bridge_command.trim().is_empty() {
        return Err(anyhow!("session.bridge_command must not be empty"));
    }
    if config.session.ego_role_name.trim().is_empty() {
        return Err(anyhow!("session.ego_role_name must not be empty"));
    }
    let detectors = &config.detectors;
    if !(detectors.stuck_distance.is_finite() && detectors.stuck_distance >= 0.0) {
        return Err(anyhow!(
            "detectors.stuck_distance must be a non-negative number (got {})",
            detectors.stuck_distance
        ));
    }
    let simulator = &config.simulator;
    for (name, value) in [
        ("detectors.stuck_secs", detectors.stuck_secs),
        ("detectors.max_duration_secs", detectors.max_duration_secs),
        ("simulator.probe_timeout_secs", simulator.probe_timeout_secs),
        ("simulator.kill_settle_secs", simulator.kill_settle_secs),
        ("simulator.restart_grace_secs", simulator.restart_grace_secs),
        ("simulator.start_settle_secs", simulator.start_settle_secs),
        ("interpreter.init_wait_secs", config.interpreter.init_wait_secs),
        ("session.ego_poll_interval_secs", config.session.ego_poll_interval_secs),
        ("session tick length (1 / fps)", config.session.fixed_delta_seconds()),
        ("inter_scenario_delay_secs", config.inter_scenario_delay_secs),
    ] {
        if !(value.is_finite() && (0.0..=MAX_CONFIG_SECS).contains(&value)) {
            return Err(anyhow!(
                "{name} must be between 0 and {MAX_CONFIG_SECS} seconds (got {value})"
            ));
        }
    }
    // Every bridge request is bounded by this; zero would fail them all.
    let timeout = simulator.timeout_secs;
    if !(timeout.is_finite() && timeout > 0.0 && timeout <= MAX_CONFIG_SECS) {
        return Err(anyhow!(
            "simulator.timeout_secs must be positive and at most {MAX_CONFIG_SECS} seconds (got {timeout})"
        ));
    }
    if !detectors.fallen_z.is_finite() {
        return Err(anyhow!("detectors.fallen_z must be finite"));
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
