//! In-session control loop.
//!
//! One invocation owns one simulator connection for one scenario:
//! `CONNECTING → AWAITING_EGO → DRIVING → {REACHED, STUCK, FALLEN, TIMED_OUT}`,
//! with `CLEANUP` (recording stopped, original settings restored, connection
//! released) on every exit path. The simulator client, the navigation agent and
//! the clock are seams so the loop runs unchanged against fakes.
mod bridge;
mod clock;
mod detect;
mod pose;

pub use bridge::BridgeConnector;
pub use clock::SessionClock;
pub use detect::{is_fallen, StuckState};
pub use pose::{destination_transform, snap_to_road};

use crate::catalog::Pose;
use crate::config::{secs, BatchConfig, ClockSource, DetectorConfig, Endpoint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Location {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Location) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Degrees, simulator convention.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotation {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    pub location: Location,
    pub rotation: Rotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldSettings {
    pub synchronous_mode: bool,
    pub fixed_delta_seconds: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleControl {
    pub throttle: f64,
    pub steer: f64,
    pub brake: f64,
    #[serde(default)]
    pub hand_brake: bool,
    #[serde(default)]
    pub reverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub u64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters handed to the navigation agent on creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentOptions {
    pub target_speed: f64,
    pub sync_mode: bool,
    pub fixed_delta_seconds: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connect to simulator at {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("ego actor with role {role_name:?} not found after {attempts} probes")]
    EgoNotFound { role_name: String, attempts: u32 },
    #[error("simulator request {op} timed out after {timeout_ms} ms")]
    Timeout { op: String, timeout_ms: u64 },
    #[error("simulator request {op} failed: {message}")]
    Request { op: String, message: String },
    #[error("simulator bridge: {0}")]
    Bridge(String),
}

/// Opens sessions against the simulator endpoint.
pub trait SimulatorConnector {
    type Session: SimulatorSession;

    fn connect(
        &mut self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Self::Session, SessionError>;
}

/// One live connection to the simulator world.
pub trait SimulatorSession {
    type Agent: NavigationAgent;

    fn world_settings(&mut self) -> Result<WorldSettings, SessionError>;
    fn apply_settings(&mut self, settings: &WorldSettings) -> Result<(), SessionError>;
    fn find_actor_by_role(&mut self, role_name: &str) -> Result<Option<ActorId>, SessionError>;
    fn actor_location(&mut self, actor: ActorId) -> Result<Location, SessionError>;
    /// Nearest driving-lane waypoint, if the map has one.
    fn road_waypoint(&mut self, location: Location) -> Result<Option<Transform>, SessionError>;
    /// Advance one fixed tick; blocks until the simulator acknowledges it.
    fn tick(&mut self) -> Result<u64, SessionError>;
    fn apply_control(
        &mut self,
        actor: ActorId,
        control: &VehicleControl,
    ) -> Result<(), SessionError>;
    fn start_recorder(&mut self, path: &Path) -> Result<(), SessionError>;
    fn stop_recorder(&mut self) -> Result<(), SessionError>;
    fn create_agent(
        &mut self,
        ego: ActorId,
        options: &AgentOptions,
    ) -> Result<Self::Agent, SessionError>;
    /// Release the connection. Must be safe to call more than once.
    fn disconnect(&mut self);
}

/// Autonomous navigation toward a destination point.
pub trait NavigationAgent {
    fn set_destination(&mut self, destination: Location) -> Result<(), SessionError>;
    fn done(&mut self) -> Result<bool, SessionError>;
    fn run_step(&mut self) -> Result<VehicleControl, SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    AwaitingEgo,
    Driving,
    Cleanup,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionPhase::Connecting => "connecting",
            SessionPhase::AwaitingEgo => "awaiting_ego",
            SessionPhase::Driving => "driving",
            SessionPhase::Cleanup => "cleanup",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Reached,
    Stuck,
    Fallen,
    TimedOut,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminalState::Reached => "reached",
            TerminalState::Stuck => "stuck",
            TerminalState::Fallen => "fallen",
            TerminalState::TimedOut => "timed_out",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub terminal: TerminalState,
    pub ticks: u32,
    pub elapsed: Duration,
    pub last_location: Option<Location>,
    /// False when cleanup hit an error; the terminal state still stands.
    pub cleanup_ok: bool,
}

/// Immutable per-batch parameters of the control loop.
#[derive(Debug, Clone)]
pub struct ControlLoop {
    pub endpoint: Endpoint,
    pub timeout: Duration,
    pub fixed_delta_seconds: f64,
    pub ego_role_name: String,
    pub ego_wait_secs: u32,
    pub ego_poll_interval: Duration,
    pub target_speed: f64,
    pub clock: ClockSource,
    pub detectors: DetectorConfig,
}

impl ControlLoop {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            endpoint: config.simulator.endpoint(),
            timeout: config.simulator.timeout(),
            fixed_delta_seconds: config.session.fixed_delta_seconds(),
            ego_role_name: config.session.ego_role_name.clone(),
            ego_wait_secs: config.session.ego_wait_secs,
            ego_poll_interval: secs(config.session.ego_poll_interval_secs),
            target_speed: config.session.target_speed,
            clock: config.session.clock,
            detectors: config.detectors.clone(),
        }
    }

    /// Drive one scenario to a terminal state. Errors are returned only after
    /// cleanup has run.
    pub fn run<C: SimulatorConnector>(
        &self,
        connector: &mut C,
        destination: &Pose,
        recording: Option<&Path>,
    ) -> Result<SessionReport, SessionError> {
        tracing::debug!(phase = %SessionPhase::Connecting, endpoint = %self.endpoint, "session phase");
        let session = connector.connect(&self.endpoint, self.timeout)?;
        let mut active = ActiveSession::new(session);
        let outcome = self.drive(&mut active, destination, recording);
        let cleanup_ok = match active.cleanup() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "session cleanup failed");
                false
            }
        };
        outcome.map(|mut report| {
            report.cleanup_ok = cleanup_ok;
            report
        })
    }

    fn drive<S: SimulatorSession>(
        &self,
        active: &mut ActiveSession<S>,
        destination: &Pose,
        recording: Option<&Path>,
    ) -> Result<SessionReport, SessionError> {
        active.capture_and_apply_sync(self.fixed_delta_seconds)?;

        tracing::debug!(phase = %SessionPhase::AwaitingEgo, role = %self.ego_role_name, "session phase");
        let ego = self.await_ego(active.session())?;
        tracing::info!(ego = %ego, "ego actor found");

        let target = destination_transform(destination);
        let waypoint = active.session().road_waypoint(target.location)?;
        let target = snap_to_road(target, waypoint);
        let options = AgentOptions {
            target_speed: self.target_speed,
            sync_mode: true,
            fixed_delta_seconds: self.fixed_delta_seconds,
        };
        let mut agent = active.session().create_agent(ego, &options)?;
        agent.set_destination(target.location)?;

        if let Some(path) = recording {
            active.start_recording(path)?;
        }

        tracing::debug!(phase = %SessionPhase::Driving, "session phase");
        self.drive_to_terminal(active.session(), &mut agent, ego)
    }

    fn await_ego<S: SimulatorSession>(&self, session: &mut S) -> Result<ActorId, SessionError> {
        let attempts = self.ego_wait_secs.max(1);
        for attempt in 0..attempts {
            if let Some(ego) = session.find_actor_by_role(&self.ego_role_name)? {
                return Ok(ego);
            }
            if attempt + 1 < attempts {
                std::thread::sleep(self.ego_poll_interval);
            }
        }
        Err(SessionError::EgoNotFound {
            role_name: self.ego_role_name.clone(),
            attempts,
        })
    }

    fn drive_to_terminal<S: SimulatorSession, A: NavigationAgent>(
        &self,
        session: &mut S,
        agent: &mut A,
        ego: ActorId,
    ) -> Result<SessionReport, SessionError> {
        let clock = SessionClock::start(self.clock, self.fixed_delta_seconds);
        let ceiling = secs(self.detectors.max_duration_secs);
        let mut stuck = StuckState::default();
        let mut ticks: u32 = 0;
        let mut last_location = None;

        let terminal = loop {
            if clock.elapsed(ticks) >= ceiling {
                tracing::info!(ticks, "simulation timed out");
                break TerminalState::TimedOut;
            }
            session.tick()?;
            ticks += 1;
            let now = clock.elapsed(ticks);
            let location = session.actor_location(ego)?;
            last_location = Some(location);

            if is_fallen(&location, self.detectors.fallen_z) {
                tracing::info!(z = location.z, "ego fell through the map");
                break TerminalState::Fallen;
            }
            let (next, triggered) = stuck.step(location, now, &self.detectors);
            stuck = next;
            if triggered {
                tracing::info!(
                    stuck_secs = self.detectors.stuck_secs,
                    "ego stuck without movement"
                );
                break TerminalState::Stuck;
            }
            if agent.done()? {
                tracing::info!(ticks, "agent reached destination");
                break TerminalState::Reached;
            }
            let control = agent.run_step()?;
            session.apply_control(ego, &control)?;
        };

        Ok(SessionReport {
            terminal,
            ticks,
            elapsed: clock.elapsed(ticks),
            last_location,
            cleanup_ok: true,
        })
    }
}

/// Session plus everything cleanup must undo. Dropping it without calling
/// `cleanup` (a panic mid-loop) still runs cleanup.
struct ActiveSession<S: SimulatorSession> {
    session: S,
    original_settings: Option<WorldSettings>,
    recording: Option<PathBuf>,
    cleaned: bool,
}

impl<S: SimulatorSession> ActiveSession<S> {
    fn new(session: S) -> Self {
        Self {
            session,
            original_settings: None,
            recording: None,
            cleaned: false,
        }
    }

    fn session(&mut self) -> &mut S {
        &mut self.session
    }

    fn capture_and_apply_sync(&mut self, fixed_delta_seconds: f64) -> Result<(), SessionError> {
        let original = self.session.world_settings()?;
        self.original_settings = Some(original);
        let synchronous = WorldSettings {
            synchronous_mode: true,
            fixed_delta_seconds: Some(fixed_delta_seconds),
        };
        self.session.apply_settings(&synchronous)
    }

    fn start_recording(&mut self, path: &Path) -> Result<(), SessionError> {
        if self.recording.is_some() {
            return Ok(());
        }
        self.session.start_recorder(path)?;
        tracing::info!(path = %path.display(), "recording started");
        self.recording = Some(path.to_path_buf());
        Ok(())
    }

    /// Stop recording, restore settings, release the connection. Every step is
    /// attempted; the first error is returned.
    fn cleanup(&mut self) -> Result<(), SessionError> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;
        tracing::debug!(phase = %SessionPhase::Cleanup, "session phase");
        let mut first_error = None;
        if let Some(path) = self.recording.take() {
            match self.session.stop_recorder() {
                Ok(()) => tracing::info!(path = %path.display(), "recording stopped"),
                Err(err) => {
                    tracing::warn!(error = %err, "stop recorder");
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(original) = self.original_settings.take() {
            if let Err(err) = self.session.apply_settings(&original) {
                tracing::warn!(error = %err, "restore world settings");
                first_error.get_or_insert(err);
            }
        }
        self.session.disconnect();
        first_error.map_or(Ok(()), Err)
    }
}

impl<S: SimulatorSession> Drop for ActiveSession<S> {
    fn drop(&mut self) {
        if let Err(err) = self.cleanup() {
            tracing::warn!(error = %err, "session cleanup on drop failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod fake;
