//! Scriptable in-memory simulator for control-loop and scheduler tests.
use super::{
    ActorId, AgentOptions, Location, NavigationAgent, SessionError, SimulatorConnector,
    SimulatorSession, Transform, VehicleControl, WorldSettings,
};
use crate::config::Endpoint;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

pub const EGO: ActorId = ActorId(7);

/// Behaviour of every session the connector opens.
#[derive(Debug, Clone)]
pub struct FakeScript {
    pub initial_settings: WorldSettings,
    /// Probes answered with "absent" before the ego shows up; `None` never.
    pub ego_after_probes: Option<u32>,
    /// Ego position per tick (1-based); the last entry repeats. Empty means
    /// steady motion along x.
    pub positions: Vec<Location>,
    pub done_after_ticks: Option<u32>,
    pub fail_tick_at: Option<u32>,
    pub panic_tick_at: Option<u32>,
    pub waypoint: Option<Transform>,
    pub refuse_connect: bool,
    pub fail_stop_recorder: bool,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            initial_settings: WorldSettings {
                synchronous_mode: false,
                fixed_delta_seconds: None,
            },
            ego_after_probes: Some(0),
            positions: Vec::new(),
            done_after_ticks: Some(3),
            fail_tick_at: None,
            panic_tick_at: None,
            waypoint: None,
            refuse_connect: false,
            fail_stop_recorder: false,
        }
    }
}

impl FakeScript {
    fn position(&self, tick: u32) -> Location {
        if self.positions.is_empty() {
            return Location::new(f64::from(tick), 0.0, 0.5);
        }
        let index = (tick.max(1) as usize - 1).min(self.positions.len() - 1);
        self.positions[index]
    }
}

/// Everything the fake observed, shared across sessions of one connector.
#[derive(Debug, Default)]
pub struct FakeSessionLog {
    pub connects: usize,
    pub disconnects: usize,
    pub current_settings: Option<WorldSettings>,
    pub applied_settings: Vec<WorldSettings>,
    pub ego_probes: u32,
    pub ticks: u32,
    pub controls: usize,
    pub recordings_started: Vec<PathBuf>,
    pub recordings_stopped: usize,
    pub destination: Option<Location>,
    pub agent_options: Option<AgentOptions>,
}

#[derive(Debug, Default)]
pub struct FakeConnector {
    pub script: FakeScript,
    pub log: Rc<RefCell<FakeSessionLog>>,
}

impl FakeConnector {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            log: Rc::default(),
        }
    }
}

impl SimulatorConnector for FakeConnector {
    type Session = FakeSession;

    fn connect(&mut self, endpoint: &Endpoint, _timeout: Duration) -> Result<FakeSession, SessionError> {
        if self.script.refuse_connect {
            return Err(SessionError::Connection {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        {
            let mut log = self.log.borrow_mut();
            log.connects += 1;
            log.current_settings = Some(self.script.initial_settings);
            log.ticks = 0;
            log.ego_probes = 0;
        }
        Ok(FakeSession {
            script: self.script.clone(),
            log: Rc::clone(&self.log),
        })
    }
}

pub struct FakeSession {
    script: FakeScript,
    log: Rc<RefCell<FakeSessionLog>>,
}

impl SimulatorSession for FakeSession {
    type Agent = FakeAgent;

    fn world_settings(&mut self) -> Result<WorldSettings, SessionError> {
        self.log
            .borrow()
            .current_settings
            .ok_or_else(|| SessionError::Bridge("not connected".to_string()))
    }

    fn apply_settings(&mut self, settings: &WorldSettings) -> Result<(), SessionError> {
        let mut log = self.log.borrow_mut();
        log.current_settings = Some(*settings);
        log.applied_settings.push(*settings);
        Ok(())
    }

    fn find_actor_by_role(&mut self, _role_name: &str) -> Result<Option<ActorId>, SessionError> {
        let mut log = self.log.borrow_mut();
        log.ego_probes += 1;
        Ok(match self.script.ego_after_probes {
            Some(absent) if log.ego_probes > absent => Some(EGO),
            _ => None,
        })
    }

    fn actor_location(&mut self, _actor: ActorId) -> Result<Location, SessionError> {
        let tick = self.log.borrow().ticks;
        Ok(self.script.position(tick))
    }

    fn road_waypoint(&mut self, _location: Location) -> Result<Option<Transform>, SessionError> {
        Ok(self.script.waypoint)
    }

    fn tick(&mut self) -> Result<u64, SessionError> {
        let tick = {
            let mut log = self.log.borrow_mut();
            log.ticks += 1;
            log.ticks
        };
        if self.script.fail_tick_at == Some(tick) {
            return Err(SessionError::Timeout {
                op: "tick".to_string(),
                timeout_ms: 20_000,
            });
        }
        if self.script.panic_tick_at == Some(tick) {
            panic!("simulated client crash at tick {tick}");
        }
        Ok(u64::from(tick))
    }

    fn apply_control(&mut self, _actor: ActorId, _control: &VehicleControl) -> Result<(), SessionError> {
        self.log.borrow_mut().controls += 1;
        Ok(())
    }

    fn start_recorder(&mut self, path: &Path) -> Result<(), SessionError> {
        self.log
            .borrow_mut()
            .recordings_started
            .push(path.to_path_buf());
        Ok(())
    }

    fn stop_recorder(&mut self) -> Result<(), SessionError> {
        self.log.borrow_mut().recordings_stopped += 1;
        if self.script.fail_stop_recorder {
            return Err(SessionError::Request {
                op: "stop_recorder".to_string(),
                message: "recorder not running".to_string(),
            });
        }
        Ok(())
    }

    fn create_agent(&mut self, _ego: ActorId, options: &AgentOptions) -> Result<FakeAgent, SessionError> {
        self.log.borrow_mut().agent_options = Some(*options);
        Ok(FakeAgent {
            done_after_ticks: self.script.done_after_ticks,
            log: Rc::clone(&self.log),
        })
    }

    fn disconnect(&mut self) {
        self.log.borrow_mut().disconnects += 1;
    }
}

pub struct FakeAgent {
    done_after_ticks: Option<u32>,
    log: Rc<RefCell<FakeSessionLog>>,
}

impl NavigationAgent for FakeAgent {
    fn set_destination(&mut self, destination: Location) -> Result<(), SessionError> {
        self.log.borrow_mut().destination = Some(destination);
        Ok(())
    }

    fn done(&mut self) -> Result<bool, SessionError> {
        let ticks = self.log.borrow().ticks;
        Ok(self.done_after_ticks.is_some_and(|limit| ticks >= limit))
    }

    fn run_step(&mut self) -> Result<VehicleControl, SessionError> {
        Ok(VehicleControl {
            throttle: 0.6,
            ..VehicleControl::default()
        })
    }
}
