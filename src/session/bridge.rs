//! Simulator client over a JSON-lines bridge process.
//!
//! The bridge is spawned per session and speaks one JSON object per line:
//! requests `{"id", "op", "params"}` on stdin, responses `{"id", "ok",
//! "result" | "error"}` on stdout. Every request is bounded by the configured
//! client timeout, so a hung simulator surfaces as [`SessionError::Timeout`]
//! instead of blocking the batch.
use super::{
    ActorId, AgentOptions, Location, NavigationAgent, SessionError, SimulatorConnector,
    SimulatorSession, Transform, VehicleControl, WorldSettings,
};
use crate::config::{Endpoint, SessionConfig};
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

/// How long a bridge gets to exit on its own after `disconnect`.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

pub struct BridgeConnector {
    program: String,
    args: Vec<String>,
}

impl BridgeConnector {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let argv = shell_words::split(&config.bridge_command)
            .with_context(|| format!("parse bridge command {:?}", config.bridge_command))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("session.bridge_command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl SimulatorConnector for BridgeConnector {
    type Session = BridgeSession;

    fn connect(&mut self, endpoint: &Endpoint, timeout: Duration) -> Result<BridgeSession, SessionError> {
        let connection_error = |reason: String| SessionError::Connection {
            endpoint: endpoint.to_string(),
            reason,
        };
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| connection_error(format!("spawn bridge {}: {err}", self.program)))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(connection_error("bridge stdio unavailable".to_string()));
        };

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                tracing::debug!(target: "simbatch::bridge", "{line}");
            }
        });

        let channel = BridgeChannel::new(Box::new(stdin), rx, timeout);
        let mut session = BridgeSession::new(channel, Some(child));
        session
            .call::<Value>(
                "connect",
                json!({
                    "host": endpoint.host,
                    "port": endpoint.port,
                    "timeout_secs": timeout.as_secs_f64(),
                }),
            )
            .map_err(|err| connection_error(err.to_string()))?;
        tracing::debug!(%endpoint, "bridge connected");
        Ok(session)
    }
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Request/response framing over one bridge's pipes.
pub(crate) struct BridgeChannel {
    writer: Box<dyn Write>,
    responses: Receiver<String>,
    next_id: u64,
    timeout: Duration,
}

impl BridgeChannel {
    pub(crate) fn new(writer: Box<dyn Write>, responses: Receiver<String>, timeout: Duration) -> Self {
        Self {
            writer,
            responses,
            next_id: 1,
            timeout,
        }
    }

    fn send(&mut self, op: &str, params: Value) -> Result<u64, SessionError> {
        let id = self.next_id;
        self.next_id += 1;
        let line = json!({ "id": id, "op": op, "params": params }).to_string();
        writeln!(self.writer, "{line}")
            .and_then(|()| self.writer.flush())
            .map_err(|err| SessionError::Bridge(format!("write {op} request: {err}")))?;
        Ok(id)
    }

    /// Send without waiting for the response.
    fn notify(&mut self, op: &str) -> Result<(), SessionError> {
        self.send(op, json!({})).map(|_| ())
    }

    fn request(&mut self, op: &str, params: Value) -> Result<Value, SessionError> {
        let id = self.send(op, params)?;
        let timeout = self.timeout;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match self.responses.recv_timeout(remaining) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SessionError::Timeout {
                        op: op.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::Bridge(format!(
                        "bridge exited while waiting for {op}"
                    )))
                }
            };
            let response: BridgeResponse = match serde_json::from_str(&line) {
                Ok(response) => response,
                Err(_) => {
                    tracing::debug!(target: "simbatch::bridge", %line, "ignoring non-protocol output");
                    continue;
                }
            };
            if response.id != id {
                tracing::debug!(expected = id, got = response.id, "discarding stale bridge response");
                continue;
            }
            if response.ok {
                return Ok(response.result);
            }
            return Err(SessionError::Request {
                op: op.to_string(),
                message: response
                    .error
                    .unwrap_or_else(|| "unspecified error".to_string()),
            });
        }
    }
}

fn call_on<T: DeserializeOwned>(
    channel: &RefCell<BridgeChannel>,
    op: &str,
    params: Value,
) -> Result<T, SessionError> {
    let result = channel.borrow_mut().request(op, params)?;
    serde_json::from_value(result).map_err(|err| SessionError::Request {
        op: op.to_string(),
        message: format!("malformed result: {err}"),
    })
}

pub struct BridgeSession {
    channel: Rc<RefCell<BridgeChannel>>,
    child: Option<Child>,
    released: bool,
}

impl BridgeSession {
    pub(crate) fn new(channel: BridgeChannel, child: Option<Child>) -> Self {
        Self {
            channel: Rc::new(RefCell::new(channel)),
            child,
            released: false,
        }
    }

    fn call<T: DeserializeOwned>(&mut self, op: &str, params: Value) -> Result<T, SessionError> {
        call_on(&self.channel, op, params)
    }
}

impl SimulatorSession for BridgeSession {
    type Agent = BridgeAgent;

    fn world_settings(&mut self) -> Result<WorldSettings, SessionError> {
        self.call("get_settings", json!({}))
    }

    fn apply_settings(&mut self, settings: &WorldSettings) -> Result<(), SessionError> {
        self.call::<Value>("apply_settings", json!({ "settings": settings }))
            .map(|_| ())
    }

    fn find_actor_by_role(&mut self, role_name: &str) -> Result<Option<ActorId>, SessionError> {
        self.call("find_actor", json!({ "role_name": role_name }))
    }

    fn actor_location(&mut self, actor: ActorId) -> Result<Location, SessionError> {
        self.call("actor_location", json!({ "actor_id": actor }))
    }

    fn road_waypoint(&mut self, location: Location) -> Result<Option<Transform>, SessionError> {
        self.call("waypoint", json!({ "location": location }))
    }

    fn tick(&mut self) -> Result<u64, SessionError> {
        self.call("tick", json!({}))
    }

    fn apply_control(&mut self, actor: ActorId, control: &VehicleControl) -> Result<(), SessionError> {
        self.call::<Value>(
            "apply_control",
            json!({ "actor_id": actor, "control": control }),
        )
        .map(|_| ())
    }

    fn start_recorder(&mut self, path: &Path) -> Result<(), SessionError> {
        self.call::<Value>(
            "start_recorder",
            json!({ "path": path.to_string_lossy() }),
        )
        .map(|_| ())
    }

    fn stop_recorder(&mut self) -> Result<(), SessionError> {
        self.call::<Value>("stop_recorder", json!({})).map(|_| ())
    }

    fn create_agent(&mut self, ego: ActorId, options: &AgentOptions) -> Result<BridgeAgent, SessionError> {
        #[derive(Deserialize)]
        struct Created {
            agent_id: u64,
        }
        let created: Created = self.call(
            "agent_create",
            json!({ "actor_id": ego, "options": options }),
        )?;
        Ok(BridgeAgent {
            channel: Rc::clone(&self.channel),
            agent_id: created.agent_id,
        })
    }

    fn disconnect(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.channel.borrow_mut().notify("disconnect") {
            tracing::debug!(error = %err, "bridge disconnect");
        }
        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + DISCONNECT_GRACE;
            while matches!(child.try_wait(), Ok(None)) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Navigation agent living inside the bridge; shares the session's channel.
pub struct BridgeAgent {
    channel: Rc<RefCell<BridgeChannel>>,
    agent_id: u64,
}

impl NavigationAgent for BridgeAgent {
    fn set_destination(&mut self, destination: Location) -> Result<(), SessionError> {
        call_on::<Value>(
            &self.channel,
            "agent_set_destination",
            json!({ "agent_id": self.agent_id, "destination": destination }),
        )
        .map(|_| ())
    }

    fn done(&mut self) -> Result<bool, SessionError> {
        call_on(&self.channel, "agent_done", json!({ "agent_id": self.agent_id }))
    }

    fn run_step(&mut self) -> Result<VehicleControl, SessionError> {
        call_on(
            &self.channel,
            "agent_run_step",
            json!({ "agent_id": self.agent_id }),
        )
    }
}
