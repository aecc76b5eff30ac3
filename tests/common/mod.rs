//! Shared test infrastructure for integration tests.
//!
//! A `BatchFixture` is a temp directory holding shell-script stand-ins for the
//! simulator launcher, the scenario interpreter and the simulator bridge, plus
//! a config file pointing `simbatch` at them.

use serde_json::{json, Value};
use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Launcher that exits immediately; the endpoint never answers probes.
const SIMULATOR_SCRIPT: &str = "#!/bin/sh\nexit 0\n";

/// Dies during initialization for scenario files named `*Crash*`.
const INTERPRETER_SCRIPT: &str = r#"#!/bin/sh
case "$2" in
  *Crash*) echo "Traceback: could not load $2" >&2; exit 3 ;;
esac
exec sleep 30
"#;

/// Minimal JSON-lines bridge: the ego appears at once, moves one unit per
/// tick and the agent reports done on its third check. Request ids are
/// sequential from 1, so the line counter doubles as the response id.
const BRIDGE_SCRIPT: &str = r#"#!/bin/sh
log="$1"
n=0
checks=0
while IFS= read -r line; do
  n=$((n + 1))
  case "$line" in
    *'"op":"get_settings"'*) result='{"synchronous_mode":false,"fixed_delta_seconds":null}' ;;
    *'"op":"find_actor"'*) result='7' ;;
    *'"op":"agent_create"'*) result='{"agent_id":1}' ;;
    *'"op":"tick"'*) result="$n" ;;
    *'"op":"actor_location"'*) result="{\"x\":$n,\"y\":0.0,\"z\":0.5}" ;;
    *'"op":"agent_done"'*)
      checks=$((checks + 1))
      if [ "$checks" -ge 3 ]; then result='true'; else result='false'; fi ;;
    *'"op":"agent_run_step"'*) result='{"throttle":0.5,"steer":0.0,"brake":0.0}' ;;
    *'"op":"start_recorder"'*|*'"op":"stop_recorder"'*|*'"op":"apply_settings"'*)
      echo "$line" >> "$log"; result='null' ;;
    *'"op":"disconnect"'*) exit 0 ;;
    *) result='null' ;;
  esac
  printf '{"id":%s,"ok":true,"result":%s}\n' "$n" "$result"
done
"#;

pub struct BatchFixture {
    pub dir: TempDir,
}

impl BatchFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("scenarios")).expect("scenarios dir");
        let fixture = Self { dir };
        fixture.write_script("sim.sh", SIMULATOR_SCRIPT);
        fixture.write_script("interp.sh", INTERPRETER_SCRIPT);
        fixture.write_script("bridge.sh", BRIDGE_SCRIPT);
        fixture.write_config(&fixture.path("sim.sh"));
        fixture
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn config_path(&self) -> PathBuf {
        self.path("config.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.path("outcomes.json")
    }

    pub fn bridge_log(&self) -> String {
        fs::read_to_string(self.path("bridge.log")).unwrap_or_default()
    }

    fn write_script(&self, name: &str, body: &str) {
        let path = self.path(name);
        fs::write(&path, body).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    pub fn write_config(&self, simulator: &Path) {
        let config = json!({
            "simulator": {
                "executable": simulator,
                "kill_pattern": format!("simbatch-it-no-such-process-{}", std::process::id()),
                "host": "127.0.0.1",
                "port": closed_port(),
                "timeout_secs": 5.0,
                "probe_timeout_secs": 0.1,
                "kill_settle_secs": 0.0,
                "restart_grace_secs": 0.0,
                "start_settle_secs": 0.0
            },
            "interpreter": {
                "command": command(&["sh", &self.path("interp.sh").to_string_lossy()]),
                "init_wait_secs": 0.5
            },
            "session": {
                "bridge_command": command(&[
                    "sh",
                    &self.path("bridge.sh").to_string_lossy(),
                    &self.path("bridge.log").to_string_lossy(),
                ]),
                "ego_wait_secs": 1,
                "ego_poll_interval_secs": 0.0
            },
            "paths": {
                "catalog": self.path("catalog.json"),
                "scenarios_dir": self.path("scenarios"),
                "ledger": self.ledger_path(),
                "record_dir": self.path("records")
            }
        });
        fs::write(
            self.config_path(),
            serde_json::to_string_pretty(&config).expect("config json"),
        )
        .expect("write config");
    }

    pub fn write_catalog(&self, catalog: &Value) {
        fs::write(self.path("catalog.json"), catalog.to_string()).expect("write catalog");
    }

    pub fn add_scenario_file(&self, id: &str) {
        fs::write(self.path("scenarios").join(id), "<OpenSCENARIO/>").expect("write scenario");
    }

    pub fn simbatch(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_simbatch"))
            .args(args)
            .arg("--config")
            .arg(self.config_path())
            .env_remove("RUST_LOG")
            .output()
            .expect("run simbatch")
    }

    pub fn ledger(&self) -> Value {
        let text = fs::read_to_string(self.ledger_path()).expect("read ledger");
        serde_json::from_str(&text).expect("ledger json")
    }
}

fn command(argv: &[&str]) -> String {
    shell_words::join(argv)
}

/// A port nothing listens on once the probe listener is dropped.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

pub fn destination(x: f64, y: f64) -> Value {
    json!({ "acquire_position_actions": [ { "x": x, "y": y, "z": 0.0, "h": 0.0 } ] })
}
