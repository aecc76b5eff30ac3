use super::{KillReport, SimulatorProcess};
use crate::config::{Endpoint, SimulatorConfig};
use anyhow::{anyhow, Context, Result};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Real processes: `pkill -f` for termination, a detached spawn for start and a
/// TCP connect to the RPC port as the liveness handshake.
pub struct OsSimulatorProcess {
    kill_pattern: String,
    port_arg: String,
    extra_args: Vec<String>,
    // Launcher handles kept only so exited launchers get reaped.
    launched: Vec<Child>,
}

impl OsSimulatorProcess {
    pub fn new(config: &SimulatorConfig) -> Self {
        Self {
            kill_pattern: config.kill_pattern.clone(),
            port_arg: config.port_arg.clone(),
            extra_args: config.extra_args.clone(),
            launched: Vec::new(),
        }
    }

    fn reap_launchers(&mut self) {
        self.launched
            .retain_mut(|child| matches!(child.try_wait(), Ok(None)));
    }
}

impl SimulatorProcess for OsSimulatorProcess {
    fn is_alive(&mut self, endpoint: &Endpoint, timeout: Duration) -> bool {
        let addrs = match (endpoint.host.as_str(), endpoint.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(err) => {
                tracing::debug!(%endpoint, error = %err, "could not resolve simulator host");
                return false;
            }
        };
        let timeout = timeout.max(Duration::from_millis(1));
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(_) => return true,
                Err(err) => tracing::debug!(%addr, error = %err, "simulator probe failed"),
            }
        }
        false
    }

    fn kill(&mut self) -> KillReport {
        let pkill = match which::which("pkill") {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(error = %err, "pkill not found; cannot stop simulator by name");
                return KillReport::Unavailable;
            }
        };
        let status = Command::new(pkill)
            .args(["-f", &self.kill_pattern])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        let report = match status {
            Ok(status) => match status.code() {
                Some(0) => KillReport::Signalled,
                Some(1) => KillReport::NoneMatched,
                code => {
                    tracing::warn!(?code, pattern = %self.kill_pattern, "pkill failed");
                    KillReport::Unavailable
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "could not run pkill");
                KillReport::Unavailable
            }
        };
        self.reap_launchers();
        report
    }

    fn start(&mut self, executable: &Path, port: u16) -> Result<()> {
        if !executable.is_file() {
            return Err(anyhow!(
                "simulator executable not found at {}",
                executable.display()
            ));
        }
        let mut cmd = Command::new(executable);
        cmd.arg(self.port_arg.replace("{port}", &port.to_string()))
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut cmd);
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", executable.display()))?;
        tracing::info!(pid = child.id(), "simulator launched in background");
        self.launched.push(child);
        Ok(())
    }
}

/// Run the child in a new session so it outlives the orchestrator and is not
/// reached by signals aimed at our process group.
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) {}
