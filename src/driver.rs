//! Scenario interpreter subprocess supervision.
//!
//! The interpreter drives scripted world behaviour for the whole scenario while
//! the session control loop drives the ego; this module only starts it, checks
//! it survived its initialization window, and kills it afterwards. It never
//! waits for natural completion.
use crate::config::{secs, Endpoint, InterpreterConfig};
use crate::util::{bounded_snippet, tail_utf8};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Retained tail of each captured stream.
const MAX_CAPTURED_BYTES: usize = 1024 * 1024;
/// How long to wait for trailing output after the process is gone.
const OUTPUT_DRAIN_IDLE: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("interpreter command is empty")]
    EmptyCommand,
    #[error("parse interpreter command: {0}")]
    Command(#[from] shell_words::ParseError),
    #[error("spawn interpreter {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("interpreter exited during initialization ({status})")]
    EarlyExit {
        status: String,
        output: CapturedOutput,
    },
    #[error("poll interpreter: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.trim().is_empty() && self.stderr.trim().is_empty()
    }
}

/// A running interpreter.
pub trait InterpreterHandle {
    /// `Some(status)` once the process has exited.
    fn exit_status(&mut self) -> Result<Option<String>, DriverError>;

    /// Force-kill and reap. Calling it again, or on an exited process, is a no-op.
    fn terminate(&mut self) -> Result<(), DriverError>;

    /// Everything captured so far.
    fn captured_output(&mut self) -> CapturedOutput;
}

/// Starts interpreters for scenario files.
pub trait InterpreterLauncher {
    type Handle: InterpreterHandle;

    fn launch(&mut self, scenario_file: &Path, endpoint: &Endpoint)
        -> Result<Self::Handle, DriverError>;
}

/// Lifecycle policy around a launcher: the initialization window and how much
/// captured output is surfaced.
pub struct Driver<L> {
    launcher: L,
    init_wait: Duration,
    snippet_max_lines: usize,
    snippet_max_bytes: usize,
}

impl<L: InterpreterLauncher> Driver<L> {
    pub fn new(launcher: L, config: &InterpreterConfig) -> Self {
        Self {
            launcher,
            init_wait: secs(config.init_wait_secs),
            snippet_max_lines: config.snippet_max_lines,
            snippet_max_bytes: config.snippet_max_bytes,
        }
    }

    pub fn launch(
        &mut self,
        scenario_file: &Path,
        endpoint: &Endpoint,
    ) -> Result<L::Handle, DriverError> {
        let handle = self.launcher.launch(scenario_file, endpoint)?;
        tracing::debug!(scenario_file = %scenario_file.display(), "interpreter launched");
        Ok(handle)
    }

    /// Sleep the grace window, then fail if the interpreter already exited.
    pub fn await_initialization(&self, handle: &mut L::Handle) -> Result<(), DriverError> {
        tracing::info!(
            wait_ms = self.init_wait.as_millis() as u64,
            "waiting for interpreter to initialize"
        );
        thread::sleep(self.init_wait);
        match handle.exit_status()? {
            Some(status) => Err(DriverError::EarlyExit {
                status,
                output: handle.captured_output(),
            }),
            None => Ok(()),
        }
    }

    pub fn terminate(&self, handle: &mut L::Handle) -> Result<(), DriverError> {
        handle.terminate()
    }

    /// Log a bounded snippet of captured output for diagnostics.
    pub fn surface_output(&self, scenario_id: &str, output: &CapturedOutput) {
        if output.is_empty() {
            tracing::info!(scenario = %scenario_id, "interpreter produced no output");
            return;
        }
        let stdout = bounded_snippet(&output.stdout, self.snippet_max_lines, self.snippet_max_bytes);
        let stderr = bounded_snippet(&output.stderr, self.snippet_max_lines, self.snippet_max_bytes);
        tracing::warn!(
            scenario = %scenario_id,
            "interpreter output\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}"
        );
    }
}

/// Launches the configured interpreter command as a child process:
/// `<command...> --openscenario <file> --host <host> --port <port>`.
pub struct ProcessLauncher {
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(config: &InterpreterConfig) -> Result<Self, DriverError> {
        let argv = shell_words::split(&config.command)?;
        if argv.is_empty() {
            return Err(DriverError::EmptyCommand);
        }
        Ok(Self {
            argv,
            working_dir: config.working_dir.clone(),
        })
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    fn command_args(&self, scenario_file: &Path, endpoint: &Endpoint) -> Vec<String> {
        let mut args: Vec<String> = self.argv[1..].to_vec();
        args.push("--openscenario".to_string());
        args.push(scenario_file.display().to_string());
        args.push("--host".to_string());
        args.push(endpoint.host.clone());
        args.push("--port".to_string());
        args.push(endpoint.port.to_string());
        args
    }
}

impl InterpreterLauncher for ProcessLauncher {
    type Handle = ProcessHandle;

    fn launch(
        &mut self,
        scenario_file: &Path,
        endpoint: &Endpoint,
    ) -> Result<ProcessHandle, DriverError> {
        let mut cmd = Command::new(self.program());
        cmd.args(self.command_args(scenario_file, endpoint))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            program: self.program().to_string(),
            source,
        })?;
        let stdout = CapturedStream::spawn(child.stdout.take());
        let stderr = CapturedStream::spawn(child.stderr.take());
        tracing::debug!(pid = child.id(), "interpreter process spawned");
        Ok(ProcessHandle {
            child,
            exited: None,
            stdout,
            stderr,
        })
    }
}

pub struct ProcessHandle {
    child: Child,
    exited: Option<ExitStatus>,
    stdout: CapturedStream,
    stderr: CapturedStream,
}

impl InterpreterHandle for ProcessHandle {
    fn exit_status(&mut self) -> Result<Option<String>, DriverError> {
        if self.exited.is_none() {
            self.exited = self.child.try_wait().map_err(DriverError::Wait)?;
        }
        Ok(self.exited.map(|status| exit_status_string(&status)))
    }

    fn terminate(&mut self) -> Result<(), DriverError> {
        if self.exit_status()?.is_some() {
            return Ok(());
        }
        tracing::info!(pid = self.child.id(), "terminating interpreter");
        if let Err(err) = self.child.kill() {
            // Lost a race with a natural exit.
            tracing::debug!(error = %err, "kill interpreter");
        }
        let status = self.child.wait().map_err(DriverError::Wait)?;
        self.exited = Some(status);
        Ok(())
    }

    fn captured_output(&mut self) -> CapturedOutput {
        let settle = self.exited.is_some();
        CapturedOutput {
            stdout: self.stdout.collect(settle),
            stderr: self.stderr.collect(settle),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            tracing::warn!(error = %err, "could not terminate interpreter on drop");
        }
    }
}

/// Output tail shared with its reader thread, which trims it as lines arrive.
struct CapturedStream {
    tail: Arc<Mutex<String>>,
    reader: Option<JoinHandle<()>>,
}

impl CapturedStream {
    fn spawn<R: Read + Send + 'static>(stream: Option<R>) -> Self {
        let tail = Arc::new(Mutex::new(String::new()));
        let reader = stream.map(|stream| {
            let tail = Arc::clone(&tail);
            thread::spawn(move || {
                for line in BufReader::new(stream).lines().map_while(Result::ok) {
                    let mut text = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    append_bounded(&mut text, &line, MAX_CAPTURED_BYTES);
                }
            })
        });
        Self { tail, reader }
    }

    /// Snapshot of the retained tail. After exit, give the reader a short window
    /// to pick up trailing output.
    fn collect(&self, settle: bool) -> String {
        if settle {
            if let Some(reader) = &self.reader {
                let deadline = Instant::now() + OUTPUT_DRAIN_IDLE;
                while !reader.is_finished() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        let text = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail_utf8(&text, MAX_CAPTURED_BYTES).to_string()
    }
}

/// Append one line. Past twice `max_bytes` the front is dropped down to
/// `max_bytes`, so memory stays bounded however chatty the process is.
fn append_bounded(text: &mut String, line: &str, max_bytes: usize) {
    text.push_str(line);
    text.push('\n');
    if text.len() > max_bytes.saturating_mul(2) {
        let cut = text.len() - tail_utf8(text, max_bytes).len();
        text.drain(..cut);
    }
}

fn exit_status_string(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exit code {code}")
    } else {
        "terminated by signal".to_string()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Shared view of what fake interpreters did, for assertions after the
    /// handles are gone.
    #[derive(Debug, Default)]
    pub struct FakeInterpreterLog {
        pub launched: Vec<PathBuf>,
        pub terminated: usize,
    }

    #[derive(Default)]
    pub struct FakeLauncher {
        pub log: Rc<RefCell<FakeInterpreterLog>>,
        /// Scenario file names whose interpreter dies during initialization.
        pub crashing: Vec<String>,
    }

    pub struct FakeHandle {
        log: Rc<RefCell<FakeInterpreterLog>>,
        exited: bool,
    }

    impl InterpreterLauncher for FakeLauncher {
        type Handle = FakeHandle;

        fn launch(
            &mut self,
            scenario_file: &Path,
            _endpoint: &Endpoint,
        ) -> Result<FakeHandle, DriverError> {
            self.log
                .borrow_mut()
                .launched
                .push(scenario_file.to_path_buf());
            let crashes = scenario_file
                .file_name()
                .map(|name| {
                    self.crashing
                        .iter()
                        .any(|crashing| name.to_string_lossy() == crashing.as_str())
                })
                .unwrap_or(false);
            Ok(FakeHandle {
                log: Rc::clone(&self.log),
                exited: crashes,
            })
        }
    }

    impl InterpreterHandle for FakeHandle {
        fn exit_status(&mut self) -> Result<Option<String>, DriverError> {
            Ok(self.exited.then(|| "exit code 1".to_string()))
        }

        fn terminate(&mut self) -> Result<(), DriverError> {
            if !self.exited {
                self.exited = true;
                self.log.borrow_mut().terminated += 1;
            }
            Ok(())
        }

        fn captured_output(&mut self) -> CapturedOutput {
            CapturedOutput {
                stdout: String::new(),
                stderr: "Traceback: scenario failed to load\n".to_string(),
            }
        }
    }
}
