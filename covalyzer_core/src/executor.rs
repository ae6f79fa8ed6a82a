use crate::testcase::Testcase;
use log::{debug, warn};
use std::ffi::{OsStr, OsString};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Environment variable the LLVM profile runtime reads its output path from.
pub const PROFILE_ENV_VAR: &str = "LLVM_PROFILE_FILE";

/// Bytes of child stderr kept for failure messages.
const STDERR_TAIL_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Timeout,
    Crash(String),
    Other(String),
}

impl ExecutionStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionStatus::Ok)
    }

    pub fn describe(&self) -> String {
        match self {
            ExecutionStatus::Ok => "ok".to_string(),
            ExecutionStatus::Timeout => "timed out".to_string(),
            ExecutionStatus::Crash(desc) | ExecutionStatus::Other(desc) => desc.clone(),
        }
    }
}

/// Environment overrides scoped to a single child process.
///
/// The parent's own environment is never modified; each invocation carries the
/// overrides it needs, most importantly the profile output path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    envs: Vec<(OsString, OsString)>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_profile(profile_path: &Path) -> Self {
        Self::new().with_env(PROFILE_ENV_VAR, profile_path)
    }

    pub fn with_env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        let key = key.as_ref().to_os_string();
        self.envs.retain(|(k, _)| *k != key);
        self.envs.push((key, value.as_ref().to_os_string()));
        self
    }

    pub fn envs(&self) -> &[(OsString, OsString)] {
        &self.envs
    }

    pub fn profile_path(&self) -> Option<&Path> {
        self.envs
            .iter()
            .find(|(k, _)| k == PROFILE_ENV_VAR)
            .map(|(_, v)| Path::new(v))
    }

    fn apply(&self, cmd: &mut Command) {
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
    }
}

/// Drives a coverage-instrumented target.
///
/// Each call is one blocking child-process run; the outcome is a status rather than
/// an error, so a failing batch never aborts the caller's replay loop.
pub trait CoverageExecutor {
    /// Runs the target once over a directory of input files (libFuzzer merge mode).
    fn run_input_dir(&mut self, input_dir: &Path, ctx: &ExecutionContext) -> ExecutionStatus;

    /// Starts the target once and streams every testcase to its stdin, in order.
    fn run_streaming(&mut self, testcases: &[Testcase], ctx: &ExecutionContext)
    -> ExecutionStatus;

    /// Runs the target once for a single testcase delivered on stdin.
    fn run_single(&mut self, testcase: &Testcase, ctx: &ExecutionContext) -> ExecutionStatus {
        self.run_streaming(std::slice::from_ref(testcase), ctx)
    }
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub binary: PathBuf,
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
}

impl CommandExecutorConfig {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            timeout: None,
            working_dir: None,
        }
    }
}

/// Runs the instrumented binary as a child process.
#[derive(Debug)]
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

/// Reads a child's stderr on a helper thread so the child never blocks on a full pipe.
struct StderrDrain {
    handle: Option<JoinHandle<Vec<u8>>>,
}

impl StderrDrain {
    fn start(stderr: Option<ChildStderr>) -> Self {
        let handle = stderr.map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });
        Self { handle }
    }

    fn finish(self) -> String {
        let Some(handle) = self.handle else {
            return String::new();
        };
        let buf = handle.join().unwrap_or_default();
        let tail = &buf[buf.len().saturating_sub(STDERR_TAIL_BYTES)..];
        String::from_utf8_lossy(tail).trim().to_string()
    }
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandExecutorConfig {
        &self.config
    }

    fn spawn(
        &self,
        args: &[&OsStr],
        stdin: Stdio,
        ctx: &ExecutionContext,
    ) -> Result<(Child, StderrDrain), ExecutionStatus> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        ctx.apply(&mut cmd);
        cmd.stdin(stdin);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        debug!("spawning {:?} {:?} with {:?}", self.config.binary, args, ctx.envs());
        let mut child = cmd.spawn().map_err(|e| {
            ExecutionStatus::Other(format!(
                "Failed to spawn command '{}': {}",
                self.config.binary.display(),
                e
            ))
        })?;
        let drain = StderrDrain::start(child.stderr.take());
        Ok((child, drain))
    }

    fn wait(&self, mut child: Child) -> Result<ExitStatus, ExecutionStatus> {
        match self.config.timeout {
            Some(timeout) => run_and_wait_with_timeout(child, timeout),
            None => child
                .wait()
                .map_err(|e| ExecutionStatus::Other(format!("Error waiting for child: {e}"))),
        }
    }

    fn finish(&self, child: Child, drain: StderrDrain) -> ExecutionStatus {
        let waited = self.wait(child);
        let stderr_tail = drain.finish();
        match waited {
            Ok(status) => status_from_exit(status, &stderr_tail),
            Err(status) => status,
        }
    }
}

fn run_and_wait_with_timeout(
    mut child: Child,
    timeout: Duration,
) -> Result<ExitStatus, ExecutionStatus> {
    let start_time = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if start_time.elapsed() > timeout {
                    warn!("Target timed out after {timeout:?}, killing...");
                    if let Err(e) = child.kill() {
                        return Err(ExecutionStatus::Other(format!(
                            "Failed to kill timed-out process: {e}",
                        )));
                    }
                    let _ = child.wait();
                    return Err(ExecutionStatus::Timeout);
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                return Err(ExecutionStatus::Other(format!(
                    "Error waiting for child: {e}",
                )));
            }
        }
    }
}

fn status_from_exit(status: ExitStatus, stderr_tail: &str) -> ExecutionStatus {
    if status.success() {
        return ExecutionStatus::Ok;
    }
    let mut desc = if let Some(code) = status.code() {
        format!("Exited with code {code}")
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            match status.signal() {
                Some(signal) => format!("Terminated by signal {signal}"),
                None => "Exited abnormally".to_string(),
            }
        }
        #[cfg(not(unix))]
        {
            "Exited abnormally".to_string()
        }
    };
    if !stderr_tail.is_empty() {
        desc.push_str(": ");
        desc.push_str(stderr_tail);
    }
    ExecutionStatus::Crash(desc)
}

impl CoverageExecutor for CommandExecutor {
    fn run_input_dir(&mut self, input_dir: &Path, ctx: &ExecutionContext) -> ExecutionStatus {
        let args = [
            OsStr::new("-merge=1"),
            OsStr::new("-dump_coverage=1"),
            input_dir.as_os_str(),
            input_dir.as_os_str(),
        ];
        match self.spawn(&args, Stdio::null(), ctx) {
            Ok((child, drain)) => self.finish(child, drain),
            Err(status) => status,
        }
    }

    fn run_streaming(
        &mut self,
        testcases: &[Testcase],
        ctx: &ExecutionContext,
    ) -> ExecutionStatus {
        let (mut child, drain) = match self.spawn(&[], Stdio::piped(), ctx) {
            Ok(spawned) => spawned,
            Err(status) => return status,
        };

        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            drain.finish();
            return ExecutionStatus::Other(
                "Child stdin was not available after piping.".to_string(),
            );
        };

        // The writer may block on a full pipe, so the deadline is enforced from here.
        let (waited, fed) = thread::scope(|scope| {
            let feeder = scope.spawn(move || feed_stdin(stdin, testcases));
            let waited = self.wait(child);
            let fed = feeder
                .join()
                .unwrap_or_else(|_| Err("stdin writer thread panicked".to_string()));
            (waited, fed)
        });
        let stderr_tail = drain.finish();

        match (waited, fed) {
            (Err(status), _) => status,
            (Ok(_), Err(msg)) => {
                warn!("{msg}");
                ExecutionStatus::Other(msg)
            }
            (Ok(status), Ok(())) => status_from_exit(status, &stderr_tail),
        }
    }
}

/// Writes every testcase in order, then closes the pipe to signal end of input.
fn feed_stdin(mut stdin: ChildStdin, testcases: &[Testcase]) -> Result<(), String> {
    for tc in testcases {
        stdin
            .write_all(tc.as_bytes())
            .map_err(|e| format!("Failed to write testcase {} to stdin: {e}", tc.id))?;
    }
    Ok(())
}
