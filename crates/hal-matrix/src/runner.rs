//! Job execution and log capture.
//!
//! [`JobRunner`] runs one tool invocation for one profile, writes the job
//! log, and classifies the outcome. It never returns an error: spawn and
//! I/O failures become [`JobStatus::InternalError`].

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::ToolInvocation;
use crate::context::BuildContext;

/// Default wall-clock limit for a single job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// What happened to an external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The process exited on its own. Signal deaths report `-1`.
    Exited {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// The timeout elapsed and the process was killed.
    TimedOut,
}

/// Spawns external processes.
///
/// [`ProcessExecutor`] is the real implementation; tests inject
/// [`crate::fakes::FakeExecutor`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `invocation` to completion or until `timeout` elapses.
    ///
    /// On timeout the process must be terminated before returning.
    async fn execute(&self, invocation: &ToolInvocation, timeout: Duration)
        -> io::Result<ExecOutcome>;
}

/// How long output pipes may stay open after the process exits.
///
/// Background processes left behind by the tool can hold the pipes open
/// indefinitely; the outcome is decided by the exit status alone.
pub const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Runs commands as child processes with `tokio::process`.
///
/// On unix every child leads its own process group. The whole group is
/// killed on timeout and once the leader exits, so nothing a job spawned
/// keeps running after its result is reported.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> io::Result<ExecOutcome> {
        let program = invocation
            .program()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let mut cmd = Command::new(program);
        cmd.args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = invocation.working_dir() {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let group = child.id();
        let (stdout, mut stdout_reader) = spawn_reader(child.stdout.take());
        let (stderr, mut stderr_reader) = spawn_reader(child.stderr.take());

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => status,
            Err(_) => {
                kill_process_group(group);
                // kill() also reaps the child.
                if let Err(e) = child.kill().await {
                    warn!(command = %invocation.command_line(), error = %e, "Failed to kill timed out process");
                }
                stdout_reader.abort();
                stderr_reader.abort();
                return Ok(ExecOutcome::TimedOut);
            }
        };

        let drained = tokio::time::timeout(PIPE_DRAIN_GRACE, async {
            let _ = tokio::join!(&mut stdout_reader, &mut stderr_reader);
        })
        .await;
        if drained.is_err() {
            debug!(command = %invocation.command_line(), "Output still open after exit; killing leftover processes");
        }
        kill_process_group(group);
        stdout_reader.abort();
        stderr_reader.abort();

        let status = status?;
        Ok(ExecOutcome::Exited {
            code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&take_output(&stdout)).into_owned(),
            stderr: String::from_utf8_lossy(&take_output(&stderr)).into_owned(),
        })
    }
}

type OutputBuffer = Arc<Mutex<Vec<u8>>>;

/// Copy `pipe` into a shared buffer on a background task.
///
/// The buffer keeps whatever was read even if the task is aborted.
fn spawn_reader<R>(pipe: Option<R>) -> (OutputBuffer, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = OutputBuffer::default();
    let sink = Arc::clone(&buffer);
    let handle = tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .extend_from_slice(&chunk[..n]),
            }
        }
    });
    (buffer, handle)
}

fn take_output(buffer: &OutputBuffer) -> Vec<u8> {
    std::mem::take(&mut *buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
}

/// SIGKILL every process left in the group led by `leader`.
#[cfg(unix)]
fn kill_process_group(leader: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = leader.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_leader: Option<u32>) {}

/// Classification of a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failure,
    Timeout,
    InternalError,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }

    /// Short tag used in progress lines and summaries.
    pub fn tag(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Timeout => "timeout",
            JobStatus::InternalError => "error",
        }
    }
}

/// Outcome of one job for one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub profile_name: String,
    pub status: JobStatus,
    /// Captured output; written for every outcome.
    pub log_file: PathBuf,
    /// Process exit code when the process exited on its own.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Error or timeout description for non-exit outcomes.
    pub detail: Option<String>,
}

impl JobResult {
    pub fn passed(&self) -> bool {
        self.status.is_success()
    }

    /// A result for a job that never reached its process.
    pub fn internal_error(profile_name: &str, log_file: PathBuf, detail: impl Into<String>) -> Self {
        Self {
            profile_name: profile_name.to_string(),
            status: JobStatus::InternalError,
            log_file,
            exit_code: None,
            duration_ms: 0,
            detail: Some(detail.into()),
        }
    }
}

/// Runs one invocation per call and records its log.
#[derive(Clone)]
pub struct JobRunner {
    executor: Arc<dyn CommandExecutor>,
}

impl JobRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Runner backed by real child processes.
    pub fn process() -> Self {
        Self::new(Arc::new(ProcessExecutor))
    }

    /// Run the build or package job for `ctx`, logging to its `log` file.
    pub async fn run(
        &self,
        ctx: &BuildContext,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> JobResult {
        self.run_logged(ctx.profile().name(), ctx.log_file(), invocation, timeout)
            .await
    }

    /// Run the dependency install for `ctx`, logging to its `install.log`.
    pub async fn run_install(
        &self,
        ctx: &BuildContext,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> JobResult {
        self.run_logged(ctx.profile().name(), ctx.install_log_file(), invocation, timeout)
            .await
    }

    async fn run_logged(
        &self,
        profile_name: &str,
        log_file: PathBuf,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> JobResult {
        let start = Instant::now();
        let command_line = invocation.command_line();
        debug!(profile = %profile_name, command = %command_line, "Spawning job");

        let outcome = self.executor.execute(invocation, timeout).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (status, exit_code, detail, log) = match outcome {
            Ok(ExecOutcome::Exited {
                code,
                stdout,
                stderr,
            }) => {
                let status = if code == 0 {
                    JobStatus::Success
                } else {
                    JobStatus::Failure
                };
                let log = format_exit_log(&command_line, code, &stdout, &stderr);
                (status, Some(code), None, log)
            }
            Ok(ExecOutcome::TimedOut) => {
                let detail = format!(
                    "command exceeded {} seconds and was terminated",
                    timeout.as_secs_f64()
                );
                let log = format!("Command: {command_line}\nTIMEOUT: {detail}\n");
                (JobStatus::Timeout, None, Some(detail), log)
            }
            Err(e) => {
                let detail = format!("failed to run command: {e}");
                let log = format!("Command: {command_line}\nERROR: {detail}\n");
                (JobStatus::InternalError, None, Some(detail), log)
            }
        };

        let mut result = JobResult {
            profile_name: profile_name.to_string(),
            status,
            log_file,
            exit_code,
            duration_ms,
            detail,
        };

        if let Err(e) = write_log(&result.log_file, &log).await {
            warn!(profile = %profile_name, path = %result.log_file.display(), error = %e, "Failed to write job log");
            result.status = JobStatus::InternalError;
            result.detail = Some(format!("failed to write log: {e}"));
        }

        result
    }
}

/// Log body for a process that exited on its own.
pub fn format_exit_log(command_line: &str, code: i32, stdout: &str, stderr: &str) -> String {
    format!(
        "Command: {command_line}\n\
         Return code: {code}\n\
         === STDOUT ===\n\
         {}\
         === STDERR ===\n\
         {}",
        line_terminated(stdout),
        line_terminated(stderr),
    )
}

/// `text` with exactly one trailing newline added when it lacks one.
fn line_terminated(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}

async fn write_log(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeExecutor;
    use crate::profile::{generate, MatrixTable};

    fn ctx(root: &Path) -> BuildContext {
        let table = MatrixTable::from_strings(&[("gcc", None, &["13.3"])], &[("cortex-m3", None)])
            .unwrap();
        BuildContext::new(generate(&table).unwrap().remove(0), root)
    }

    fn invocation() -> ToolInvocation {
        ToolInvocation::new(vec!["conan".to_string(), "build".to_string(), ".".to_string()])
    }

    #[test]
    fn test_status_tags() {
        assert_eq!(JobStatus::Success.tag(), "success");
        assert_eq!(JobStatus::Failure.tag(), "failure");
        assert_eq!(JobStatus::Timeout.tag(), "timeout");
        assert_eq!(JobStatus::InternalError.tag(), "error");
        assert!(JobStatus::Success.is_success());
        assert!(!JobStatus::Timeout.is_success());
    }

    #[test]
    fn test_exit_log_format() {
        let log = format_exit_log("conan build .", 2, "out", "err");
        assert_eq!(
            log,
            "Command: conan build .\nReturn code: 2\n=== STDOUT ===\nout\n=== STDERR ===\nerr\n"
        );
    }

    #[test]
    fn test_exit_log_keeps_existing_newlines() {
        let log = format_exit_log("conan build .", 0, "[100%] Built target app\n", "warning: unused\n");
        assert_eq!(
            log,
            "Command: conan build .\nReturn code: 0\n=== STDOUT ===\n[100%] Built target app\n\
             === STDERR ===\nwarning: unused\n"
        );
        assert!(!log.contains("\n\n"));
    }

    #[tokio::test]
    async fn test_exit_zero_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let runner = JobRunner::new(Arc::new(FakeExecutor::succeeding()));

        let result = runner.run(&ctx, &invocation(), DEFAULT_JOB_TIMEOUT).await;
        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.log_file, ctx.log_file());

        let log = std::fs::read_to_string(ctx.log_file()).unwrap();
        assert!(log.starts_with("Command: conan build .\nReturn code: 0\n"));
    }

    #[tokio::test]
    async fn test_nonzero_is_failure_with_streams_logged() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let runner = JobRunner::new(Arc::new(FakeExecutor::new(|_| {
            Ok(ExecOutcome::Exited {
                code: 1,
                stdout: "compiling".to_string(),
                stderr: "undefined reference".to_string(),
            })
        })));

        let result = runner.run(&ctx, &invocation(), DEFAULT_JOB_TIMEOUT).await;
        assert_eq!(result.status, JobStatus::Failure);
        assert_eq!(result.exit_code, Some(1));

        let log = std::fs::read_to_string(ctx.log_file()).unwrap();
        assert!(log.contains("Return code: 1"));
        assert!(log.contains("compiling"));
        assert!(log.contains("undefined reference"));
    }

    #[tokio::test]
    async fn test_timeout_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let runner = JobRunner::new(Arc::new(FakeExecutor::new(|_| Ok(ExecOutcome::TimedOut))));

        let result = runner.run(&ctx, &invocation(), Duration::from_secs(5)).await;
        assert_eq!(result.status, JobStatus::Timeout);
        assert_eq!(result.exit_code, None);

        let log = std::fs::read_to_string(ctx.log_file()).unwrap();
        assert!(log.contains("TIMEOUT"));
        assert!(log.contains("5 seconds"));
    }

    #[tokio::test]
    async fn test_spawn_error_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let runner = JobRunner::new(Arc::new(FakeExecutor::new(|_| {
            Err(io::Error::new(io::ErrorKind::NotFound, "conan: not found"))
        })));

        let result = runner.run(&ctx, &invocation(), DEFAULT_JOB_TIMEOUT).await;
        assert_eq!(result.status, JobStatus::InternalError);
        assert!(result.detail.as_deref().unwrap().contains("conan: not found"));

        let log = std::fs::read_to_string(ctx.log_file()).unwrap();
        assert!(log.contains("ERROR: failed to run command"));
    }

    #[tokio::test]
    async fn test_install_logs_separately() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let runner = JobRunner::new(Arc::new(FakeExecutor::succeeding()));

        let result = runner.run_install(&ctx, &invocation(), DEFAULT_JOB_TIMEOUT).await;
        assert!(result.passed());
        assert_eq!(result.log_file, ctx.install_log_file());
        assert!(ctx.install_log_file().exists());
        assert!(!ctx.log_file().exists());
    }

    #[tokio::test]
    async fn test_rerun_overwrites_log() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());

        let failing = JobRunner::new(Arc::new(FakeExecutor::new(|_| {
            Ok(ExecOutcome::Exited {
                code: 3,
                stdout: "first run output".to_string(),
                stderr: String::new(),
            })
        })));
        failing.run(&ctx, &invocation(), DEFAULT_JOB_TIMEOUT).await;

        let passing = JobRunner::new(Arc::new(FakeExecutor::succeeding()));
        passing.run(&ctx, &invocation(), DEFAULT_JOB_TIMEOUT).await;

        let log = std::fs::read_to_string(ctx.log_file()).unwrap();
        assert!(log.contains("Return code: 0"));
        assert!(!log.contains("first run output"));
    }

    #[tokio::test]
    async fn test_unwritable_log_becomes_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file").unwrap();
        let ctx = ctx(&blocker);
        let runner = JobRunner::new(Arc::new(FakeExecutor::succeeding()));

        let result = runner.run(&ctx, &invocation(), DEFAULT_JOB_TIMEOUT).await;
        assert_eq!(result.status, JobStatus::InternalError);
        assert!(result.detail.unwrap().contains("failed to write log"));
    }
}
