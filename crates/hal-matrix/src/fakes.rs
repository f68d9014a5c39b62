//! In-memory test doubles (testing only)
//!
//! Provides `FakeExecutor`, a `CommandExecutor` that never spawns a
//! process, and `RecordingProgress`, a `ProgressSink` that keeps every
//! notification for later assertions.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::command::ToolInvocation;
use crate::orchestrator::ProgressSink;
use crate::runner::{CommandExecutor, ExecOutcome, JobResult, JobStatus};
use crate::summary::MatrixRunSummary;

// ---------------------------------------------------------------------------
// FakeExecutor
// ---------------------------------------------------------------------------

type Rule = dyn Fn(&ToolInvocation) -> io::Result<ExecOutcome> + Send + Sync;

/// Executor that answers every invocation from a rule closure.
///
/// Tracks every call and the peak number of concurrent calls. With a delay
/// longer than the caller's timeout it reports `TimedOut` after the timeout.
pub struct FakeExecutor {
    rule: Box<Rule>,
    delay: Duration,
    calls: Mutex<Vec<ToolInvocation>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeExecutor {
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&ToolInvocation) -> io::Result<ExecOutcome> + Send + Sync + 'static,
    {
        Self {
            rule: Box::new(rule),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Every invocation exits 0.
    pub fn succeeding() -> Self {
        Self::new(|_| Ok(exited(0)))
    }

    /// Invocations matching `predicate` exit 1; the rest exit 0.
    pub fn failing_when<P>(predicate: P) -> Self
    where
        P: Fn(&ToolInvocation) -> bool + Send + Sync + 'static,
    {
        Self::new(move |inv| Ok(exited(if predicate(inv) { 1 } else { 0 })))
    }

    /// Sleep for `delay` inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose subcommand (second argv element) is `subcommand`.
    pub fn calls_for(&self, subcommand: &str) -> Vec<ToolInvocation> {
        self.calls()
            .into_iter()
            .filter(|inv| inv.args().first().map(String::as_str) == Some(subcommand))
            .collect()
    }

    /// Highest number of calls that were in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn exited(code: i32) -> ExecOutcome {
    ExecOutcome::Exited {
        code,
        stdout: format!("fake stdout (exit {code})"),
        stderr: String::new(),
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        timeout: Duration,
    ) -> io::Result<ExecOutcome> {
        self.calls.lock().unwrap().push(invocation.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let outcome = if self.delay > timeout {
            tokio::time::sleep(timeout).await;
            Ok(ExecOutcome::TimedOut)
        } else {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.rule)(invocation)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

// ---------------------------------------------------------------------------
// RecordingProgress
// ---------------------------------------------------------------------------

/// One `job_finished` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub profile_name: String,
    pub status: JobStatus,
}

/// Progress sink that stores every notification.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    phases: Mutex<Vec<(String, usize)>>,
    installs: Mutex<Vec<ProgressEvent>>,
    jobs: Mutex<Vec<ProgressEvent>>,
    summary: Mutex<Option<MatrixRunSummary>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phases(&self) -> Vec<(String, usize)> {
        self.phases.lock().unwrap().clone()
    }

    pub fn installs(&self) -> Vec<ProgressEvent> {
        self.installs.lock().unwrap().clone()
    }

    pub fn jobs(&self) -> Vec<ProgressEvent> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn summary(&self) -> Option<MatrixRunSummary> {
        self.summary.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn phase_started(&self, phase: &str, total: usize) {
        self.phases.lock().unwrap().push((phase.to_string(), total));
    }

    fn install_finished(&self, index: usize, total: usize, result: &JobResult) {
        self.installs.lock().unwrap().push(ProgressEvent {
            completed: index,
            total,
            profile_name: result.profile_name.clone(),
            status: result.status,
        });
    }

    fn job_finished(&self, completed: usize, total: usize, result: &JobResult) {
        self.jobs.lock().unwrap().push(ProgressEvent {
            completed,
            total,
            profile_name: result.profile_name.clone(),
            status: result.status,
        });
    }

    fn run_finished(&self, summary: &MatrixRunSummary) {
        *self.summary.lock().unwrap() = Some(summary.clone());
    }
}
