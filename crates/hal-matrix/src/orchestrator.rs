//! Matrix run orchestration.
//!
//! A run goes through these steps:
//!
//! 1. check the project root for a build manifest
//! 2. generate (and filter) the profile matrix
//! 3. build mode only: materialize and install every profile, one at a time
//! 4. run one build/package job per profile on a bounded worker pool
//! 5. summarize, report, and map the outcome to an exit code
//!
//! The install phase is sequential because the build tool writes shared
//! files outside the profile directories while installing. A failed install
//! aborts the run unless `continue_on_error` is set. Jobs in the parallel
//! phase are isolated: a failure or timeout never cancels a sibling.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, instrument, warn};

use crate::command::{CommandBuilder, MatrixMode, DEFAULT_TOOL};
use crate::context::{materialize, BuildContext, LOG_FILE, MATRIX_DIR};
use crate::error::{MatrixError, MatrixResult};
use crate::profile::{generate, MatrixTable, ProfileFilter, ProfileSpec};
use crate::runner::{CommandExecutor, JobResult, JobRunner, DEFAULT_JOB_TIMEOUT};
use crate::summary::{MatrixRunSummary, ProgressTracker};

/// Exit code when the run aborted on a configuration or install error.
pub const EXIT_FATAL: i32 = 2;

/// Manifest files that mark a buildable project root.
pub const DEFAULT_MANIFESTS: [&str; 2] = ["conanfile.py", "conanfile.txt"];

/// JSON report file written into the matrix directory.
pub const REPORT_FILE: &str = "summary.json";

/// Settings for one matrix run.
#[derive(Debug, Clone)]
pub struct MatrixConfig {
    /// Project root containing the build manifest.
    pub root: PathBuf,
    pub mode: MatrixMode,
    /// Maximum concurrent jobs in the parallel phase.
    pub max_parallelism: usize,
    pub job_timeout: Duration,
    pub install_timeout: Duration,
    /// Build tool executable.
    pub tool: String,
    /// Record install failures instead of aborting the run.
    pub continue_on_error: bool,
    pub manifests: Vec<String>,
    pub filter: ProfileFilter,
    /// Write `build-matrix/summary.json` after the run.
    pub write_report: bool,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            mode: MatrixMode::Build,
            max_parallelism: default_parallelism(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            install_timeout: DEFAULT_JOB_TIMEOUT,
            tool: DEFAULT_TOOL.to_string(),
            continue_on_error: false,
            manifests: DEFAULT_MANIFESTS.iter().map(|m| m.to_string()).collect(),
            filter: ProfileFilter::default(),
            write_report: true,
        }
    }
}

/// Host logical CPU count.
pub fn default_parallelism() -> usize {
    num_cpus::get().max(1)
}

impl MatrixConfig {
    /// Config for a `build` or `package` command.
    ///
    /// `package` requires a version; `build` ignores it.
    pub fn for_command(
        root: impl Into<PathBuf>,
        command: &str,
        version: Option<String>,
        max_parallelism: Option<usize>,
    ) -> MatrixResult<Self> {
        let mode = match (command, version) {
            ("build", _) => MatrixMode::Build,
            ("package", Some(version)) => MatrixMode::Package { version },
            ("package", None) => {
                return Err(MatrixError::InvalidConfig(
                    "package mode requires a version".to_string(),
                ))
            }
            (other, _) => {
                return Err(MatrixError::InvalidConfig(format!(
                    "unknown matrix command '{other}' (expected build or package)"
                )))
            }
        };

        let defaults = Self::default();
        Ok(Self {
            root: root.into(),
            mode,
            max_parallelism: max_parallelism.unwrap_or(defaults.max_parallelism),
            ..defaults
        })
    }

    pub fn validate(&self) -> MatrixResult<()> {
        if self.max_parallelism == 0 {
            return Err(MatrixError::InvalidConfig(
                "max parallelism must be at least 1".to_string(),
            ));
        }
        if self.job_timeout.is_zero() || self.install_timeout.is_zero() {
            return Err(MatrixError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.tool.trim().is_empty() {
            return Err(MatrixError::InvalidConfig("build tool is empty".to_string()));
        }
        if let MatrixMode::Package { version } = &self.mode {
            if version.trim().is_empty() {
                return Err(MatrixError::InvalidConfig(
                    "package version is empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// `<root>/build-matrix`
    pub fn matrix_dir(&self) -> PathBuf {
        self.root.join(MATRIX_DIR)
    }
}

/// Receives progress notifications during a run.
pub trait ProgressSink: Send + Sync {
    /// A phase is starting over `total` profiles.
    fn phase_started(&self, _phase: &str, _total: usize) {}

    /// The install step for profile `index` (1-based) finished.
    fn install_finished(&self, _index: usize, _total: usize, _result: &JobResult) {}

    /// A profile reached its final state; `completed` is strictly increasing.
    fn job_finished(&self, completed: usize, total: usize, result: &JobResult);

    /// The run completed and produced `summary`.
    fn run_finished(&self, _summary: &MatrixRunSummary) {}
}

/// Prints progress lines and the final summary to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn phase_started(&self, phase: &str, total: usize) {
        println!("==> {phase} ({total} profiles)");
    }

    fn install_finished(&self, index: usize, total: usize, result: &JobResult) {
        println!(
            "  install [{index}/{total}] {} ({})",
            result.profile_name,
            result.status.tag()
        );
    }

    fn job_finished(&self, completed: usize, total: usize, result: &JobResult) {
        println!("{}", progress_line(completed, total, result));
    }

    fn run_finished(&self, summary: &MatrixRunSummary) {
        println!();
        print!("{}", summary.render());
    }
}

/// `[completed/total] name tag`
pub fn progress_line(completed: usize, total: usize, result: &JobResult) -> String {
    format!(
        "[{completed}/{total}] {} {}",
        result.profile_name,
        result.status.tag()
    )
}

/// Work handed to a worker.
enum JobInput {
    /// Build mode: already materialized and installed.
    Ready(BuildContext),
    /// Package mode: materialized by the worker.
    Pending(ProfileSpec),
}

impl JobInput {
    fn profile_name(&self) -> &str {
        match self {
            JobInput::Ready(ctx) => ctx.profile().name(),
            JobInput::Pending(profile) => profile.name(),
        }
    }
}

/// Drives a matrix run over a profile table.
pub struct MatrixOrchestrator {
    config: MatrixConfig,
    table: MatrixTable,
    runner: JobRunner,
    progress: Arc<dyn ProgressSink>,
}

impl MatrixOrchestrator {
    /// Orchestrator that spawns real processes and prints to the console.
    pub fn new(config: MatrixConfig, table: MatrixTable) -> Self {
        Self {
            config,
            table,
            runner: JobRunner::process(),
            progress: Arc::new(ConsoleProgress),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.runner = JobRunner::new(executor);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    /// The profiles this run would process, after filtering.
    pub fn profiles(&self) -> MatrixResult<Vec<ProfileSpec>> {
        self.config.filter.apply(generate(&self.table)?)
    }

    /// Find the project manifest under the root.
    pub fn check_manifest(&self) -> MatrixResult<PathBuf> {
        self.config
            .manifests
            .iter()
            .map(|name| self.config.root.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| MatrixError::MissingManifest {
                root: self.config.root.clone(),
                expected: self.config.manifests.clone(),
            })
    }

    /// Run the matrix and return its summary.
    ///
    /// Returns an error only for configuration problems and install
    /// failures; per-profile build outcomes live in the summary.
    #[instrument(skip(self), fields(mode = %self.config.mode, root = %self.config.root.display()))]
    pub async fn run(&self) -> MatrixResult<MatrixRunSummary> {
        let started_at = Utc::now();
        self.config.validate()?;
        let manifest = self.check_manifest()?;
        let profiles = self.profiles()?;

        info!(
            profiles = profiles.len(),
            jobs = self.config.max_parallelism,
            manifest = %manifest.display(),
            "Starting build matrix"
        );

        let matrix_dir = self.config.matrix_dir();
        tokio::fs::create_dir_all(&matrix_dir)
            .await
            .map_err(|e| MatrixError::io(&matrix_dir, e))?;

        let tracker = Arc::new(ProgressTracker::new(
            profiles.iter().map(|p| p.name().to_string()),
        ));
        let builder = CommandBuilder::new(&self.config.tool, &self.config.root);

        let inputs: Vec<JobInput> = if self.config.mode.has_install_phase() {
            self.install_phase(&profiles, &matrix_dir, &builder, &tracker)
                .await?
                .into_iter()
                .map(JobInput::Ready)
                .collect()
        } else {
            profiles.into_iter().map(JobInput::Pending).collect()
        };

        self.parallel_phase(inputs, &matrix_dir, &builder, &tracker)
            .await;

        let summary = tracker.summarize(self.config.mode.name(), started_at);
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Build matrix finished"
        );

        if self.config.write_report {
            let report = matrix_dir.join(REPORT_FILE);
            if let Err(e) = summary.write_report(&report).await {
                warn!(error = %e, "Failed to write matrix report");
            }
        }

        self.progress.run_finished(&summary);
        Ok(summary)
    }

    /// Run the matrix and map the outcome to a process exit code.
    pub async fn run_to_exit_code(&self) -> i32 {
        match self.run().await {
            Ok(summary) => summary.exit_code(),
            Err(e) => {
                error!(error = %e, "Build matrix aborted");
                EXIT_FATAL
            }
        }
    }

    /// Materialize and install each profile in order on the calling task.
    async fn install_phase(
        &self,
        profiles: &[ProfileSpec],
        matrix_dir: &Path,
        builder: &CommandBuilder,
        tracker: &ProgressTracker,
    ) -> MatrixResult<Vec<BuildContext>> {
        let total = profiles.len();
        self.progress.phase_started("install", total);
        info!(profiles = total, "Installing dependencies sequentially");

        let mut ready = Vec::with_capacity(total);
        for (i, profile) in profiles.iter().enumerate() {
            let result = match materialize(profile, matrix_dir).await {
                Ok(ctx) => {
                    let invocation = builder.install(&ctx);
                    let result = self
                        .runner
                        .run_install(&ctx, &invocation, self.config.install_timeout)
                        .await;
                    if result.passed() {
                        self.progress.install_finished(i + 1, total, &result);
                        ready.push(ctx);
                        continue;
                    }
                    result
                }
                Err(e) if self.config.continue_on_error => JobResult::internal_error(
                    profile.name(),
                    BuildContext::new(profile.clone(), matrix_dir).install_log_file(),
                    e.to_string(),
                ),
                Err(e) => return Err(e),
            };

            self.progress.install_finished(i + 1, total, &result);
            if !self.config.continue_on_error {
                error!(profile = %profile.name(), status = result.status.tag(), "Install failed; aborting");
                return Err(MatrixError::InstallFailed {
                    profile: result.profile_name,
                    status: result.status.tag().to_string(),
                    log: result.log_file,
                });
            }

            warn!(profile = %profile.name(), status = result.status.tag(), "Install failed; skipping profile");
            let progress = Arc::clone(&self.progress);
            tracker.record(result, |done, total, r| progress.job_finished(done, total, r));
        }

        Ok(ready)
    }

    /// Run one job per input with at most `max_parallelism` in flight.
    async fn parallel_phase(
        &self,
        inputs: Vec<JobInput>,
        matrix_dir: &Path,
        builder: &CommandBuilder,
        tracker: &Arc<ProgressTracker>,
    ) {
        self.progress.phase_started(self.config.mode.name(), inputs.len());
        info!(
            jobs = inputs.len(),
            parallelism = self.config.max_parallelism,
            "Dispatching jobs"
        );

        let mut join_set = JoinSet::new();
        let mut pending = HashSet::new();

        for input in inputs {
            // Spawn in generation order, waiting for a free slot first.
            while join_set.len() >= self.config.max_parallelism {
                reap(join_set.join_next().await, &mut pending);
            }

            pending.insert(input.profile_name().to_string());
            let runner = self.runner.clone();
            let builder = builder.clone();
            let mode = self.config.mode.clone();
            let timeout = self.config.job_timeout;
            let matrix_dir = matrix_dir.to_path_buf();
            let tracker = Arc::clone(tracker);
            let progress = Arc::clone(&self.progress);

            join_set.spawn(async move {
                let result = match input {
                    JobInput::Ready(ctx) => {
                        let invocation = builder.for_mode(&mode, &ctx);
                        runner.run(&ctx, &invocation, timeout).await
                    }
                    JobInput::Pending(profile) => match materialize(&profile, &matrix_dir).await {
                        Ok(ctx) => {
                            let invocation = builder.for_mode(&mode, &ctx);
                            runner.run(&ctx, &invocation, timeout).await
                        }
                        Err(e) => JobResult::internal_error(
                            profile.name(),
                            BuildContext::new(profile.clone(), &matrix_dir).log_file(),
                            e.to_string(),
                        ),
                    },
                };

                if result.passed() {
                    info!(profile = %result.profile_name, duration_ms = result.duration_ms, "Job succeeded");
                } else {
                    warn!(
                        profile = %result.profile_name,
                        status = result.status.tag(),
                        log = %result.log_file.display(),
                        "Job did not succeed"
                    );
                }

                let name = result.profile_name.clone();
                tracker.record(result, |done, total, r| progress.job_finished(done, total, r));
                name
            });
        }

        while let Some(joined) = join_set.join_next().await {
            reap(Some(joined), &mut pending);
        }

        // A worker that panicked never recorded its result.
        let mut lost: Vec<String> = pending.into_iter().collect();
        lost.sort();
        for name in lost {
            if tracker.has_result(&name) {
                continue;
            }
            let log = matrix_dir.join(&name).join(LOG_FILE);
            let result = JobResult::internal_error(&name, log, "worker task failed");
            let progress = Arc::clone(&self.progress);
            tracker.record(result, |done, total, r| progress.job_finished(done, total, r));
        }
    }
}

/// Clear a finished worker from `pending`; panicked workers stay listed.
fn reap(joined: Option<Result<String, JoinError>>, pending: &mut HashSet<String>) {
    match joined {
        Some(Ok(name)) => {
            pending.remove(&name);
        }
        Some(Err(e)) => error!(error = %e, "Worker task failed"),
        None => {}
    }
}
