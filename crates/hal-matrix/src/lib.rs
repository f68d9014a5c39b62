//! hal-matrix - build matrices for libhal projects
//!
//! Expands a table of compilers and ARM architectures into Conan profiles
//! and runs the build tool over every profile:
//! - Generates the (architecture x compiler version x build type) matrix
//! - Materializes one isolated directory per profile
//! - Installs dependencies sequentially, then builds or packages in parallel
//! - Captures a log per job and summarizes failures with their log paths

pub mod command;
pub mod context;
pub mod error;
pub mod fakes;
pub mod orchestrator;
pub mod profile;
pub mod runner;
pub mod summary;
pub mod telemetry;
pub mod version;

// Re-export key types
pub use command::{CommandBuilder, MatrixMode, ToolInvocation};
pub use context::{materialize, BuildContext};
pub use error::{MatrixError, MatrixResult};
pub use orchestrator::{
    default_parallelism, ConsoleProgress, MatrixConfig, MatrixOrchestrator, ProgressSink,
    EXIT_FATAL,
};
pub use profile::{generate, Architecture, BuildType, Compiler, MatrixTable, ProfileFilter, ProfileSpec};
pub use runner::{
    CommandExecutor, ExecOutcome, JobResult, JobRunner, JobStatus, ProcessExecutor,
    DEFAULT_JOB_TIMEOUT,
};
pub use summary::{MatrixRunSummary, ProgressTracker};
pub use telemetry::init_tracing;
pub use version::ToolchainVersion;
