//! External build tool invocations.
//!
//! Each phase of a matrix run maps to one Conan subcommand:
//!
//! - install: `conan install <root> -pr:h <profile> --build=missing -of <dir>`
//! - build:   `conan build <root> -pr:h <profile> -of <dir>`
//! - package: `conan create <root> -pr:h <profile> --version <v> --build=missing -of <dir>`

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::BuildContext;

/// Default build tool executable.
pub const DEFAULT_TOOL: &str = "conan";

/// What the parallel phase produces for each profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum MatrixMode {
    /// Install dependencies sequentially, then build every profile.
    Build,
    /// Create a package for every profile at the given version.
    Package { version: String },
}

impl MatrixMode {
    pub fn name(&self) -> &'static str {
        match self {
            MatrixMode::Build => "build",
            MatrixMode::Package { .. } => "package",
        }
    }

    /// Whether the sequential install pre-phase runs in this mode.
    pub fn has_install_phase(&self) -> bool {
        matches!(self, MatrixMode::Build)
    }
}

impl fmt::Display for MatrixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixMode::Build => f.write_str("build"),
            MatrixMode::Package { version } => write!(f, "package {version}"),
        }
    }
}

/// A fully built argv for one external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    argv: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ToolInvocation {
    /// Wrap an argv. The first element is the executable.
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            working_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or(&[])
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// The command line as recorded in job logs.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Builds tool invocations for a project root.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    tool: String,
    target: PathBuf,
}

impl CommandBuilder {
    pub fn new(tool: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            target: target.into(),
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Dependency install for the sequential pre-phase.
    pub fn install(&self, ctx: &BuildContext) -> ToolInvocation {
        let mut argv = self.base("install", ctx);
        argv.push("--build=missing".to_string());
        self.finish(argv, ctx)
    }

    /// Build for the parallel phase.
    pub fn build(&self, ctx: &BuildContext) -> ToolInvocation {
        let argv = self.base("build", ctx);
        self.finish(argv, ctx)
    }

    /// Package creation for the parallel phase.
    pub fn package(&self, ctx: &BuildContext, version: &str) -> ToolInvocation {
        let mut argv = self.base("create", ctx);
        argv.push("--version".to_string());
        argv.push(version.to_string());
        argv.push("--build=missing".to_string());
        self.finish(argv, ctx)
    }

    /// The parallel-phase invocation for `mode`.
    pub fn for_mode(&self, mode: &MatrixMode, ctx: &BuildContext) -> ToolInvocation {
        match mode {
            MatrixMode::Build => self.build(ctx),
            MatrixMode::Package { version } => self.package(ctx, version),
        }
    }

    fn base(&self, subcommand: &str, ctx: &BuildContext) -> Vec<String> {
        vec![
            self.tool.clone(),
            subcommand.to_string(),
            self.target.display().to_string(),
            "-pr:h".to_string(),
            ctx.profile_file().display().to_string(),
        ]
    }

    fn finish(&self, mut argv: Vec<String>, ctx: &BuildContext) -> ToolInvocation {
        argv.push("-of".to_string());
        argv.push(ctx.build_dir().display().to_string());
        ToolInvocation::new(argv).in_dir(&self.target)
    }
}
