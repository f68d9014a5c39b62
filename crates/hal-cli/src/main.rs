//! hal - build matrices for libhal projects
//!
//! ## Commands
//!
//! - `build-matrix`: install and build a project for every profile
//! - `package-matrix`: create a versioned package for every profile
//! - `profiles list`: print every generated profile name
//! - `profiles show`: print one profile's rendered text

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, Level};

use hal_matrix::{
    generate, BuildType, MatrixConfig, MatrixMode, MatrixOrchestrator, MatrixTable,
    ProfileFilter, ProfileSpec, EXIT_FATAL,
};

#[derive(Parser)]
#[command(name = "hal")]
#[command(author = "libhal contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build and package libhal projects across a profile matrix", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install dependencies and build the project for every profile
    BuildMatrix {
        #[command(flatten)]
        matrix: MatrixArgs,
    },

    /// Create a package for every profile
    PackageMatrix {
        /// Package version passed to the build tool
        #[arg(long)]
        version: String,

        #[command(flatten)]
        matrix: MatrixArgs,
    },

    /// Inspect the generated profiles
    Profiles {
        #[command(subcommand)]
        action: ProfilesAction,
    },
}

#[derive(Subcommand)]
enum ProfilesAction {
    /// List every generated profile name
    List {
        /// Only list these build types (comma separated)
        #[arg(long, value_delimiter = ',')]
        configurations: Vec<BuildType>,
    },

    /// Print the rendered text of one profile
    Show {
        /// Profile name, e.g. cortex-m4f-gcc-13.2-Release
        name: String,
    },
}

/// Options shared by `build-matrix` and `package-matrix`.
#[derive(Args, Debug)]
struct MatrixArgs {
    /// Project root containing conanfile.py or conanfile.txt
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Maximum concurrent jobs (default: logical CPU count)
    #[arg(short, long, env = "HAL_MATRIX_JOBS")]
    jobs: Option<usize>,

    /// Per-job timeout in seconds
    #[arg(long, env = "HAL_MATRIX_TIMEOUT", default_value = "300")]
    timeout: u64,

    /// Per-profile install timeout in seconds
    #[arg(long, env = "HAL_MATRIX_INSTALL_TIMEOUT", default_value = "300")]
    install_timeout: u64,

    /// Build tool executable
    #[arg(long, env = "HAL_MATRIX_TOOL", default_value = "conan")]
    tool: String,

    /// Record install failures and keep going instead of aborting
    #[arg(long)]
    continue_on_error: bool,

    /// Only run these profiles (comma separated)
    #[arg(long, value_delimiter = ',')]
    profiles: Vec<String>,

    /// Only run these build types (comma separated)
    #[arg(long, value_delimiter = ',')]
    configurations: Vec<BuildType>,

    /// Skip writing build-matrix/summary.json
    #[arg(long)]
    no_report: bool,
}

impl MatrixArgs {
    fn into_config(self, mode: MatrixMode) -> MatrixConfig {
        let defaults = MatrixConfig::default();
        MatrixConfig {
            root: self.path,
            mode,
            max_parallelism: self.jobs.unwrap_or(defaults.max_parallelism),
            job_timeout: Duration::from_secs(self.timeout),
            install_timeout: Duration::from_secs(self.install_timeout),
            tool: self.tool,
            continue_on_error: self.continue_on_error,
            filter: ProfileFilter {
                names: self.profiles,
                build_types: self.configurations,
            },
            write_report: !self.no_report,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    hal_matrix::init_tracing(cli.json, level);

    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(command: Commands) -> Result<i32> {
    match command {
        Commands::BuildMatrix { matrix } => cmd_matrix(matrix.into_config(MatrixMode::Build)).await,
        Commands::PackageMatrix { version, matrix } => {
            cmd_matrix(matrix.into_config(MatrixMode::Package { version })).await
        }
        Commands::Profiles { action } => match action {
            ProfilesAction::List { configurations } => cmd_profiles_list(configurations),
            ProfilesAction::Show { name } => cmd_profiles_show(&name),
        },
    }
}

fn libhal_profiles() -> Result<Vec<ProfileSpec>> {
    let table = MatrixTable::libhal().context("Invalid built-in profile table")?;
    generate(&table).context("Failed to generate profile matrix")
}

/// Run a build or package matrix and return its exit code
async fn cmd_matrix(config: MatrixConfig) -> Result<i32> {
    debug!(?config, "Matrix configuration");
    let table = MatrixTable::libhal().context("Invalid built-in profile table")?;
    let mode = config.mode.name();

    let summary = MatrixOrchestrator::new(config, table)
        .run()
        .await
        .with_context(|| format!("{mode} matrix aborted"))?;

    Ok(summary.exit_code())
}

/// List generated profile names
fn cmd_profiles_list(configurations: Vec<BuildType>) -> Result<i32> {
    let filter = ProfileFilter {
        names: Vec::new(),
        build_types: configurations,
    };
    let profiles = filter.apply(libhal_profiles()?)?;
    print!("{}", format_profile_list(&profiles));
    Ok(0)
}

/// Print one profile's rendered text
fn cmd_profiles_show(name: &str) -> Result<i32> {
    let profiles = libhal_profiles()?;
    let profile = profiles
        .iter()
        .find(|p| p.name() == name)
        .with_context(|| format!("Unknown profile: {name} (see 'hal profiles list')"))?;
    print!("{}", profile.rendered_text());
    Ok(0)
}

fn format_profile_list(profiles: &[ProfileSpec]) -> String {
    let mut out = String::new();
    for profile in profiles {
        out.push_str(profile.name());
        out.push('\n');
    }
    out.push_str(&format!("\n{} profiles\n", profiles.len()));
    out
}
