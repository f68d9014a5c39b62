//! Per-profile build directories.
//!
//! Layout under the project root:
//!
//! ```text
//! <root>/build-matrix/<profile>/profile       rendered profile text
//! <root>/build-matrix/<profile>/log           build or package output
//! <root>/build-matrix/<profile>/install.log   pre-phase install output
//! ```

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{MatrixError, MatrixResult};
use crate::profile::ProfileSpec;

/// Directory under the project root holding every profile directory.
pub const MATRIX_DIR: &str = "build-matrix";
/// Rendered profile file name inside a profile directory.
pub const PROFILE_FILE: &str = "profile";
/// Build/package log file name inside a profile directory.
pub const LOG_FILE: &str = "log";
/// Install log file name inside a profile directory.
pub const INSTALL_LOG_FILE: &str = "install.log";

/// Paths owned by one profile for the lifetime of a run.
///
/// No two contexts in a run share a directory, so jobs never contend on
/// these files.
#[derive(Debug, Clone)]
pub struct BuildContext {
    profile: ProfileSpec,
    build_dir: PathBuf,
}

impl BuildContext {
    /// Compute the paths for `profile` under `matrix_root` without touching disk.
    pub fn new(profile: ProfileSpec, matrix_root: &Path) -> Self {
        let build_dir = matrix_root.join(profile.name());
        Self { profile, build_dir }
    }

    pub fn profile(&self) -> &ProfileSpec {
        &self.profile
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn profile_file(&self) -> PathBuf {
        self.build_dir.join(PROFILE_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.build_dir.join(LOG_FILE)
    }

    pub fn install_log_file(&self) -> PathBuf {
        self.build_dir.join(INSTALL_LOG_FILE)
    }
}

/// Create the profile directory and write the rendered profile into it.
///
/// Safe to repeat: an existing directory is reused and the profile file is
/// overwritten with the current rendering.
pub async fn materialize(profile: &ProfileSpec, matrix_root: &Path) -> MatrixResult<BuildContext> {
    let ctx = BuildContext::new(profile.clone(), matrix_root);

    tokio::fs::create_dir_all(ctx.build_dir())
        .await
        .map_err(|e| MatrixError::io(ctx.build_dir(), e))?;

    let profile_file = ctx.profile_file();
    tokio::fs::write(&profile_file, profile.rendered_text())
        .await
        .map_err(|e| MatrixError::io(&profile_file, e))?;

    debug!(profile = %profile.name(), path = %profile_file.display(), "Materialized profile");
    Ok(ctx)
}
