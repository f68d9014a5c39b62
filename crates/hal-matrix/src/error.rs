//! Error types for matrix generation and orchestration.
//!
//! Only configuration problems and pre-phase install failures are errors.
//! Per-job build outcomes are reported as [`crate::runner::JobResult`] values.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a matrix run before it completes.
#[derive(Debug, Error)]
pub enum MatrixError {
    /// The project root has none of the recognised build manifests.
    #[error("no build manifest found in {root} (expected one of: {})", expected.join(", "))]
    MissingManifest { root: PathBuf, expected: Vec<String> },

    /// A version string in a profile table could not be parsed.
    #[error("invalid toolchain version '{value}': {reason}")]
    InvalidVersion { value: String, reason: String },

    /// A profile table declares the same entry twice.
    #[error("duplicate {table} entry: {name}")]
    DuplicateEntry { table: &'static str, name: String },

    /// A profile filter named a profile the generator does not produce.
    #[error("unknown profile: {name}")]
    UnknownProfile { name: String },

    /// Generation plus filtering left nothing to build.
    #[error("profile matrix is empty")]
    EmptyMatrix,

    /// The sequential install step failed for a profile.
    #[error("dependency install failed for profile {profile} ({status}); see {}", log.display())]
    InstallFailed {
        profile: String,
        status: String,
        log: PathBuf,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem error outside of a job boundary.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The JSON run report could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MatrixError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MatrixError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error was raised before any profile work started.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MatrixError::MissingManifest { .. }
                | MatrixError::InvalidVersion { .. }
                | MatrixError::DuplicateEntry { .. }
                | MatrixError::UnknownProfile { .. }
                | MatrixError::EmptyMatrix
                | MatrixError::InvalidConfig(_)
        )
    }
}

/// Convenience result alias.
pub type MatrixResult<T> = std::result::Result<T, MatrixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_manifest_lists_expected_files() {
        let err = MatrixError::MissingManifest {
            root: PathBuf::from("/work/robot"),
            expected: vec!["conanfile.py".to_string(), "conanfile.txt".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("/work/robot"));
        assert!(msg.contains("conanfile.py, conanfile.txt"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_install_failed_names_profile_and_log() {
        let err = MatrixError::InstallFailed {
            profile: "cortex-m4-gcc-12.3-Debug".to_string(),
            status: "failure".to_string(),
            log: PathBuf::from("build-matrix/cortex-m4-gcc-12.3-Debug/install.log"),
        };
        let msg = err.to_string();
        assert!(msg.contains("cortex-m4-gcc-12.3-Debug"));
        assert!(msg.contains("install.log"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_invalid_version_displays_value() {
        let err = MatrixError::InvalidVersion {
            value: "13.x".to_string(),
            reason: "component 'x' is not a number".to_string(),
        };
        assert!(err.to_string().contains("13.x"));
        assert!(err.is_configuration());
    }
}
