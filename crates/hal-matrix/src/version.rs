//! Dotted-numeric toolchain versions.
//!
//! Versions compare component-wise as integers with absent trailing
//! components treated as zero, so `13` and `13.0` are equal and
//! `12.3 < 12.30`.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MatrixError, MatrixResult};

/// A parsed toolchain version such as `13.2` or `14.2.1`.
///
/// The original spelling is preserved for display and profile names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolchainVersion {
    raw: String,
    components: Vec<u64>,
}

impl ToolchainVersion {
    /// Parse a version string, rejecting empty or non-numeric components.
    pub fn parse(value: &str) -> MatrixResult<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(MatrixError::InvalidVersion {
                value: value.to_string(),
                reason: "version is empty".to_string(),
            });
        }

        let components = trimmed
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(MatrixError::InvalidVersion {
                        value: value.to_string(),
                        reason: format!("component '{part}' is not a number"),
                    });
                }
                part.parse::<u64>().map_err(|e| MatrixError::InvalidVersion {
                    value: value.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<MatrixResult<Vec<u64>>>()?;

        Ok(Self {
            raw: trimmed.to_string(),
            components,
        })
    }

    /// The version as written in the profile table.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Components with trailing zeros removed; equal versions share this form.
    fn normalized(&self) -> &[u64] {
        let len = self
            .components
            .iter()
            .rposition(|c| *c != 0)
            .map_or(0, |i| i + 1);
        &self.components[..len]
    }
}

impl Ord for ToolchainVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                decided => return decided,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for ToolchainVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ToolchainVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ToolchainVersion {}

impl Hash for ToolchainVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for ToolchainVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ToolchainVersion {
    type Err = MatrixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ToolchainVersion {
    type Error = MatrixError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ToolchainVersion> for String {
    fn from(version: ToolchainVersion) -> Self {
        version.raw
    }
}
