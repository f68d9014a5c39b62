//! Build profile tables and matrix generation.
//!
//! A [`MatrixTable`] lists the compilers (each with its supported versions)
//! and the target architectures (each with an optional minimum compiler
//! version). [`generate`] expands the table into the full cross-product of
//! [`ProfileSpec`]s, skipping architectures the compiler version is too old
//! for.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MatrixError, MatrixResult};
use crate::version::ToolchainVersion;

/// CMake-style build configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BuildType {
    Debug,
    Release,
    MinSizeRel,
}

impl BuildType {
    /// Every build type, in generation order.
    pub const ALL: [BuildType; 3] = [BuildType::Debug, BuildType::Release, BuildType::MinSizeRel];

    /// Name as it appears in profile names and `build_type=` settings.
    pub fn name(&self) -> &'static str {
        match self {
            BuildType::Debug => "Debug",
            BuildType::Release => "Release",
            BuildType::MinSizeRel => "MinSizeRel",
        }
    }
}

impl fmt::Display for BuildType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BuildType {
    type Err = MatrixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildType::ALL
            .into_iter()
            .find(|bt| bt.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                MatrixError::InvalidConfig(format!(
                    "unknown build type '{s}' (expected Debug, Release or MinSizeRel)"
                ))
            })
    }
}

/// A target architecture and the oldest compiler version that supports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Architecture {
    pub name: String,
    pub minimum_compiler_version: Option<ToolchainVersion>,
}

impl Architecture {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            minimum_compiler_version: None,
        }
    }

    /// Require at least `version` of the compiler for this architecture.
    pub fn with_minimum(mut self, version: ToolchainVersion) -> Self {
        self.minimum_compiler_version = Some(version);
        self
    }

    /// Whether `version` satisfies this architecture's minimum.
    pub fn supports(&self, version: &ToolchainVersion) -> bool {
        match &self.minimum_compiler_version {
            Some(minimum) => version >= minimum,
            None => true,
        }
    }
}

/// A compiler family and the versions to build with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Compiler {
    pub name: String,
    pub versions: Vec<ToolchainVersion>,
    /// Conan package providing the toolchain, added as a tool requirement.
    pub toolchain_package: Option<String>,
}

impl Compiler {
    pub fn new(name: impl Into<String>, versions: Vec<ToolchainVersion>) -> Self {
        Self {
            name: name.into(),
            versions,
            toolchain_package: None,
        }
    }

    pub fn with_toolchain_package(mut self, package: impl Into<String>) -> Self {
        self.toolchain_package = Some(package.into());
        self
    }
}

/// The compiler and architecture tables a matrix is generated from.
///
/// Construction rejects duplicate compilers, duplicate versions within a
/// compiler, and duplicate architectures. Deserialization goes through the
/// same checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawMatrixTable")]
pub struct MatrixTable {
    compilers: Vec<Compiler>,
    architectures: Vec<Architecture>,
}

impl MatrixTable {
    pub fn new(compilers: Vec<Compiler>, architectures: Vec<Architecture>) -> MatrixResult<Self> {
        let mut seen = HashSet::new();
        for compiler in &compilers {
            if !seen.insert(compiler.name.as_str()) {
                return Err(MatrixError::DuplicateEntry {
                    table: "compiler",
                    name: compiler.name.clone(),
                });
            }
            let mut versions = HashSet::new();
            for version in &compiler.versions {
                if !versions.insert(version) {
                    return Err(MatrixError::DuplicateEntry {
                        table: "compiler version",
                        name: format!("{} {}", compiler.name, version),
                    });
                }
            }
        }

        let mut seen = HashSet::new();
        for arch in &architectures {
            if !seen.insert(arch.name.as_str()) {
                return Err(MatrixError::DuplicateEntry {
                    table: "architecture",
                    name: arch.name.clone(),
                });
            }
        }

        Ok(Self {
            compilers,
            architectures,
        })
    }

    /// Build a table from plain strings, parsing every version up front.
    ///
    /// `compilers` is `(name, toolchain package, versions)`; `architectures`
    /// is `(name, minimum compiler version)`.
    pub fn from_strings(
        compilers: &[(&str, Option<&str>, &[&str])],
        architectures: &[(&str, Option<&str>)],
    ) -> MatrixResult<Self> {
        let compilers = compilers
            .iter()
            .map(|(name, package, versions)| {
                let versions = versions
                    .iter()
                    .map(|v| ToolchainVersion::parse(v))
                    .collect::<MatrixResult<Vec<_>>>()?;
                let compiler = Compiler::new(*name, versions);
                Ok(match package {
                    Some(package) => compiler.with_toolchain_package(*package),
                    None => compiler,
                })
            })
            .collect::<MatrixResult<Vec<_>>>()?;

        let architectures = architectures
            .iter()
            .map(|(name, minimum)| {
                let arch = Architecture::new(*name);
                Ok(match minimum {
                    Some(minimum) => arch.with_minimum(ToolchainVersion::parse(minimum)?),
                    None => arch,
                })
            })
            .collect::<MatrixResult<Vec<_>>>()?;

        Self::new(compilers, architectures)
    }

    /// The ARM Cortex-M matrix built by libhal libraries.
    pub fn libhal() -> MatrixResult<Self> {
        Self::from_strings(
            &[(
                "gcc",
                Some("arm-gnu-toolchain"),
                &["12.3", "13.2", "13.3", "14.2"],
            )],
            &[
                ("cortex-m0", None),
                ("cortex-m0plus", None),
                ("cortex-m1", None),
                ("cortex-m3", None),
                ("cortex-m4", None),
                ("cortex-m4f", None),
                ("cortex-m7", None),
                ("cortex-m7f", None),
                ("cortex-m7d", None),
                ("cortex-m23", None),
                ("cortex-m33", None),
                ("cortex-m33f", None),
                ("cortex-m35pf", None),
                ("cortex-m55", Some("13.2")),
                ("cortex-m85", Some("13.2")),
            ],
        )
    }

    pub fn compilers(&self) -> &[Compiler] {
        &self.compilers
    }

    pub fn architectures(&self) -> &[Architecture] {
        &self.architectures
    }
}

#[derive(Deserialize)]
struct RawMatrixTable {
    compilers: Vec<Compiler>,
    architectures: Vec<Architecture>,
}

impl TryFrom<RawMatrixTable> for MatrixTable {
    type Error = MatrixError;

    fn try_from(raw: RawMatrixTable) -> MatrixResult<Self> {
        Self::new(raw.compilers, raw.architectures)
    }
}

/// One fully specified build configuration.
///
/// `name` and `rendered_text` are derived from the other fields when the
/// profile is constructed and cannot be changed independently. Profiles
/// only come from [`ProfileSpec::new`]; they serialize but never deserialize.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProfileSpec {
    name: String,
    architecture: String,
    compiler: String,
    compiler_version: ToolchainVersion,
    build_type: BuildType,
    minimum_compiler_version: Option<ToolchainVersion>,
    toolchain_package: Option<String>,
    rendered_text: String,
}

impl ProfileSpec {
    pub fn new(
        architecture: &Architecture,
        compiler: &Compiler,
        compiler_version: &ToolchainVersion,
        build_type: BuildType,
    ) -> Self {
        let name = format!(
            "{}-{}-{}-{}",
            architecture.name, compiler.name, compiler_version, build_type
        );
        let rendered_text = render(
            &architecture.name,
            &compiler.name,
            compiler_version,
            build_type,
            compiler.toolchain_package.as_deref(),
        );

        Self {
            name,
            architecture: architecture.name.clone(),
            compiler: compiler.name.clone(),
            compiler_version: compiler_version.clone(),
            build_type,
            minimum_compiler_version: architecture.minimum_compiler_version.clone(),
            toolchain_package: compiler.toolchain_package.clone(),
            rendered_text,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    pub fn compiler_version(&self) -> &ToolchainVersion {
        &self.compiler_version
    }

    pub fn build_type(&self) -> BuildType {
        self.build_type
    }

    pub fn minimum_compiler_version(&self) -> Option<&ToolchainVersion> {
        self.minimum_compiler_version.as_ref()
    }

    /// Conan profile text written to disk for this configuration.
    pub fn rendered_text(&self) -> &str {
        &self.rendered_text
    }
}

fn render(
    architecture: &str,
    compiler: &str,
    version: &ToolchainVersion,
    build_type: BuildType,
    toolchain_package: Option<&str>,
) -> String {
    let mut text = format!(
        "[settings]\n\
         os=baremetal\n\
         arch={architecture}\n\
         compiler={compiler}\n\
         compiler.version={version}\n\
         compiler.cppstd=23\n\
         compiler.libcxx=libstdc++\n\
         build_type={build_type}\n"
    );
    if let Some(package) = toolchain_package {
        text.push_str(&format!("\n[tool_requires]\n{package}/{version}\n"));
    }
    text
}

/// Expand `table` into every supported profile.
///
/// Order is compiler, then compiler version, then architecture, then build
/// type, following table order. Fails if two profiles would share a name.
pub fn generate(table: &MatrixTable) -> MatrixResult<Vec<ProfileSpec>> {
    let mut profiles = Vec::new();
    let mut names = HashSet::new();

    for compiler in table.compilers() {
        for version in &compiler.versions {
            for arch in table.architectures() {
                if !arch.supports(version) {
                    continue;
                }
                for build_type in BuildType::ALL {
                    let profile = ProfileSpec::new(arch, compiler, version, build_type);
                    if !names.insert(profile.name().to_string()) {
                        return Err(MatrixError::DuplicateEntry {
                            table: "profile",
                            name: profile.name().to_string(),
                        });
                    }
                    profiles.push(profile);
                }
            }
        }
    }

    Ok(profiles)
}

/// Narrows a generated matrix to selected profiles and build types.
///
/// Empty selections mean "everything".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileFilter {
    pub names: Vec<String>,
    pub build_types: Vec<BuildType>,
}

impl ProfileFilter {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.build_types.is_empty()
    }

    /// Apply the filter, preserving generation order.
    pub fn apply(&self, profiles: Vec<ProfileSpec>) -> MatrixResult<Vec<ProfileSpec>> {
        for name in &self.names {
            if !profiles.iter().any(|p| p.name() == name) {
                return Err(MatrixError::UnknownProfile { name: name.clone() });
            }
        }

        let selected: Vec<ProfileSpec> = profiles
            .into_iter()
            .filter(|p| self.names.is_empty() || self.names.iter().any(|n| n == p.name()))
            .filter(|p| self.build_types.is_empty() || self.build_types.contains(&p.build_type()))
            .collect();

        if selected.is_empty() {
            return Err(MatrixError::EmptyMatrix);
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table() -> MatrixTable {
        MatrixTable::from_strings(
            &[("gcc", None, &["12.3", "13.2"])],
            &[("cortex-m0", None), ("cortex-m4", None), ("cortex-m55", Some("13.2"))],
        )
        .unwrap()
    }

    #[test]
    fn test_profile_name_and_rendering() {
        let table = small_table();
        let profile = ProfileSpec::new(
            &table.architectures()[1],
            &table.compilers()[0],
            &table.compilers()[0].versions[0],
            BuildType::MinSizeRel,
        );
        assert_eq!(profile.name(), "cortex-m4-gcc-12.3-MinSizeRel");
        assert!(profile.rendered_text().contains("arch=cortex-m4\n"));
        assert!(profile.rendered_text().contains("compiler.version=12.3\n"));
        assert!(profile.rendered_text().contains("build_type=MinSizeRel\n"));
        assert!(!profile.rendered_text().contains("[tool_requires]"));
    }

    #[test]
    fn test_toolchain_package_becomes_tool_requirement() {
        let table = MatrixTable::libhal().unwrap();
        let profiles = generate(&table).unwrap();
        let profile = profiles
            .iter()
            .find(|p| p.name() == "cortex-m4f-gcc-13.3-Release")
            .unwrap();
        assert!(profile
            .rendered_text()
            .ends_with("[tool_requires]\narm-gnu-toolchain/13.3\n"));
    }

    #[test]
    fn test_minimum_version_gates_architectures() {
        let profiles = generate(&small_table()).unwrap();
        // 12.3: two archs, 13.2: three archs, three build types each.
        assert_eq!(profiles.len(), (2 + 3) * 3);
        assert!(!profiles
            .iter()
            .any(|p| p.architecture() == "cortex-m55" && p.compiler_version().as_str() == "12.3"));
        for p in &profiles {
            if let Some(min) = p.minimum_compiler_version() {
                assert!(p.compiler_version() >= min, "{} is below its minimum", p.name());
            }
        }
    }

    #[test]
    fn test_generate_is_deterministic_and_unique() {
        let table = MatrixTable::libhal().unwrap();
        let first = generate(&table).unwrap();
        let second = generate(&table).unwrap();
        assert_eq!(first, second);

        let names: HashSet<&str> = first.iter().map(|p| p.name()).collect();
        assert_eq!(names.len(), first.len());
        // 13 ungated archs on every version, 2 gated archs on 3 of 4 versions.
        assert_eq!(first.len(), (13 * 4 + 2 * 3) * 3);
    }

    #[test]
    fn test_duplicate_entries_are_rejected() {
        let err = MatrixTable::from_strings(&[("gcc", None, &["13", "13.0"])], &[("m4", None)])
            .unwrap_err();
        assert!(matches!(err, MatrixError::DuplicateEntry { table: "compiler version", .. }));

        let err = MatrixTable::from_strings(&[("gcc", None, &["13"])], &[("m4", None), ("m4", None)])
            .unwrap_err();
        assert!(matches!(err, MatrixError::DuplicateEntry { table: "architecture", .. }));
    }

    #[test]
    fn test_malformed_version_fails_fast() {
        let err = MatrixTable::from_strings(&[("gcc", None, &["13.2", "fourteen"])], &[("m4", None)])
            .unwrap_err();
        assert!(matches!(err, MatrixError::InvalidVersion { .. }));

        let err = MatrixTable::from_strings(&[("gcc", None, &["13.2"])], &[("m55", Some("13.x"))])
            .unwrap_err();
        assert!(matches!(err, MatrixError::InvalidVersion { .. }));
    }

    #[test]
    fn test_colliding_names_are_rejected() {
        let err = MatrixTable::from_strings(
            &[("gcc-x", None, &["1"]), ("x", None, &["1"])],
            &[("m4", None), ("m4-gcc", None)],
        )
        .and_then(|t| generate(&t))
        .unwrap_err();
        assert!(matches!(err, MatrixError::DuplicateEntry { table: "profile", .. }));
    }

    #[test]
    fn test_build_type_parsing() {
        assert_eq!("debug".parse::<BuildType>().unwrap(), BuildType::Debug);
        assert_eq!("MinSizeRel".parse::<BuildType>().unwrap(), BuildType::MinSizeRel);
        assert!("RelWithDebInfo".parse::<BuildType>().is_err());
    }

    #[test]
    fn test_filter_by_name_and_build_type() {
        let profiles = generate(&small_table()).unwrap();

        let filter = ProfileFilter {
            names: vec![],
            build_types: vec![BuildType::Release],
        };
        let selected = filter.apply(profiles.clone()).unwrap();
        assert_eq!(selected.len(), 5);
        assert!(selected.iter().all(|p| p.build_type() == BuildType::Release));

        let filter = ProfileFilter {
            names: vec!["cortex-m0-gcc-12.3-Debug".to_string()],
            build_types: vec![],
        };
        let selected = filter.apply(profiles.clone()).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name(), "cortex-m0-gcc-12.3-Debug");
    }

    #[test]
    fn test_filter_rejects_unknown_and_empty() {
        let profiles = generate(&small_table()).unwrap();

        let filter = ProfileFilter {
            names: vec!["cortex-m55-gcc-12.3-Debug".to_string()],
            build_types: vec![],
        };
        assert!(matches!(
            filter.apply(profiles.clone()).unwrap_err(),
            MatrixError::UnknownProfile { .. }
        ));

        let filter = ProfileFilter {
            names: vec!["cortex-m0-gcc-12.3-Debug".to_string()],
            build_types: vec![BuildType::Release],
        };
        assert!(matches!(filter.apply(profiles).unwrap_err(), MatrixError::EmptyMatrix));
    }

    #[test]
    fn test_deserialized_table_is_validated() {
        let json = serde_json::to_string(&MatrixTable::libhal().unwrap()).unwrap();
        let back: MatrixTable = serde_json::from_str(&json).unwrap();
        assert_eq!(generate(&back).unwrap().len(), 174);

        let duplicate = r#"{
            "compilers": [{"name": "gcc", "versions": ["13.2"], "toolchain_package": null}],
            "architectures": [
                {"name": "cortex-m4", "minimum_compiler_version": null},
                {"name": "cortex-m4", "minimum_compiler_version": null}
            ]
        }"#;
        let err = serde_json::from_str::<MatrixTable>(duplicate).unwrap_err();
        assert!(err.to_string().contains("duplicate architecture entry: cortex-m4"));

        let repeated_version = r#"{
            "compilers": [{"name": "gcc", "versions": ["13", "13.0"], "toolchain_package": null}],
            "architectures": [{"name": "cortex-m4", "minimum_compiler_version": null}]
        }"#;
        assert!(serde_json::from_str::<MatrixTable>(repeated_version).is_err());
    }
}
