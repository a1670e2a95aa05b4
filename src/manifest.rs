//! Declarative target manifests: the engine's input format. Per the
//! dynamic-plugin-loading redesign note, build scripts are never loaded as
//! shared libraries — every target and its commands are described in a
//! `target.toml` file the engine parses directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::package::version::PackageVersion;
use crate::settings::Settings;

#[derive(Debug, Deserialize, Clone)]
pub struct TargetManifest {
    pub package: PackageMeta,
    #[serde(default)]
    pub settings: HashMap<String, String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PackageMeta {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TargetManifest {
    pub fn from_str(content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::filesystem(path, e))?;
        Self::from_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.package.name.is_empty() {
            return Err(Error::BadInput("package name must not be empty".into()));
        }
        PackageVersion::parse(&self.package.version)?;
        for cmd in &self.commands {
            if cmd.program.is_empty() {
                return Err(Error::BadInput(format!(
                    "command in target '{}' has an empty program",
                    self.package.name
                )));
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        let mut s = Settings::new();
        for (k, v) in &self.settings {
            s.insert_scalar(k, v.clone());
        }
        s
    }
}

/// Walks `root` for `target.toml` files and parses each into a
/// `TargetManifest`. Mirrors how the resolver's directory-backed catalog
/// walks a plans tree, but for build inputs rather than package archives.
pub fn load_inputs(root: &Path) -> Result<Vec<TargetManifest>> {
    let mut manifests = Vec::new();
    if !root.exists() {
        return Ok(manifests);
    }
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| Error::BadInput(e.to_string()))?;
        if entry.file_name() == "target.toml" {
            manifests.push(TargetManifest::from_file(entry.path())?);
        }
    }
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_manifest() {
        let toml = r#"
[package]
name = "foo"
version = "1.0.0"

[[commands]]
program = "cc"
args = ["-c", "foo.c", "-o", "foo.o"]
inputs = ["foo.c"]
outputs = ["foo.o"]
"#;
        let m = TargetManifest::from_str(toml).unwrap();
        assert_eq!(m.package.name, "foo");
        assert_eq!(m.commands.len(), 1);
        assert_eq!(m.commands[0].program, "cc");
    }

    #[test]
    fn settings_table_becomes_settings_tree() {
        let toml = r#"
[package]
name = "foo"
version = "1.0.0"

[settings]
os = "linux"
"#;
        let m = TargetManifest::from_str(toml).unwrap();
        assert_eq!(m.settings().get("os").value().unwrap(), "linux");
    }

    #[test]
    fn rejects_empty_command_program() {
        let toml = r#"
[package]
name = "foo"
version = "1.0.0"

[[commands]]
program = ""
"#;
        assert!(TargetManifest::from_str(toml).is_err());
    }

    #[test]
    fn rejects_bad_version() {
        let toml = r#"
[package]
name = "foo"
version = "..."
"#;
        assert!(TargetManifest::from_str(toml).is_err());
    }
}
