//! Targets, commands, and the target graph (4.E). Re-architected per §9 away
//! from the source's deep Native/CSharp/Rust/.../ inheritance hierarchy: a
//! target is a tagged variant over a small set of kinds, each implementing
//! one shared capability contract through the `Rule` trait rather than
//! inheriting from a base class. Cyclic references between targets are
//! avoided by the arena-plus-index pattern: targets live in one owning
//! `TargetArena`, dependencies are stored as `(package-id, settings)` lookup
//! keys resolved against the arena at iteration time.

use std::collections::HashMap;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::manifest::{CommandSpec, TargetManifest};
use crate::package::{PackageId, VersionRange};
use crate::settings::Settings;

/// The small, closed set of target kinds (3: "tagged variant over a small
/// set of target kinds"). `Predefined` stands in for toolchain-provided
/// targets that are never built, only depended upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    NativeLibrary,
    NativeExecutable,
    Predefined,
}

/// One declared command, after the manifest's program/args/cwd/env plus its
/// declared input and output file sets. `key()` is only stable once
/// `prepare` has resolved any lazy argument — this crate's manifests are
/// fully declarative, so every `Command` is already in its prepared form at
/// construction time.
#[derive(Debug, Clone)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub depends_on: Vec<String>,
}

impl Command {
    pub fn from_spec(spec: &CommandSpec) -> Self {
        Command {
            program: spec.program.clone(),
            args: spec.args.clone(),
            cwd: spec.cwd.clone(),
            env: spec.env.clone(),
            inputs: spec.inputs.clone(),
            outputs: spec.outputs.clone(),
            depends_on: spec.depends_on.clone(),
        }
    }

    /// `hash(program ∥ args ∥ env ∥ inputs' fingerprints)` (3). Input
    /// fingerprints here are the declared input *paths*; the scheduler
    /// layers the on-disk fingerprint check on top via the file cache, since
    /// the key must stay stable across runs whether or not a file changed
    /// (that's exactly what makes a hit/miss decision meaningful).
    pub fn key(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.program.as_bytes());
        for a in &self.args {
            hasher.update(a.as_bytes());
        }
        let mut env_keys: Vec<&String> = self.env.keys().collect();
        env_keys.sort();
        for k in env_keys {
            hasher.update(k.as_bytes());
            hasher.update(self.env[k].as_bytes());
        }
        let mut inputs: Vec<&PathBuf> = self.inputs.iter().collect();
        inputs.sort();
        for i in inputs {
            hasher.update(i.to_string_lossy().as_bytes());
        }
        let digest = hasher.finalize();
        u64::from_be_bytes(digest[..8].try_into().unwrap())
    }
}

/// A dependency reference: which package/settings the referring target
/// needs, resolved against the arena at iteration time rather than held as a
/// direct pointer (no ownership cycles, §9).
#[derive(Debug, Clone)]
pub struct DependencyRef {
    /// The path this reference names, plus whatever version has been
    /// narrowed down for it so far. `package.version` is a placeholder
    /// (`0.0.0`) until `BuildSession::resolve_packages`/`load_packages`
    /// narrows `range` down to a concrete version; `find_suitable` and
    /// `fetch_manifest_dir` must not be called against it before then.
    pub package: PackageId,
    pub range: VersionRange,
    pub settings: Settings,
    /// Populated once the target graph (4.E `LoadPackages`) has bound this
    /// reference to a concrete target index in the arena.
    pub resolved_index: Option<usize>,
}

/// The shared capability contract every target kind implements, composed by
/// the target rather than inherited (§9's "deep inheritance" redesign).
pub trait Rule: std::fmt::Debug {
    fn kind(&self) -> TargetKind;
    fn gather_commands(&self, settings: &Settings) -> Vec<Command>;
    fn gather_dependencies(&self, settings: &Settings) -> Vec<DependencyRef>;
    fn gather_files(&self) -> Vec<PathBuf>;
}

/// The rule backing targets declared in a `target.toml` manifest — the only
/// concrete `Rule` implementation this crate ships, since build scripts are
/// declarative manifests rather than loaded plugins (§9).
#[derive(Debug, Clone)]
pub struct ManifestRule {
    pub manifest: TargetManifest,
    pub kind: TargetKind,
}

impl ManifestRule {
    pub fn new(manifest: TargetManifest) -> Self {
        let kind = if manifest.commands.iter().any(|c| !c.outputs.is_empty() && is_executable_output(c)) {
            TargetKind::NativeExecutable
        } else {
            TargetKind::NativeLibrary
        };
        ManifestRule { manifest, kind }
    }
}

fn is_executable_output(cmd: &CommandSpec) -> bool {
    cmd.outputs.iter().any(|o| o.extension().is_none())
}

impl Rule for ManifestRule {
    fn kind(&self) -> TargetKind {
        self.kind
    }

    fn gather_commands(&self, _settings: &Settings) -> Vec<Command> {
        self.manifest.commands.iter().map(Command::from_spec).collect()
    }

    fn gather_dependencies(&self, settings: &Settings) -> Vec<DependencyRef> {
        self.manifest
            .dependencies
            .iter()
            .map(|dep_str| {
                let (name, range) = crate::package::parse_dependency(dep_str)
                    .unwrap_or_else(|_| (dep_str.clone(), crate::package::VersionRange::any()));
                DependencyRef {
                    package: PackageId {
                        path: crate::package::PackagePath::parse(&name),
                        version: crate::package::version::PackageVersion::parse("0.0.0").unwrap(),
                    },
                    range,
                    settings: settings.clone(),
                    resolved_index: None,
                }
            })
            .collect()
    }

    fn gather_files(&self) -> Vec<PathBuf> {
        self.manifest
            .commands
            .iter()
            .flat_map(|c| c.inputs.iter().cloned())
            .collect()
    }
}

/// A target: one package ID at one settings configuration (3). Commands are
/// computed lazily via the rule and cached after the first call.
#[derive(Debug)]
pub struct Target {
    pub package: PackageId,
    pub settings: Settings,
    pub rule: Box<dyn Rule + Send + Sync>,
    pub dependencies: Vec<DependencyRef>,
    commands: Option<Vec<Command>>,
}

impl Target {
    pub fn new(package: PackageId, settings: Settings, rule: Box<dyn Rule + Send + Sync>) -> Self {
        let dependencies = rule.gather_dependencies(&settings);
        Target {
            package,
            settings,
            rule,
            dependencies,
            commands: None,
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.rule.kind()
    }

    /// Lazily computes and caches this target's command list.
    pub fn commands(&mut self) -> &[Command] {
        if self.commands.is_none() {
            self.commands = Some(self.rule.gather_commands(&self.settings));
        }
        self.commands.as_deref().unwrap()
    }

    pub fn settings_hash(&self) -> String {
        self.settings.hash()
    }
}

/// All targets for one package ID, indexed also by settings hash so
/// `find_suitable` doesn't need a linear settings-tree comparison against
/// every candidate whose hash already can't match.
#[derive(Debug, Default)]
pub struct TargetContainer {
    /// Insertion-ordered indices into the arena, for `find_suitable`'s
    /// documented "ties broken by insertion order".
    pub members: Vec<usize>,
}

/// The arena owning every target across every package ID (§9: arena +
/// index, not an owning cyclic object graph).
#[derive(Debug, Default)]
pub struct TargetArena {
    targets: Vec<Target>,
    containers: HashMap<PackageId, TargetContainer>,
}

impl TargetArena {
    pub fn new() -> Self {
        TargetArena {
            targets: Vec::new(),
            containers: HashMap::new(),
        }
    }

    /// Inserts a target, enforcing the container invariant that no two
    /// targets for the same package ID share a settings hash.
    pub fn insert(&mut self, target: Target) -> Result<usize> {
        let package = target.package.clone();
        let hash = target.settings_hash();
        let container = self.containers.entry(package.clone()).or_default();
        for &idx in &container.members {
            if self.targets[idx].settings_hash() == hash {
                return Err(Error::BadInput(format!(
                    "duplicate settings hash {hash} for package {package}"
                )));
            }
        }
        let idx = self.targets.len();
        self.targets.push(target);
        self.containers.entry(package).or_default().members.push(idx);
        Ok(idx)
    }

    pub fn get(&self, idx: usize) -> &Target {
        &self.targets[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Target {
        &mut self.targets[idx]
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn iter_indices(&self) -> impl Iterator<Item = usize> {
        0..self.targets.len()
    }

    /// `find_suitable` (4.E): the first target for `package` whose settings
    /// tree `query` is a *subset* of, ties broken by insertion order (S6: a
    /// dependency requesting `{os: linux}` matches a target carrying
    /// `{os: linux, opt: {level: 2}}`, since the request is narrower than
    /// what the target provides).
    pub fn find_suitable(&self, package: &PackageId, query: &Settings) -> Option<usize> {
        let container = self.containers.get(package)?;
        container
            .members
            .iter()
            .find(|&&idx| query.is_subset_of(&self.targets[idx].settings))
            .copied()
    }

    pub fn package_ids(&self) -> impl Iterator<Item = &PackageId> {
        self.containers.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::version::PackageVersion;
    use crate::package::PackagePath;

    fn pkg(name: &str) -> PackageId {
        PackageId {
            path: PackagePath::parse(name),
            version: PackageVersion::parse("1.0.0").unwrap(),
        }
    }

    fn rule(manifest_toml: &str) -> Box<dyn Rule + Send + Sync> {
        Box::new(ManifestRule::new(TargetManifest::from_str(manifest_toml).unwrap()))
    }

    const MANIFEST: &str = r#"
[package]
name = "foo"
version = "1.0.0"

[[commands]]
program = "cc"
args = ["-c", "foo.c"]
inputs = ["foo.c"]
outputs = ["foo.o"]
"#;

    #[test]
    fn arena_rejects_duplicate_settings_hash_in_one_container() {
        let mut arena = TargetArena::new();
        let mut s = Settings::new();
        s.insert_scalar("opt", "release");
        let t1 = Target::new(pkg("foo"), s.clone(), rule(MANIFEST));
        let t2 = Target::new(pkg("foo"), s, rule(MANIFEST));
        arena.insert(t1).unwrap();
        assert!(arena.insert(t2).is_err());
    }

    /// S6 (spec.md:228): target A carries `{os: linux, opt: 2}`; a dependency
    /// requesting the narrower `{os: linux}` must bind to A, since the
    /// request is a subset of what A provides.
    #[test]
    fn find_suitable_matches_subset_settings() {
        let mut arena = TargetArena::new();
        let mut broad = Settings::new();
        broad.insert_scalar("os", "linux");
        broad.insert_scalar("opt", "2");
        let t = Target::new(pkg("foo"), broad, rule(MANIFEST));
        let idx = arena.insert(t).unwrap();

        let mut query = Settings::new();
        query.insert_scalar("os", "linux");

        assert_eq!(arena.find_suitable(&pkg("foo"), &query), Some(idx));
    }

    /// The inverse of S6: a query asking for a key the target doesn't carry
    /// is not satisfied by a target with fewer settings than requested.
    #[test]
    fn find_suitable_rejects_query_requesting_settings_the_target_lacks() {
        let mut arena = TargetArena::new();
        let mut narrow = Settings::new();
        narrow.insert_scalar("os", "linux");
        let t = Target::new(pkg("foo"), narrow, rule(MANIFEST));
        arena.insert(t).unwrap();

        let mut query = Settings::new();
        query.insert_scalar("os", "linux");
        query.insert_scalar("arch", "x86_64");

        assert_eq!(arena.find_suitable(&pkg("foo"), &query), None);
    }

    #[test]
    fn find_suitable_returns_none_when_no_target_matches() {
        let mut arena = TargetArena::new();
        let mut settings = Settings::new();
        settings.insert_scalar("os", "windows");
        let t = Target::new(pkg("foo"), settings, rule(MANIFEST));
        arena.insert(t).unwrap();

        let mut query = Settings::new();
        query.insert_scalar("os", "linux");
        assert_eq!(arena.find_suitable(&pkg("foo"), &query), None);
    }

    #[test]
    fn command_key_is_stable_for_identical_commands() {
        let c1 = Command {
            program: "cc".into(),
            args: vec!["-c".into()],
            cwd: None,
            env: HashMap::new(),
            inputs: vec![PathBuf::from("a.c")],
            outputs: vec![],
            depends_on: vec![],
        };
        let c2 = c1.clone();
        assert_eq!(c1.key(), c2.key());
    }

    #[test]
    fn command_key_changes_with_inputs() {
        let mut c = Command {
            program: "cc".into(),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            inputs: vec![PathBuf::from("a.c")],
            outputs: vec![],
            depends_on: vec![],
        };
        let k1 = c.key();
        c.inputs.push(PathBuf::from("b.c"));
        assert_ne!(k1, c.key());
    }
}
