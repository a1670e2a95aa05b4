//! Build state machine (4.G): explicit, monotonic stage transitions driving
//! a build from raw manifest inputs through to executed commands. Every
//! transition returns a `Result` instead of throwing (§9's
//! exception-driven-control-flow redesign note) and asserts the session is
//! in the expected source stage before advancing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::config::Context;
use crate::error::{Error, Result};
use crate::graph::CommandGraph;
use crate::manifest::{self, TargetManifest};
use crate::package::{PackageId, PackagePath, PathOrigin};
use crate::package::version::PackageVersion;
use crate::plan::{write_chrome_trace, ExecutionPlan};
use crate::resolver::Resolver;
use crate::scheduler::{ExecutionReport, Scheduler};
use crate::settings::Settings;
use crate::target::{ManifestRule, Target, TargetArena};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    NotStarted,
    InputsLoaded,
    TargetsToBuildSet,
    PackagesResolved,
    PackagesLoaded,
    Prepared,
    Executed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

fn package_id_for(manifest: &TargetManifest) -> Result<PackageId> {
    Ok(PackageId {
        path: PackagePath {
            segments: vec![manifest.package.name.clone()],
            origin: PathOrigin::Relative,
        },
        version: PackageVersion::parse(&manifest.package.version)?,
    })
}

/// Holds the inputs, known package set, target map, and current stage for
/// one build invocation. Borrows a `Context` for its duration rather than
/// owning it (3: "the context is never owned by the session").
pub struct BuildSession<'a> {
    ctx: &'a Context,
    stage: Stage,
    arena: TargetArena,
    targets_to_build: Vec<usize>,
    resolved_packages: HashMap<String, PackageId>,
    plan: Option<ExecutionPlan>,
    levels: Option<Vec<Vec<usize>>>,
    last_report: Option<ExecutionReport>,
}

impl<'a> BuildSession<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        BuildSession {
            ctx,
            stage: Stage::NotStarted,
            arena: TargetArena::new(),
            targets_to_build: Vec::new(),
            resolved_packages: HashMap::new(),
            plan: None,
            levels: None,
            last_report: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn assert_stage(&self, expected: Stage) -> Result<()> {
        if self.stage != expected {
            return Err(Error::UnexpectedBuildState {
                current: self.stage.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    /// `NotStarted -> InputsLoaded`: parses every `target.toml` under
    /// `root` and inserts one target per manifest, at the settings the
    /// manifest declares.
    #[instrument(skip(self), fields(stage = %self.stage))]
    pub fn load(&mut self, root: &Path) -> Result<Stage> {
        self.assert_stage(Stage::NotStarted)?;

        for manifest in manifest::load_inputs(root)? {
            let package = package_id_for(&manifest)?;
            let settings = manifest.settings();
            let rule = Box::new(ManifestRule::new(manifest));
            let target = Target::new(package, settings, rule);
            self.arena.insert(target)?;
        }

        self.stage = Stage::InputsLoaded;
        Ok(self.stage)
    }

    /// `InputsLoaded -> TargetsToBuildSet`: selects, by package name, which
    /// loaded targets are the build's entry points.
    #[instrument(skip(self), fields(stage = %self.stage))]
    pub fn set_targets_to_build(&mut self, names: &[String]) -> Result<Stage> {
        self.assert_stage(Stage::InputsLoaded)?;

        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        self.targets_to_build = self
            .arena
            .iter_indices()
            .filter(|&idx| {
                let target = self.arena.get(idx);
                wanted.contains(target.package.path.to_string().as_str())
            })
            .collect();

        if self.targets_to_build.is_empty() && !names.is_empty() {
            return Err(Error::BadInput(format!("no loaded target matches requested names {names:?}")));
        }

        self.stage = Stage::TargetsToBuildSet;
        Ok(self.stage)
    }

    /// `TargetsToBuildSet -> PackagesResolved`: for every dependency
    /// reference reachable from the targets to build, narrows its range
    /// down to a concrete version — a target already in the arena if one
    /// satisfies the range, otherwise the highest version a catalog offers
    /// (4.D) — and rewrites `DependencyRef.package` to that concrete id.
    /// `DependencyRef.package.version` must not be trusted before this
    /// stage runs; 4.E's `find_suitable`/`fetch_manifest_dir` look up by
    /// the full (path, version) pair, so an unresolved reference would
    /// otherwise never bind.
    #[instrument(skip(self, resolver), fields(stage = %self.stage))]
    pub fn resolve_packages(&mut self, resolver: &Resolver) -> Result<Stage> {
        self.assert_stage(Stage::TargetsToBuildSet)?;

        for &idx in &self.targets_to_build {
            let dep_count = self.arena.get(idx).dependencies.len();
            for dep_idx in 0..dep_count {
                let (path, range) = {
                    let dep = &self.arena.get(idx).dependencies[dep_idx];
                    (dep.package.path.clone(), dep.range.clone())
                };
                let resolved = self.resolve_dependency_version(resolver, &path, &range)?;
                self.arena.get_mut(idx).dependencies[dep_idx].package = resolved;
            }
        }

        self.stage = Stage::PackagesResolved;
        Ok(self.stage)
    }

    /// Narrows one (path, range) pair to a concrete `PackageId`: a target
    /// already loaded into the arena wins over a catalog fetch, matching
    /// 4.E's preference for binding to what is already present; catalog
    /// results are memoized in `resolved_packages` so a path with multiple
    /// dependents (or one revisited from `load_packages`) only round-trips
    /// through the resolver once.
    fn resolve_dependency_version(
        &mut self,
        resolver: &Resolver,
        path: &PackagePath,
        range: &crate::package::VersionRange,
    ) -> Result<PackageId> {
        let local_versions: Vec<PackageVersion> =
            self.arena.package_ids().filter(|id| id.path == *path).map(|id| id.version.clone()).collect();
        if let Some(best) = range.pick_highest(local_versions.iter()) {
            return Ok(PackageId { path: path.clone(), version: best.clone() });
        }

        let path_str = path.to_string();
        if let Some(cached) = self.resolved_packages.get(&path_str) {
            return Ok(cached.clone());
        }

        let reference = crate::package::UnresolvedRef::new(&path_str, range.clone());
        let resolved = resolver.resolve_all(std::slice::from_ref(&reference))?;
        let id = resolved
            .get(&path_str)
            .cloned()
            .ok_or_else(|| Error::UnresolvedDependency(path_str.clone()))?;
        self.resolved_packages.insert(path_str, id.clone());
        Ok(id)
    }

    /// `PackagesResolved -> PackagesLoaded`: iterates binding each
    /// target's dependency references to a concrete target in the arena,
    /// per 4.E. Each target computes its own dependency list (the §9
    /// resolved open question rejecting "take first as representative").
    #[instrument(skip(self, resolver), fields(stage = %self.stage))]
    pub fn load_packages(&mut self, resolver: &Resolver) -> Result<Stage> {
        self.assert_stage(Stage::PackagesResolved)?;

        loop {
            let mut bound_any = false;
            let mut loaded_any = false;
            let mut still_unresolved = Vec::new();

            let target_indices: Vec<usize> = self.arena.iter_indices().collect();
            for idx in target_indices {
                let dep_count = self.arena.get(idx).dependencies.len();
                for dep_idx in 0..dep_count {
                    let already_bound = self.arena.get(idx).dependencies[dep_idx].resolved_index.is_some();
                    if already_bound {
                        continue;
                    }
                    // Targets inserted by an earlier pass of this loop carry
                    // their own dependency refs straight from
                    // `gather_dependencies`, never through `resolve_packages`
                    // (4.E) — narrow their range here so `find_suitable`
                    // looks up the version the catalog actually offered
                    // rather than the `0.0.0` placeholder.
                    let (path, range) = {
                        let dep = &self.arena.get(idx).dependencies[dep_idx];
                        (dep.package.path.clone(), dep.range.clone())
                    };
                    let package = match self.resolve_dependency_version(resolver, &path, &range) {
                        Ok(id) => {
                            self.arena.get_mut(idx).dependencies[dep_idx].package = id.clone();
                            id
                        }
                        Err(_) => self.arena.get(idx).dependencies[dep_idx].package.clone(),
                    };
                    let settings = self.arena.get(idx).dependencies[dep_idx].settings.clone();
                    if let Some(suitable) = self.arena.find_suitable(&package, &settings) {
                        self.arena.get_mut(idx).dependencies[dep_idx].resolved_index = Some(suitable);
                        bound_any = true;
                    } else {
                        still_unresolved.push(package);
                    }
                }
            }

            // Enqueue a load request for each still-unresolved dependency:
            // fetch its manifest directory from the resolver and insert a
            // fresh target at the settings the dependent required.
            for package in &still_unresolved {
                if let Ok(dir) = resolver.fetch_manifest_dir(package) {
                    let manifest_path = dir.join("target.toml");
                    if let Ok(manifest) = TargetManifest::from_file(&manifest_path) {
                        let rule = Box::new(ManifestRule::new(manifest.clone()));
                        let settings = manifest.settings();
                        let target = Target::new(package.clone(), settings, rule);
                        if self.arena.insert(target).is_ok() {
                            loaded_any = true;
                        }
                    }
                }
            }

            if !bound_any && !loaded_any {
                if !still_unresolved.is_empty() {
                    let names = still_unresolved.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ");
                    return Err(Error::PredefinedTargetUnresolved(names));
                }
                break;
            }
        }

        self.stage = Stage::PackagesLoaded;
        Ok(self.stage)
    }

    /// `PackagesLoaded -> Prepared`: runs `prepare_step` (forcing each
    /// target's lazily-computed command list) until a fixpoint.
    #[instrument(skip(self), fields(stage = %self.stage))]
    pub fn prepare(&mut self) -> Result<Stage> {
        self.assert_stage(Stage::PackagesLoaded)?;
        while self.prepare_step() {}
        self.stage = Stage::Prepared;
        Ok(self.stage)
    }

    /// One fixpoint iteration: forces command computation for every known
    /// target. Returns whether another pass is required — here, a second
    /// pass is needed only if computing commands revealed a still-unbound
    /// dependency (possible if `load_packages` ran before a dependency's
    /// target had been inserted into the arena).
    fn prepare_step(&mut self) -> bool {
        let mut needs_another_pass = false;
        let indices: Vec<usize> = self.arena.iter_indices().collect();
        for idx in indices {
            let target = self.arena.get_mut(idx);
            let _ = target.commands();
            if target.dependencies.iter().any(|d| d.resolved_index.is_none()) {
                needs_another_pass = true;
            }
        }
        needs_another_pass && self.try_bind_remaining()
    }

    fn try_bind_remaining(&mut self) -> bool {
        let mut bound_any = false;
        let indices: Vec<usize> = self.arena.iter_indices().collect();
        for idx in indices {
            let dep_count = self.arena.get(idx).dependencies.len();
            for dep_idx in 0..dep_count {
                if self.arena.get(idx).dependencies[dep_idx].resolved_index.is_some() {
                    continue;
                }
                let (package, settings) = {
                    let dep = &self.arena.get(idx).dependencies[dep_idx];
                    (dep.package.clone(), dep.settings.clone())
                };
                if let Some(suitable) = self.arena.find_suitable(&package, &settings) {
                    self.arena.get_mut(idx).dependencies[dep_idx].resolved_index = Some(suitable);
                    bound_any = true;
                }
            }
        }
        bound_any
    }

    /// `Prepared -> Executed`: gathers every command reachable from
    /// targets-to-build (transitively through resolved dependencies),
    /// builds the command graph, computes the execution plan, and runs it.
    #[instrument(skip(self), fields(stage = %self.stage))]
    pub fn execute(&mut self) -> Result<(Stage, ExecutionReport)> {
        self.assert_stage(Stage::Prepared)?;

        let mut visited = HashSet::new();
        let mut stack: Vec<usize> = self.targets_to_build.clone();
        let mut all_commands = Vec::new();
        while let Some(idx) = stack.pop() {
            if !visited.insert(idx) {
                continue;
            }
            let target = self.arena.get_mut(idx);
            all_commands.extend(target.commands().to_vec());
            for dep in &target.dependencies {
                if let Some(dep_idx) = dep.resolved_index {
                    stack.push(dep_idx);
                }
            }
        }

        let graph = CommandGraph::build(all_commands);
        let levels = graph.create_execution_plan(&self.ctx.build_dir)?;

        let config_hash = self.config_hash();
        let file_cache = self.ctx.file_cache(&config_hash)?;
        let command_cache = self.ctx.command_cache()?;

        let scheduler = Scheduler::new(self.ctx.policy, &file_cache, &command_cache, self.ctx.build_dir.clone());
        let report = scheduler.execute(&graph, &levels)?;

        if self.ctx.policy.time_trace {
            let trace_path = self.ctx.build_dir.join(".sw").join("misc").join("time_trace.json");
            write_chrome_trace(&trace_path, &report.trace_events)?;
        }

        self.ctx.flush_caches()?;

        self.plan = Some(ExecutionPlan::from_graph(self.combined_settings(), &graph));
        self.levels = Some(levels);
        self.stage = Stage::Executed;

        // Command failures are a normal build outcome carried in the report
        // (§7: `CommandFailed` is "counted against skip_errors; aggregated"),
        // not a state-machine error — the driver maps `report.failed` to an
        // exit code itself rather than this transition failing outright.
        Ok((self.stage, report))
    }

    /// `step()`: performs the next transition in sequence, returning
    /// whether more remain. `root`/`names`/`resolver` are only consulted
    /// when the current stage needs them.
    pub fn step(&mut self, root: &Path, names: &[String], resolver: &Resolver) -> Result<bool> {
        match self.stage {
            Stage::NotStarted => {
                self.load(root)?;
            }
            Stage::InputsLoaded => {
                self.set_targets_to_build(names)?;
            }
            Stage::TargetsToBuildSet => {
                self.resolve_packages(resolver)?;
            }
            Stage::PackagesResolved => {
                self.load_packages(resolver)?;
            }
            Stage::PackagesLoaded => {
                self.prepare()?;
            }
            Stage::Prepared => {
                let (_, report) = self.execute()?;
                self.last_report = Some(report);
            }
            Stage::Executed => return Ok(false),
        }
        Ok(self.stage != Stage::Executed)
    }

    /// `build()`: the transitive closure of `step()`.
    pub fn build(&mut self, root: &Path, names: &[String], resolver: &Resolver) -> Result<ExecutionReport> {
        while self.step(root, names, resolver)? {}
        self.last_report.take().ok_or_else(|| Error::UnexpectedBuildState {
            current: self.stage.to_string(),
            expected: Stage::Executed.to_string(),
        })
    }

    /// An explicit stage-override escape hatch for resuming from a saved
    /// plan (§4.F "load(path)... permitting the build to jump straight to
    /// the Execute stage"), bypassing the normal monotonic sequence.
    pub fn resume_from_plan(&mut self, plan: ExecutionPlan) -> Result<()> {
        let graph = CommandGraph::build(plan.commands.clone());
        let levels = graph.create_execution_plan(&self.ctx.build_dir)?;
        self.plan = Some(plan);
        self.levels = Some(levels);
        self.stage = Stage::Prepared;
        Ok(())
    }

    fn config_hash(&self) -> String {
        self.combined_settings().hash()
    }

    fn combined_settings(&self) -> Settings {
        let mut combined = Settings::new();
        for &idx in &self.targets_to_build {
            combined.merge_and_assign(&self.arena.get(idx).settings);
        }
        combined
    }

    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.plan.as_ref()
    }

    pub fn plan_path(&self, inputs_hash: &str) -> PathBuf {
        self.ctx.build_dir.join(".sw").join("ep").join(format!("{inputs_hash}.swb"))
    }
}
