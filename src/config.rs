//! Process-lifetime `Context`: layered configuration plus the resolved
//! directory roots and open cache handles, threaded by reference through the
//! session, resolver, and scheduler instead of living in globals or statics.
//!
//! Configuration layering mirrors the teacher's `GlobalConfig`: built-in
//! defaults, then a system-wide file, then a per-user file (XDG config dir),
//! then a project-local file, each merged with later layers winning, and
//! finally environment variables override any file-sourced value. The
//! layering itself is `figment`'s job: each file is an optional `Toml`
//! provider merged in order, with a `SW_`-prefixed `Env` provider merged last
//! so it always wins regardless of what the files say.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::cache::{CommandCache, FileCache};
use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConfigFile {
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    #[serde(default)]
    pub num_jobs: Option<usize>,
    #[serde(default)]
    pub skip_errors: usize,
    #[serde(default)]
    pub build_always: bool,
    #[serde(default)]
    pub write_output_to_file: bool,
    #[serde(default)]
    pub time_trace: bool,
}

impl Default for ConfigFile {
    fn default() -> Self {
        ConfigFile {
            storage_dir: default_storage_dir(),
            build_dir: default_build_dir(),
            num_jobs: None,
            skip_errors: 0,
            build_always: false,
            write_output_to_file: false,
            time_trace: false,
        }
    }
}

fn default_storage_dir() -> PathBuf {
    get_xdg_data().unwrap_or_else(|| PathBuf::from("/var/lib/forgebuild/storage"))
}

fn default_build_dir() -> PathBuf {
    PathBuf::from(".")
}

fn get_xdg_data() -> Option<PathBuf> {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| std::env::var("HOME").map(|h| PathBuf::from(h).join(".local/share")).ok())
        .map(|p| p.join("forgebuild"))
}

fn get_xdg_config() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")).ok())
        .map(|p| p.join("forgebuild/config.toml"))
}

/// Layers built-in defaults, then `/etc/forgebuild/config.toml`, then
/// `$XDG_CONFIG_HOME/forgebuild/config.toml`, then `./forgebuild.toml`, each
/// layer optional and later layers overriding only the keys they specify.
/// The sole config-layering path; `Context::from_env_and_files` merges the
/// `SW_`-prefixed environment layer on top of this before extracting.
fn layered_figment() -> Figment {
    let mut figment = Figment::from(Serialized::defaults(ConfigFile::default()));
    figment = figment.merge(Toml::file("/etc/forgebuild/config.toml"));
    if let Some(xdg) = get_xdg_config() {
        figment = figment.merge(Toml::file(xdg));
    }
    figment.merge(Toml::file("./forgebuild.toml"))
}

/// Scheduler policy knobs threaded into `execute` (4.H).
#[derive(Debug, Clone, Copy)]
pub struct SchedulerPolicy {
    pub jobs: usize,
    pub skip_errors: usize,
    pub build_always: bool,
    pub write_output_to_file: bool,
    pub time_trace: bool,
}

/// The process-lifetime value holding configuration, resolved directory
/// roots, and open cache handles. Constructed once per process and borrowed
/// by the build session, resolver, and scheduler — never a `static`.
pub struct Context {
    pub storage_root: PathBuf,
    pub build_dir: PathBuf,
    pub policy: SchedulerPolicy,
    file_caches: Mutex<HashMap<String, Arc<FileCache>>>,
    command_cache: OnceLock<Arc<CommandCache>>,
}

const FILE_DB_VERSION: u32 = 1;
const CMD_DB_VERSION: u32 = 1;

impl Context {
    pub fn new(storage_root: PathBuf, build_dir: PathBuf, policy: SchedulerPolicy) -> Self {
        Context {
            storage_root,
            build_dir,
            policy,
            file_caches: Mutex::new(HashMap::new()),
            command_cache: OnceLock::new(),
        }
    }

    /// Builds a `Context` from layered config files, then overrides any key
    /// from its `SW_`-prefixed environment variable counterpart (e.g.
    /// `SW_STORAGE_DIR`, `SW_BUILD_DIR`, `SW_NUM_JOBS`), per 4.I/§6.
    pub fn from_env_and_files() -> Result<Self> {
        let figment = layered_figment().merge(Env::prefixed("SW_"));
        let file_config: ConfigFile = figment.extract().map_err(Error::from)?;

        let jobs = file_config
            .num_jobs
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

        Ok(Context::new(
            file_config.storage_dir,
            file_config.build_dir,
            SchedulerPolicy {
                jobs,
                skip_errors: file_config.skip_errors,
                build_always: file_config.build_always,
                write_output_to_file: file_config.write_output_to_file,
                time_trace: file_config.time_trace,
            },
        ))
    }

    /// Lazily opens (or returns the already-open) file fingerprint cache for
    /// `config_hash` — the settings hash of the configuration currently being
    /// built, per the `db/<file-db-version>/<config-hash>/` layout of §6.
    pub fn file_cache(&self, config_hash: &str) -> Result<Arc<FileCache>> {
        let mut caches = self.file_caches.lock().unwrap();
        if let Some(existing) = caches.get(config_hash) {
            return Ok(existing.clone());
        }
        let dir = self
            .build_dir
            .join(".sw")
            .join("db")
            .join(FILE_DB_VERSION.to_string())
            .join(config_hash);
        let cache = Arc::new(FileCache::open(&dir)?);
        caches.insert(config_hash.to_string(), cache.clone());
        Ok(cache)
    }

    /// Lazily opens the process-wide command result cache — there is exactly
    /// one per `(build-dir, cmd-db-version)` pair, unlike the file cache which
    /// is keyed per settings configuration.
    pub fn command_cache(&self) -> Result<Arc<CommandCache>> {
        if let Some(existing) = self.command_cache.get() {
            return Ok(existing.clone());
        }
        let dir = self
            .build_dir
            .join(".sw")
            .join("db")
            .join(CMD_DB_VERSION.to_string());
        let cache = Arc::new(CommandCache::open(&dir)?);
        let _ = self.command_cache.set(cache.clone());
        Ok(self.command_cache.get().unwrap().clone())
    }

    /// Flushes every open cache to disk. Called at the end of a build or on
    /// cancellation so partial progress is retained (§5 Cancellation).
    pub fn flush_caches(&self) -> Result<()> {
        for cache in self.file_caches.lock().unwrap().values() {
            cache.save()?;
        }
        if let Some(cache) = self.command_cache.get() {
            cache.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_jobs_fallback() {
        let cfg = ConfigFile::default();
        assert_eq!(cfg.skip_errors, 0);
        assert!(!cfg.build_always);
    }

    #[test]
    fn project_file_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("forgebuild.toml", "skip_errors = 4\nbuild_always = true\n")?;
            let figment = Figment::from(Serialized::defaults(ConfigFile::default()))
                .merge(Toml::file("./forgebuild.toml"));
            let cfg: ConfigFile = figment.extract().unwrap();
            assert_eq!(cfg.skip_errors, 4);
            assert!(cfg.build_always);
            Ok(())
        });
    }

    #[test]
    fn env_var_overrides_file_value() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("forgebuild.toml", "num_jobs = 2\n")?;
            jail.set_env("SW_NUM_JOBS", "9");
            let figment = Figment::from(Serialized::defaults(ConfigFile::default()))
                .merge(Toml::file("./forgebuild.toml"))
                .merge(Env::prefixed("SW_"));
            let cfg: ConfigFile = figment.extract().unwrap();
            assert_eq!(cfg.num_jobs, Some(9));
            Ok(())
        });
    }

    #[test]
    fn context_opens_distinct_file_caches_per_config_hash() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(
            dir.path().join("storage"),
            dir.path().join("build"),
            SchedulerPolicy {
                jobs: 1,
                skip_errors: 0,
                build_always: false,
                write_output_to_file: false,
                time_trace: false,
            },
        );
        let a = ctx.file_cache("aaaaaaaa").unwrap();
        let b = ctx.file_cache("bbbbbbbb").unwrap();
        let a_again = ctx.file_cache("aaaaaaaa").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &a_again));
    }
}
