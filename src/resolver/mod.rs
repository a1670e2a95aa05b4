//! Dependency resolver (4.D): narrows unresolved references to concrete
//! package IDs via an ordered list of catalogs (first match wins), then
//! materializes the winner into local storage. The remote catalog and local
//! storage are modeled as trait contracts per §1/§4.D — this crate ships one
//! in-process, directory-backed catalog suitable for tests and offline use;
//! an HTTP-backed catalog is a drop-in implementer of the same trait.

pub mod local_storage;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::package::version::PackageVersion;
use crate::package::{PackageId, UnresolvedRef};

pub use local_storage::LocalStorage;

/// A source of package versions. Implementers answer "what versions of this
/// path do you have" and "give me the manifest directory for this exact
/// version" — everything else (picking the highest satisfying version,
/// retrying on failure) is the resolver's job, not the catalog's.
pub trait Catalog: Send + Sync {
    fn name(&self) -> &str;

    /// All versions this catalog offers for `path`, or an empty vec if none.
    fn available_versions(&self, path: &str) -> Result<Vec<PackageVersion>>;

    /// The directory containing the manifest/sources for `id`, if this
    /// catalog can provide it.
    fn fetch(&self, id: &PackageId) -> Result<PathBuf>;
}

/// An in-process catalog backed by a directory of `<path>/<version>/`
/// subdirectories, each containing a `target.toml`. Grounded on the
/// teacher's directory-scanning resolver (`repo/source.rs`'s
/// `SimpleResolver`), adapted from archive-based resolution to plain
/// directories since archive extraction is out of scope (§1 Non-goals).
pub struct DirectoryCatalog {
    name: String,
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(name: impl Into<String>, root: PathBuf) -> Self {
        DirectoryCatalog { name: name.into(), root }
    }

    fn path_dir(&self, path: &str) -> PathBuf {
        self.root.join(path.replace('.', "/"))
    }
}

impl Catalog for DirectoryCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn available_versions(&self, path: &str) -> Result<Vec<PackageVersion>> {
        let dir = self.path_dir(path);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| Error::filesystem(&dir, e))? {
            let entry = entry.map_err(|e| Error::filesystem(&dir, e))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(v) = PackageVersion::parse(name) {
                        versions.push(v);
                    }
                }
            }
        }
        Ok(versions)
    }

    fn fetch(&self, id: &PackageId) -> Result<PathBuf> {
        let dir = self.path_dir(&id.path.to_string()).join(id.version.to_string());
        if !dir.join("target.toml").exists() {
            return Err(Error::UnresolvedDependency(format!("{id} not found in catalog '{}'", self.name)));
        }
        Ok(dir)
    }
}

/// Resolver configuration: retry count and base backoff, consulted only
/// when a catalog lookup fails with an I/O/network-shaped error rather than
/// a clean "not found".
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: 3, base_backoff: Duration::from_millis(100) }
    }
}

/// Resolves unresolved references against an ordered list of catalogs
/// (first match wins) and materializes the winner into local storage.
pub struct Resolver {
    catalogs: Vec<Box<dyn Catalog>>,
    storage: LocalStorage,
    retry: RetryPolicy,
}

impl Resolver {
    pub fn new(catalogs: Vec<Box<dyn Catalog>>, storage: LocalStorage) -> Self {
        Resolver { catalogs, storage, retry: RetryPolicy::default() }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolves every reference, consulting catalogs in order; the first
    /// catalog offering a version satisfying the range wins. Retries
    /// transient failures (I/O errors from a catalog) up to
    /// `retry.max_attempts` times with exponential backoff before
    /// surfacing `RemoteUnavailable`.
    pub fn resolve_all(&self, refs: &[UnresolvedRef]) -> Result<HashMap<String, PackageId>> {
        let mut resolved = HashMap::new();
        for reference in refs {
            let id = self.resolve_one(reference)?;
            self.storage.ensure_present(&id)?;
            resolved.insert(reference.path.to_string(), id);
        }
        Ok(resolved)
    }

    fn resolve_one(&self, reference: &UnresolvedRef) -> Result<PackageId> {
        let path_str = reference.path.to_string();

        for catalog in &self.catalogs {
            let mut attempt = 0;
            loop {
                match catalog.available_versions(&path_str) {
                    Ok(versions) => {
                        if let Some(best) = reference.range.pick_highest(versions.iter()) {
                            tracing::debug!(catalog = catalog.name(), %reference, version = %best, "dependency resolved");
                            return Ok(PackageId { path: reference.path.clone(), version: best.clone() });
                        }
                        break; // this catalog has the path but no matching version; try next catalog
                    }
                    Err(_) if attempt + 1 < self.retry.max_attempts => {
                        attempt += 1;
                        tracing::debug!(catalog = catalog.name(), %reference, attempt, "retrying catalog lookup after error");
                        std::thread::sleep(self.retry.base_backoff * attempt);
                    }
                    Err(_) => {
                        tracing::warn!(catalog = catalog.name(), %reference, attempts = self.retry.max_attempts, "catalog unavailable");
                        return Err(Error::RemoteUnavailable(format!(
                            "catalog '{}' unavailable after {} attempts resolving {}",
                            catalog.name(),
                            self.retry.max_attempts,
                            reference
                        )));
                    }
                }
            }
        }

        Err(Error::UnresolvedDependency(reference.to_string()))
    }

    pub fn fetch_manifest_dir(&self, id: &PackageId) -> Result<PathBuf> {
        for catalog in &self.catalogs {
            if let Ok(dir) = catalog.fetch(id) {
                return Ok(dir);
            }
        }
        Err(Error::UnresolvedDependency(id.to_string()))
    }
}
