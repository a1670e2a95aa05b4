//! Local content-addressed package storage. Grounded on the teacher's
//! `validate_local_path` (builder/mod.rs): every path a catalog hands back
//! is joined against the storage root and canonicalized before use, so a
//! malicious or buggy manifest can never resolve outside the storage root.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::package::PackageId;

/// Joins `relative_path` onto `root`, canonicalizes, and rejects the result
/// if it escapes `root` — the same guard the teacher's builder applied
/// before touching any path sourced from a package manifest.
pub fn validate_local_path(root: &Path, relative_path: &str) -> Result<PathBuf> {
    let joined = root.join(relative_path);
    let root_abs = root
        .canonicalize()
        .map_err(|e| Error::filesystem(root, e))?;
    let resolved = joined.canonicalize().unwrap_or(joined);
    if !resolved.starts_with(&root_abs) {
        return Err(Error::BadInput(format!(
            "path '{relative_path}' escapes storage root {}",
            root.display()
        )));
    }
    Ok(resolved)
}

/// Materializes resolved packages into the local content-addressed storage
/// directory (4.D: "ensures the resolved package is present in the local
/// content-addressed storage directory").
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        LocalStorage { root }
    }

    pub fn package_dir(&self, id: &PackageId) -> PathBuf {
        self.root.join(id.path.to_string()).join(id.version.to_string())
    }

    pub fn is_present(&self, id: &PackageId) -> bool {
        self.package_dir(id).exists()
    }

    /// Ensures the package's storage directory exists, creating it if this
    /// is the first time the package has been materialized. The package's
    /// path and version come from a resolved manifest, so the joined
    /// directory is validated against the storage root before anything is
    /// created.
    pub fn ensure_present(&self, id: &PackageId) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root).map_err(|e| Error::filesystem(&self.root, e))?;
        let relative = format!("{}/{}", id.path, id.version);
        let dir = validate_local_path(&self.root, &relative)?;
        std::fs::create_dir_all(&dir).map_err(|e| Error::filesystem(&dir, e))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::version::PackageVersion;
    use crate::package::PackagePath;

    #[test]
    fn rejects_path_escaping_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        let err = validate_local_path(dir.path(), "../../etc/passwd").unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn accepts_path_within_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        let resolved = validate_local_path(dir.path(), "pkg").unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn local_storage_creates_package_dir_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());
        let id = PackageId {
            path: PackagePath::parse("org.pkg.libfoo"),
            version: PackageVersion::parse("1.0.0").unwrap(),
        };
        assert!(!storage.is_present(&id));
        storage.ensure_present(&id).unwrap();
        assert!(storage.is_present(&id));
    }
}
