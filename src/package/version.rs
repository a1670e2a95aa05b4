//! SemVer-compatible package versions with an additional branch/tag variant,
//! and version ranges built directly on the `semver` crate's comparator
//! grammar so "highest version satisfying a range" reuses a well-tested
//! implementation instead of a bespoke comparator.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// A resolved package version: either a proper SemVer version, or a named
/// branch/tag that only ever compares equal to itself.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum PackageVersion {
    SemVer(semver::Version),
    Branch(String),
    Tag(String),
}

impl PackageVersion {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::BadInput("version string must not be empty".into()));
        }
        if let Some(branch) = s.strip_prefix("branch:") {
            return Ok(PackageVersion::Branch(branch.to_string()));
        }
        if let Some(tag) = s.strip_prefix("tag:") {
            return Ok(PackageVersion::Tag(tag.to_string()));
        }
        match semver::Version::parse(s) {
            Ok(v) => Ok(PackageVersion::SemVer(v)),
            Err(_) => match normalize_to_semver(s) {
                Some(v) => Ok(PackageVersion::SemVer(v)),
                None => Err(Error::BadInput(format!("invalid version format: '{s}'"))),
            },
        }
    }

    pub fn is_semver(&self) -> bool {
        matches!(self, PackageVersion::SemVer(_))
    }
}

/// SemVer requires exactly major.minor.patch; real-world package versions are
/// often shorter ("3", "0.1"). Pad with zeros before handing off to `semver`
/// rather than maintaining a second ad hoc comparator.
fn normalize_to_semver(s: &str) -> Option<semver::Version> {
    let mut parts: Vec<&str> = s.splitn(3, '.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    semver::Version::parse(&parts.join(".")).ok()
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PackageVersion::SemVer(a), PackageVersion::SemVer(b)) => a.cmp(b),
            (PackageVersion::Branch(a), PackageVersion::Branch(b)) => a.cmp(b),
            (PackageVersion::Tag(a), PackageVersion::Tag(b)) => a.cmp(b),
            // SemVer versions are always preferred over branch/tag pins when
            // ordering a candidate list for "highest satisfying version".
            (PackageVersion::SemVer(_), _) => Ordering::Greater,
            (_, PackageVersion::SemVer(_)) => Ordering::Less,
            (PackageVersion::Branch(_), PackageVersion::Tag(_)) => Ordering::Greater,
            (PackageVersion::Tag(_), PackageVersion::Branch(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageVersion::SemVer(v) => write!(f, "{v}"),
            PackageVersion::Branch(b) => write!(f, "branch:{b}"),
            PackageVersion::Tag(t) => write!(f, "tag:{t}"),
        }
    }
}

/// A range of acceptable versions: a SemVer comparator expression, or an
/// exact branch/tag pin.
#[derive(Debug, Clone)]
pub enum VersionRange {
    SemVer(semver::VersionReq),
    Branch(String),
    Tag(String),
}

impl VersionRange {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(branch) = s.strip_prefix("branch:") {
            return Ok(VersionRange::Branch(branch.to_string()));
        }
        if let Some(tag) = s.strip_prefix("tag:") {
            return Ok(VersionRange::Tag(tag.to_string()));
        }
        let req = semver::VersionReq::parse(s)
            .map_err(|e| Error::BadInput(format!("invalid version range '{s}': {e}")))?;
        Ok(VersionRange::SemVer(req))
    }

    pub fn any() -> Self {
        VersionRange::SemVer(semver::VersionReq::STAR)
    }

    pub fn matches(&self, v: &PackageVersion) -> bool {
        match (self, v) {
            (VersionRange::SemVer(req), PackageVersion::SemVer(v)) => req.matches(v),
            (VersionRange::Branch(a), PackageVersion::Branch(b)) => a == b,
            (VersionRange::Tag(a), PackageVersion::Tag(b)) => a == b,
            _ => false,
        }
    }

    /// Picks the highest version in `candidates` satisfying this range,
    /// matching the resolver contract: "highest version satisfying the
    /// range".
    pub fn pick_highest<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a PackageVersion>,
    ) -> Option<&'a PackageVersion> {
        candidates
            .into_iter()
            .filter(|v| self.matches(v))
            .max()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRange::SemVer(r) => write!(f, "{r}"),
            VersionRange::Branch(b) => write!(f, "branch:{b}"),
            VersionRange::Tag(t) => write!(f, "tag:{t}"),
        }
    }
}

/// Parse a dependency string like "openssl >= 3.0" or "openssl" (any version)
/// into (name, range).
pub fn parse_dependency(dep: &str) -> Result<(String, VersionRange)> {
    let dep = dep.trim();
    for op in ["^", "~", ">=", "<=", ">", "<", "=", "*"] {
        if let Some(pos) = dep.find(op) {
            let name = dep[..pos].trim().to_string();
            if name.is_empty() {
                continue;
            }
            let range = VersionRange::parse(&dep[pos..])?;
            return Ok((name, range));
        }
    }
    Ok((dep.to_string(), VersionRange::any()))
}
