//! Package identity: a dotted hierarchical path plus a concrete version, and
//! the unresolved reference the dependency resolver turns into one.

use std::fmt;

use crate::package::version::{PackageVersion, VersionRange};

/// Where a package path is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathOrigin {
    Absolute,
    Relative,
    Local,
}

/// A dotted hierarchical package path (e.g. `org.pkg.libfoo`) with an origin
/// flag distinguishing absolute/relative/local references.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackagePath {
    pub segments: Vec<String>,
    pub origin: PathOrigin,
}

impl PackagePath {
    pub fn parse(s: &str) -> Self {
        let (origin, rest) = if let Some(local) = s.strip_prefix("local:") {
            (PathOrigin::Local, local)
        } else if let Some(abs) = s.strip_prefix('.') {
            (PathOrigin::Absolute, abs)
        } else {
            (PathOrigin::Relative, s)
        };
        PackagePath {
            segments: rest.split('.').filter(|s| !s.is_empty()).map(String::from).collect(),
            origin,
        }
    }
}

impl fmt::Display for PackagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// A fully resolved package identity: one path, one concrete version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    pub path: PackagePath,
    pub version: PackageVersion,
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.path, self.version)
    }
}

/// A reference the dependency resolver (4.D) consumes: a path plus a version
/// range to be narrowed down to a single `PackageId`.
#[derive(Debug, Clone)]
pub struct UnresolvedRef {
    pub path: PackagePath,
    pub range: VersionRange,
}

impl UnresolvedRef {
    pub fn new(path: &str, range: VersionRange) -> Self {
        UnresolvedRef {
            path: PackagePath::parse(path),
            range,
        }
    }
}

impl fmt::Display for UnresolvedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.path, self.range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relative_path_by_default() {
        let p = PackagePath::parse("org.pkg.libfoo");
        assert_eq!(p.origin, PathOrigin::Relative);
        assert_eq!(p.segments, vec!["org", "pkg", "libfoo"]);
    }

    #[test]
    fn parses_absolute_and_local_prefixes() {
        assert_eq!(PackagePath::parse(".org.pkg").origin, PathOrigin::Absolute);
        assert_eq!(PackagePath::parse("local:foo").origin, PathOrigin::Local);
    }

    #[test]
    fn display_joins_segments_with_dots() {
        let p = PackagePath::parse("a.b.c");
        assert_eq!(p.to_string(), "a.b.c");
    }
}
