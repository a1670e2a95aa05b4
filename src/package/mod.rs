pub mod id;
pub mod version;

pub use id::{PackageId, PackagePath, PathOrigin, UnresolvedRef};
pub use version::{parse_dependency, PackageVersion, VersionRange};
