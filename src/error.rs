use std::path::PathBuf;

/// The crate-wide error type. Every fallible operation in the pipeline returns
/// `Result<T>` over this enum; no module defines its own parallel error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("unresolved dependency: {0}")]
    UnresolvedDependency(String),

    #[error("cyclic dependencies: {0} strongly connected component(s) of size > 1")]
    CyclicDependencies(usize),

    #[error("command failed: {command} (exit {exit_code})")]
    CommandFailed { command: String, exit_code: i32 },

    #[error("corrupt database at {path}: {reason}")]
    CorruptDb { path: PathBuf, reason: String },

    #[error("unexpected build state: in {current}, expected {expected}")]
    UnexpectedBuildState { current: String, expected: String },

    #[error("remote unavailable after retries: {0}")]
    RemoteUnavailable(String),

    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("predefined target unresolved: {0}")]
    PredefinedTargetUnresolved(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt_db(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptDb {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Maps this error onto the driver's exit code: 0 success, 1 build failure,
    /// 2 configuration error, 3 internal invariant violation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UnexpectedBuildState { .. } => 3,
            Error::BadInput(_)
            | Error::UnresolvedDependency(_)
            | Error::CyclicDependencies(_)
            | Error::RemoteUnavailable(_)
            | Error::PredefinedTargetUnresolved(_)
            | Error::Config(_) => 2,
            Error::CommandFailed { .. }
            | Error::CorruptDb { .. }
            | Error::Filesystem { .. }
            | Error::Io(_)
            | Error::Toml(_)
            | Error::Json(_) => 1,
        }
    }
}

/// Extension trait that adds `.context()` to any Result, converting the error
/// into `Error::BadInput` with a prefixed message.
pub trait ResultExt<T> {
    fn context(self, msg: impl std::fmt::Display) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: impl std::fmt::Display) -> Result<T> {
        self.map_err(|e| Error::BadInput(format!("{}: {}", msg, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        assert_eq!(Error::BadInput("x".into()).exit_code(), 2);
        assert_eq!(Error::CyclicDependencies(2).exit_code(), 2);
        assert_eq!(
            Error::CommandFailed {
                command: "cc".into(),
                exit_code: 1
            }
            .exit_code(),
            1
        );
        assert_eq!(
            Error::UnexpectedBuildState {
                current: "Executed".into(),
                expected: "Prepared".into()
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn context_wraps_foreign_errors() {
        let r: std::result::Result<(), &str> = Err("boom");
        let wrapped = r.context("loading manifest");
        assert!(matches!(wrapped, Err(Error::BadInput(m)) if m == "loading manifest: boom"));
    }
}
