//! Error types for auto-tmpdir-core

use std::path::PathBuf;
use thiserror::Error;

/// One failed entry inside a partially removed tree.
#[derive(Debug)]
pub struct RemovalFailure {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for RemovalFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.source)
    }
}

#[derive(Error, Debug)]
pub enum TmpdirError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("privilege error: {0}")]
    Privilege(String),

    #[error("no usable base directory for `{}`: {}", .path.display(), .tried.join("; "))]
    PathResolution {
        /// Path that would have been composed on the built-in default base
        path: PathBuf,
        /// Every base tried, with the reason it was rejected
        tried: Vec<String>,
    },

    #[error("path component `{}` exists but is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("unable to create directory `{}`: {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to remove `{}`: owned by uid {found}, expected uid {expected}", .path.display())]
    OwnershipMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("{} entries under `{}` could not be removed (first: {})", .failures.len(), .path.display(), .failures.first().map_or_else(String::new, ToString::to_string))]
    PartialDelete {
        path: PathBuf,
        failures: Vec<RemovalFailure>,
    },

    #[error("mount error: {0}")]
    Mount(String),

    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl TmpdirError {
    /// Whether this error must stop the job step from starting.
    ///
    /// Teardown-class failures (ownership mismatch, partial delete) are
    /// reported but never affect the job's exit status.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::OwnershipMismatch { .. } | Self::PartialDelete { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_class_errors_are_not_fatal() {
        let mismatch = TmpdirError::OwnershipMismatch {
            path: PathBuf::from("/tmp/job_1"),
            expected: 1000,
            found: 0,
        };
        assert!(!mismatch.is_fatal());

        let partial = TmpdirError::PartialDelete {
            path: PathBuf::from("/tmp/job_1"),
            failures: vec![],
        };
        assert!(!partial.is_fatal());

        assert!(TmpdirError::Privilege("setegid failed".into()).is_fatal());
        assert!(TmpdirError::NotADirectory(PathBuf::from("/tmp/job_1")).is_fatal());
    }

    #[test]
    fn resolution_error_names_every_base() {
        let err = TmpdirError::PathResolution {
            path: PathBuf::from("/tmp/job_7"),
            tried: vec![
                "override `/scratch`: permission denied".into(),
                "default `/tmp`: no such file or directory".into(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/job_7"));
        assert!(msg.contains("/scratch"));
        assert!(msg.contains("default `/tmp`"));
    }

    #[test]
    fn partial_delete_reports_first_failure() {
        let err = TmpdirError::PartialDelete {
            path: PathBuf::from("/tmp/job_3"),
            failures: vec![RemovalFailure {
                path: PathBuf::from("/tmp/job_3/busy"),
                source: std::io::Error::from_raw_os_error(libc::EBUSY),
            }],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("1 entries"));
        assert!(msg.contains("/tmp/job_3/busy"));
    }
}
