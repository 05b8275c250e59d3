//! Component-by-component directory creation below a trusted base.

use crate::{Result, TmpdirError};
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

/// Owner-only read/write/search.
pub const DIR_MODE: u32 = 0o700;

/// Creates the missing directories between a base and a target.
///
/// Meant to run inside a [`PrivilegeScope`](crate::privilege::PrivilegeScope)
/// so that every directory it creates belongs to the job's user.
#[derive(Debug, Clone)]
pub struct DirectoryBuilder {
    base: PathBuf,
}

impl DirectoryBuilder {
    /// `base` must already exist; it is never created or inspected.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Create every missing component of `target` below the base.
    ///
    /// Existing directories are accepted; anything else in the way, including
    /// a symlink, is an error and is left where it is.
    pub fn create(&self, target: &Path) -> Result<()> {
        let relative = target.strip_prefix(&self.base).map_err(|_| {
            TmpdirError::Config(format!(
                "`{}` is not below base `{}`",
                target.display(),
                self.base.display()
            ))
        })?;

        let mut current = self.base.clone();
        for component in relative.components() {
            match component {
                Component::Normal(name) => current.push(name),
                Component::CurDir => continue,
                _ => {
                    return Err(TmpdirError::Config(format!(
                        "`{}` must not contain `..` or root components",
                        target.display()
                    )));
                }
            }
            self.ensure_dir(&current)?;
        }

        match std::fs::symlink_metadata(target) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(TmpdirError::NotADirectory(target.to_path_buf())),
            Err(source) => Err(TmpdirError::Create {
                path: target.to_path_buf(),
                source,
            }),
        }
    }

    fn ensure_dir(&self, path: &Path) -> Result<()> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) => return Err(TmpdirError::NotADirectory(path.to_path_buf())),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(TmpdirError::Create {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        match std::fs::DirBuilder::new().mode(DIR_MODE).create(path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), mode = %format!("{DIR_MODE:o}"), "created directory");
                Ok(())
            }
            // another task got there first
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match std::fs::symlink_metadata(path) {
                Ok(meta) if meta.is_dir() => Ok(()),
                _ => Err(TmpdirError::NotADirectory(path.to_path_buf())),
            },
            Err(source) => Err(TmpdirError::Create {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
