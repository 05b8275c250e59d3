//! Temporary-directory configuration
//!
//! The record is built once (from a file, flags, or the C ABI), validated,
//! and then only ever passed by reference.

use crate::lifecycle::CleanupPolicy;
use crate::path::BaseSource;
use crate::{Result, TmpdirError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Built-in node-local base directory.
pub const DEFAULT_LOCAL_PREFIX: &str = "/tmp";

/// Built-in base for the private `/dev/shm` directories.
pub const DEFAULT_DEV_SHM_PREFIX: &str = "/dev/shm";

/// Configuration for per-job temporary directories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmpdirConfig {
    /// Explicit base directory; wins over shared storage when set
    pub tmpdir_override: Option<PathBuf>,

    /// Node-local base used when nothing else applies
    pub local_prefix: PathBuf,

    /// Base directory on shared storage
    pub shared_prefix: Option<PathBuf>,

    /// Put directories on shared storage
    pub use_shared: bool,

    /// Add a per-host segment under shared storage
    pub per_node: bool,

    /// Give every parallel step its own subdirectory
    pub per_step: bool,

    /// Remove directories when the job/step exits
    pub remove_on_exit: bool,

    /// Only honour `remove_on_exit = false` for shared-storage directories
    pub keep_shared_only: bool,

    /// Private mount namespace with bind-mounted directories
    pub isolation: Option<IsolationConfig>,

    /// Which job-wide context removes job-level directories
    pub cleanup: CleanupPolicy,
}

impl Default for TmpdirConfig {
    fn default() -> Self {
        Self {
            tmpdir_override: None,
            local_prefix: PathBuf::from(DEFAULT_LOCAL_PREFIX),
            shared_prefix: None,
            use_shared: false,
            per_node: false,
            per_step: true,
            remove_on_exit: true,
            keep_shared_only: false,
            isolation: None,
            cleanup: CleanupPolicy::default(),
        }
    }
}

impl TmpdirConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> TmpdirConfigBuilder {
        TmpdirConfigBuilder::default()
    }

    /// Reject relative paths and contradictory settings.
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.tmpdir_override {
            require_absolute("tmpdir override", path)?;
        }
        require_absolute("local prefix", &self.local_prefix)?;
        if let Some(path) = &self.shared_prefix {
            require_absolute("shared prefix", path)?;
        }
        if self.use_shared && self.shared_prefix.is_none() && self.tmpdir_override.is_none() {
            return Err(TmpdirError::Config(
                "shared tmp directory requested but no shared prefix is configured".into(),
            ));
        }
        if let Some(isolation) = &self.isolation {
            isolation.validate()?;
        }
        Ok(())
    }

    /// Whether a tree that came from `source` is removed at exit.
    #[must_use]
    pub fn should_remove(&self, source: BaseSource) -> bool {
        self.remove_on_exit || (self.keep_shared_only && source != BaseSource::Shared)
    }
}

impl AsRef<Self> for TmpdirConfig {
    fn as_ref(&self) -> &Self {
        self
    }
}

fn require_absolute(what: &str, path: &Path) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(TmpdirError::Config(format!(
            "invalid {what} `{}`: not an absolute path",
            path.display()
        )))
    }
}

/// Bind-mount isolation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Paths inside the job's namespace that get a private directory
    pub mounts: Vec<PathBuf>,

    /// Bind a private directory over `/dev/shm`
    pub map_dev_shm: bool,

    /// Base for the private `/dev/shm` directories
    pub dev_shm_prefix: PathBuf,

    /// Mount bindings that shadow other sources last
    pub order_check: bool,

    /// Value exported as `TMPDIR`; first mount target when unset
    pub export_path: Option<PathBuf>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            mounts: vec![PathBuf::from(DEFAULT_LOCAL_PREFIX)],
            map_dev_shm: true,
            dev_shm_prefix: PathBuf::from(DEFAULT_DEV_SHM_PREFIX),
            order_check: true,
            export_path: None,
        }
    }
}

impl IsolationConfig {
    pub fn validate(&self) -> Result<()> {
        for target in &self.mounts {
            require_absolute("mount", target)?;
            if normalize(target) == Path::new("/") {
                return Err(TmpdirError::Config(
                    "mounting over the root directory is not supported".into(),
                ));
            }
        }
        require_absolute("dev shm prefix", &self.dev_shm_prefix)?;
        if let Some(path) = &self.export_path {
            require_absolute("export path", path)?;
        }
        Ok(())
    }

    /// Mount targets with trailing separators stripped and repeats dropped.
    #[must_use]
    pub fn mount_targets(&self) -> Vec<PathBuf> {
        let mut targets: Vec<PathBuf> = Vec::with_capacity(self.mounts.len());
        for target in &self.mounts {
            let target = normalize(target);
            if targets.contains(&target) {
                tracing::warn!(mount = %target.display(), "ignoring repeated mount");
                continue;
            }
            targets.push(target);
        }
        targets
    }

    /// Path the job sees as its temporary directory.
    #[must_use]
    pub fn exported_path(&self) -> PathBuf {
        self.export_path
            .clone()
            .or_else(|| self.mount_targets().into_iter().next())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_PREFIX))
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Builder for `TmpdirConfig`
#[derive(Debug, Default)]
pub struct TmpdirConfigBuilder {
    config: TmpdirConfig,
}

impl TmpdirConfigBuilder {
    #[must_use]
    pub fn tmpdir_override(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tmpdir_override = Some(path.into());
        self
    }

    #[must_use]
    pub fn local_prefix(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.local_prefix = path.into();
        self
    }

    /// Enable shared storage under `prefix`
    #[must_use]
    pub fn shared(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.config.shared_prefix = Some(prefix.into());
        self.config.use_shared = true;
        self
    }

    #[must_use]
    pub fn per_node(mut self, enabled: bool) -> Self {
        self.config.per_node = enabled;
        self
    }

    #[must_use]
    pub fn per_step(mut self, enabled: bool) -> Self {
        self.config.per_step = enabled;
        self
    }

    #[must_use]
    pub fn remove_on_exit(mut self, enabled: bool) -> Self {
        self.config.remove_on_exit = enabled;
        self
    }

    #[must_use]
    pub fn keep_shared_only(mut self, enabled: bool) -> Self {
        self.config.keep_shared_only = enabled;
        self
    }

    #[must_use]
    pub fn isolation(mut self, isolation: IsolationConfig) -> Self {
        self.config.isolation = Some(isolation);
        self
    }

    #[must_use]
    pub fn cleanup(mut self, policy: CleanupPolicy) -> Self {
        self.config.cleanup = policy;
        self
    }

    /// Validate and return the finished record.
    pub fn build(self) -> Result<TmpdirConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Get default config file path from `AUTO_TMPDIR_CONFIG` or system default
///
/// Returns:
/// - `$AUTO_TMPDIR_CONFIG` if set
/// - `/etc/auto-tmpdir/config.json` otherwise
pub fn default_config_path() -> PathBuf {
    std::env::var("AUTO_TMPDIR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/auto-tmpdir/config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_plain_layout() {
        let config = TmpdirConfig::default();
        assert_eq!(config.local_prefix, PathBuf::from("/tmp"));
        assert!(config.per_step);
        assert!(config.remove_on_exit);
        assert!(!config.use_shared);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn relative_override_is_rejected() {
        let err = TmpdirConfig::builder()
            .tmpdir_override("scratch/tmp")
            .build()
            .unwrap_err();
        assert!(matches!(err, TmpdirError::Config(ref msg) if msg.contains("scratch/tmp")));
    }

    #[test]
    fn shared_without_prefix_is_rejected() {
        let config = TmpdirConfig {
            use_shared: true,
            ..TmpdirConfig::default()
        };
        assert!(matches!(config.validate(), Err(TmpdirError::Config(_))));
    }

    #[test]
    fn isolation_rejects_root_and_relative_mounts() {
        let root = IsolationConfig {
            mounts: vec![PathBuf::from("/")],
            ..IsolationConfig::default()
        };
        assert!(root.validate().is_err());

        let relative = IsolationConfig {
            mounts: vec![PathBuf::from("var/tmp")],
            ..IsolationConfig::default()
        };
        assert!(relative.validate().is_err());
    }

    #[test]
    fn mount_targets_drop_repeats_and_trailing_slashes() {
        let isolation = IsolationConfig {
            mounts: vec![
                PathBuf::from("/tmp/"),
                PathBuf::from("/var/tmp"),
                PathBuf::from("/tmp"),
            ],
            ..IsolationConfig::default()
        };
        assert_eq!(
            isolation.mount_targets(),
            vec![PathBuf::from("/tmp"), PathBuf::from("/var/tmp")]
        );
        assert_eq!(isolation.exported_path(), PathBuf::from("/tmp"));
    }

    #[test]
    fn keep_shared_only_still_removes_local_trees() {
        let config = TmpdirConfig::builder()
            .remove_on_exit(false)
            .keep_shared_only(true)
            .build()
            .unwrap();
        assert!(config.should_remove(BaseSource::LocalDefault));
        assert!(config.should_remove(BaseSource::Override));
        assert!(!config.should_remove(BaseSource::Shared));
    }

    #[test]
    fn config_file_fields_are_optional() {
        let config: TmpdirConfig =
            serde_json::from_str(r#"{"shared_prefix": "/gpfs/tmp", "use_shared": true}"#).unwrap();
        assert_eq!(config.shared_prefix, Some(PathBuf::from("/gpfs/tmp")));
        assert!(config.per_step);
        assert!(config.validate().is_ok());
    }
}
