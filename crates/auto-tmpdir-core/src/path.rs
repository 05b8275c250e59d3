//! Canonical directory paths for a job identity
//!
//! Base candidates are tried in priority order (override, shared, local
//! default) with one uniform accessibility check; the first usable one wins.
//! The job/step/task part is pure string composition.

use crate::identity::{JobIdentity, StepContext};
use crate::{Result, TmpdirConfig, TmpdirError};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Where a base directory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseSource {
    /// Explicit override
    Override,
    /// Shared-storage prefix
    Shared,
    /// Built-in node-local location
    LocalDefault,
}

impl std::fmt::Display for BaseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Override => "override",
            Self::Shared => "shared",
            Self::LocalDefault => "default",
        })
    }
}

/// One entry of the base preference chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseCandidate {
    pub source: BaseSource,
    pub path: PathBuf,
}

/// A composed directory path plus the base that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPath {
    /// Full directory path
    pub path: PathBuf,
    /// Base directory the path extends
    pub base: PathBuf,
    /// Which candidate the base came from
    pub source: BaseSource,
    /// Per-host segment, when sharding applied
    pub host: Option<String>,
    pub job_id: u32,
}

impl ResolvedPath {
    /// `{base}/job_{id}`, the directory shared by every step of the job.
    #[must_use]
    pub fn job_dir(&self) -> PathBuf {
        self.base.join(job_segment(self.job_id))
    }

    /// `{base}/job_{id}/{host}` when per-node sharding applied.
    #[must_use]
    pub fn node_dir(&self) -> Option<PathBuf> {
        self.host.as_ref().map(|host| self.job_dir().join(host))
    }

    /// Whether other nodes may be using the same job directory.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.source == BaseSource::Shared
    }
}

impl AsRef<Path> for ResolvedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Decides whether a base directory is usable.
pub trait AccessCheck {
    fn check(&self, path: &Path) -> std::io::Result<()>;
}

/// Read/write/search access for the current effective identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct EffectiveAccess;

impl AccessCheck for EffectiveAccess {
    fn check(&self, path: &Path) -> std::io::Result<()> {
        let path_c = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: path_c is a valid NUL-terminated string. AT_EACCESS checks
        // the effective ids, which is what a dropped PrivilegeScope changes.
        let ret = unsafe {
            libc::faccessat(
                libc::AT_FDCWD,
                path_c.as_ptr(),
                libc::R_OK | libc::W_OK | libc::X_OK,
                libc::AT_EACCESS,
            )
        };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }

        if std::fs::metadata(path)?.is_dir() {
            Ok(())
        } else {
            Err(std::io::Error::from_raw_os_error(libc::ENOTDIR))
        }
    }
}

/// Composes temporary-directory paths from a configuration record.
#[derive(Debug)]
pub struct PathResolver<'a, A = EffectiveAccess> {
    config: &'a TmpdirConfig,
    access: A,
    hostname: Option<String>,
}

impl<'a> PathResolver<'a> {
    #[must_use]
    pub const fn new(config: &'a TmpdirConfig) -> Self {
        Self {
            config,
            access: EffectiveAccess,
            hostname: None,
        }
    }
}

impl<'a, A: AccessCheck> PathResolver<'a, A> {
    /// Swap the accessibility check.
    #[must_use]
    pub fn with_access<B: AccessCheck>(self, access: B) -> PathResolver<'a, B> {
        PathResolver {
            config: self.config,
            access,
            hostname: self.hostname,
        }
    }

    /// Use a fixed host name instead of asking the kernel.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Base candidates in priority order.
    #[must_use]
    pub fn candidates(&self) -> Vec<BaseCandidate> {
        let mut candidates = Vec::with_capacity(3);
        if let Some(path) = &self.config.tmpdir_override {
            candidates.push(BaseCandidate {
                source: BaseSource::Override,
                path: path.clone(),
            });
        }
        if self.config.use_shared {
            if let Some(path) = &self.config.shared_prefix {
                candidates.push(BaseCandidate {
                    source: BaseSource::Shared,
                    path: path.clone(),
                });
            }
        }
        candidates.push(BaseCandidate {
            source: BaseSource::LocalDefault,
            path: self.config.local_prefix.clone(),
        });
        candidates
    }

    /// Resolve the directory for `identity`.
    ///
    /// With `escape_per_node` the per-host segment is left out, giving the
    /// path the whole job maps to.
    pub fn resolve(&self, identity: &JobIdentity, escape_per_node: bool) -> Result<ResolvedPath> {
        let mut tried = Vec::new();

        for candidate in self.candidates() {
            match self.access.check(&candidate.path) {
                Ok(()) => {
                    if !tried.is_empty() {
                        tracing::warn!(
                            base = %candidate.path.display(),
                            source = %candidate.source,
                            "falling back to base directory"
                        );
                    }
                    return self.compose(&candidate, identity, escape_per_node);
                }
                Err(e) => {
                    tracing::warn!(
                        base = %candidate.path.display(),
                        source = %candidate.source,
                        error = %e,
                        "base directory is not accessible"
                    );
                    tried.push(format!(
                        "{} `{}`: {e}",
                        candidate.source,
                        candidate.path.display()
                    ));
                }
            }
        }

        Err(TmpdirError::PathResolution {
            path: compose_path(&self.config.local_prefix, identity, None, self.config.per_step),
            tried,
        })
    }

    fn compose(
        &self,
        candidate: &BaseCandidate,
        identity: &JobIdentity,
        escape_per_node: bool,
    ) -> Result<ResolvedPath> {
        let host = if self.config.per_node
            && candidate.source == BaseSource::Shared
            && !escape_per_node
        {
            Some(match &self.hostname {
                Some(host) => host.clone(),
                None => short_hostname()?,
            })
        } else {
            None
        };

        Ok(ResolvedPath {
            path: compose_path(
                &candidate.path,
                identity,
                host.as_deref(),
                self.config.per_step,
            ),
            base: candidate.path.clone(),
            source: candidate.source,
            host,
            job_id: identity.job_id,
        })
    }
}

/// Apply one of the four layout templates.
///
/// Job-wide step contexts never get a step segment.
#[must_use]
pub fn compose_path(
    base: &Path,
    identity: &JobIdentity,
    host: Option<&str>,
    per_step: bool,
) -> PathBuf {
    let mut path = base.join(job_segment(identity.job_id));
    if let Some(host) = host {
        path.push(host);
    }
    if per_step {
        if let StepContext::Parallel(step_id) = identity.step {
            path.push(format!("step_{step_id}.{}", identity.task_id));
        }
    }
    path
}

fn job_segment(job_id: u32) -> String {
    format!("job_{job_id}")
}

/// Host name up to the first dot.
pub fn short_hostname() -> Result<String> {
    let hostname = nix::unistd::gethostname()?;
    let hostname = hostname.to_string_lossy();
    let short = hostname.split('.').next().unwrap_or_default();
    if short.is_empty() {
        return Err(TmpdirError::Config("host name is empty".into()));
    }
    Ok(short.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{BATCH_STEP_ID, EXTERN_STEP_ID};

    /// Everything is accessible except the listed paths.
    struct Deny(Vec<PathBuf>);

    impl AccessCheck for Deny {
        fn check(&self, path: &Path) -> std::io::Result<()> {
            if self.0.iter().any(|p| p == path) {
                Err(std::io::Error::from_raw_os_error(libc::EACCES))
            } else {
                Ok(())
            }
        }
    }

    fn resolve(config: &TmpdirConfig, identity: JobIdentity) -> ResolvedPath {
        PathResolver::new(config)
            .with_access(Deny(vec![]))
            .with_hostname("node07")
            .resolve(&identity, false)
            .unwrap()
    }

    #[test]
    fn per_step_path_on_default_base() {
        let config = TmpdirConfig::default();
        let resolved = resolve(&config, JobIdentity::from_raw(42, 3, 0));
        assert_eq!(resolved.path, PathBuf::from("/tmp/job_42/step_3.0"));
        assert_eq!(resolved.source, BaseSource::LocalDefault);
        assert_eq!(resolved.job_dir(), PathBuf::from("/tmp/job_42"));
    }

    #[test]
    fn batch_and_extern_never_get_step_segment() {
        let config = TmpdirConfig::default();
        for step in [BATCH_STEP_ID, EXTERN_STEP_ID] {
            let resolved = resolve(&config, JobIdentity::from_raw(42, step, 9));
            assert_eq!(resolved.path, PathBuf::from("/tmp/job_42"));
        }
    }

    #[test]
    fn per_step_disabled_gives_job_dir() {
        let config = TmpdirConfig::builder().per_step(false).build().unwrap();
        let resolved = resolve(&config, JobIdentity::from_raw(42, 3, 0));
        assert_eq!(resolved.path, PathBuf::from("/tmp/job_42"));
    }

    #[test]
    fn override_wins() {
        let config = TmpdirConfig::builder()
            .tmpdir_override("/scratch/tmp")
            .shared("/gpfs/tmp")
            .build()
            .unwrap();
        let resolved = resolve(&config, JobIdentity::from_raw(42, 3, 0));
        assert_eq!(resolved.path, PathBuf::from("/scratch/tmp/job_42/step_3.0"));
        assert_eq!(resolved.source, BaseSource::Override);
    }

    #[test]
    fn inaccessible_override_falls_back_to_default() {
        let config = TmpdirConfig::builder()
            .tmpdir_override("/scratch/tmp")
            .build()
            .unwrap();
        let resolved = PathResolver::new(&config)
            .with_access(Deny(vec![PathBuf::from("/scratch/tmp")]))
            .resolve(&JobIdentity::from_raw(42, 3, 0), false)
            .unwrap();
        assert_eq!(resolved.path, PathBuf::from("/tmp/job_42/step_3.0"));
        assert_eq!(resolved.source, BaseSource::LocalDefault);
    }

    #[test]
    fn fallback_visits_shared_before_default() {
        let config = TmpdirConfig::builder()
            .tmpdir_override("/scratch/tmp")
            .shared("/gpfs/tmp")
            .build()
            .unwrap();
        let resolved = PathResolver::new(&config)
            .with_access(Deny(vec![PathBuf::from("/scratch/tmp")]))
            .resolve(&JobIdentity::from_raw(42, 3, 0), false)
            .unwrap();
        assert_eq!(resolved.source, BaseSource::Shared);
        assert_eq!(resolved.path, PathBuf::from("/gpfs/tmp/job_42/step_3.0"));
    }

    #[test]
    fn no_viable_base_lists_every_candidate() {
        let config = TmpdirConfig::builder()
            .tmpdir_override("/scratch/tmp")
            .build()
            .unwrap();
        let err = PathResolver::new(&config)
            .with_access(Deny(vec![
                PathBuf::from("/scratch/tmp"),
                PathBuf::from("/tmp"),
            ]))
            .resolve(&JobIdentity::from_raw(42, 3, 0), false)
            .unwrap_err();
        match err {
            TmpdirError::PathResolution { path, tried } => {
                assert_eq!(path, PathBuf::from("/tmp/job_42/step_3.0"));
                assert_eq!(tried.len(), 2);
                assert!(tried[0].starts_with("override `/scratch/tmp`"));
                assert!(tried[1].starts_with("default `/tmp`"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn per_node_sharding_only_on_shared_storage() {
        let config = TmpdirConfig::builder()
            .shared("/gpfs/tmp")
            .per_node(true)
            .build()
            .unwrap();
        let resolved = resolve(&config, JobIdentity::from_raw(42, 3, 1));
        assert_eq!(
            resolved.path,
            PathBuf::from("/gpfs/tmp/job_42/node07/step_3.1")
        );
        assert_eq!(resolved.node_dir(), Some(PathBuf::from("/gpfs/tmp/job_42/node07")));

        let fallback = PathResolver::new(&config)
            .with_access(Deny(vec![PathBuf::from("/gpfs/tmp")]))
            .with_hostname("node07")
            .resolve(&JobIdentity::from_raw(42, 3, 1), false)
            .unwrap();
        assert_eq!(fallback.path, PathBuf::from("/tmp/job_42/step_3.1"));
        assert_eq!(fallback.host, None);
    }

    #[test]
    fn per_node_escape_drops_host_segment() {
        let config = TmpdirConfig::builder()
            .shared("/gpfs/tmp")
            .per_node(true)
            .per_step(false)
            .build()
            .unwrap();
        let resolved = PathResolver::new(&config)
            .with_access(Deny(vec![]))
            .with_hostname("node07")
            .resolve(&JobIdentity::from_raw(42, EXTERN_STEP_ID, 0), true)
            .unwrap();
        assert_eq!(resolved.path, PathBuf::from("/gpfs/tmp/job_42"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let config = TmpdirConfig::builder()
            .shared("/gpfs/tmp")
            .per_node(true)
            .build()
            .unwrap();
        for (job, step, task) in [(1, 0, 0), (42, 3, 0), (u32::MAX, 17, 4), (7, EXTERN_STEP_ID, 0)] {
            let identity = JobIdentity::from_raw(job, step, task);
            assert_eq!(resolve(&config, identity), resolve(&config, identity));
        }
    }

    #[test]
    fn effective_access_rejects_missing_and_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EffectiveAccess.check(dir.path()).is_ok());
        assert!(EffectiveAccess.check(&dir.path().join("missing")).is_err());

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let err = EffectiveAccess.check(&file).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
    }
}
