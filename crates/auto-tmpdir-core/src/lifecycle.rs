//! Provision, export and teardown of a job's temporary directory
//!
//! Every filesystem mutation runs under a [`PrivilegeScope`] for the job's
//! owner. Which context may delete the job-level directory is decided by
//! [`CleanupPolicy`]; nothing else coordinates peer processes.
//!
//! [`PrivilegeScope`]: crate::privilege::PrivilegeScope

use crate::builder::DirectoryBuilder;
use crate::config::{IsolationConfig, TmpdirConfig};
use crate::identity::{Credentials, HostRole, JobContext, JobIdentity, JobStep, StepContext};
use crate::isolation::MountIsolation;
use crate::path::{BaseSource, PathResolver, ResolvedPath, compose_path};
use crate::privilege::with_identity;
use crate::remover::{RemovalScope, SecureTreeRemover};
use crate::{Result, TmpdirError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable the job sees its directory through.
pub const TMPDIR_VAR: &str = "TMPDIR";

/// Which job-wide context owns the job-level directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// The extern context owns node-local and per-node directories; the
    /// batch context, which runs once on the head node, owns a single
    /// shared job directory.
    #[default]
    Standard,
    /// The extern context owns every job-level directory.
    ExternOnly,
    /// The batch context owns every job-level directory.
    BatchOnly,
}

/// What one context deletes at exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// This context deletes nothing
    Nothing,
    /// The step's own subdirectory
    Step(PathBuf),
    /// The job-level directory, then a non-recursive `rmdir` of `collapse`
    Job {
        path: PathBuf,
        collapse: Option<PathBuf>,
    },
}

impl CleanupPolicy {
    /// Whether the job-wide context `step` is the cleanup owner for `resolved`.
    #[must_use]
    pub fn owns(self, step: JobStep, resolved: &ResolvedPath) -> bool {
        match self {
            Self::Standard => {
                let single_shared = resolved.is_shared() && resolved.host.is_none();
                match step {
                    JobStep::Batch => single_shared,
                    JobStep::Extern => !single_shared,
                }
            }
            Self::ExternOnly => step == JobStep::Extern,
            Self::BatchOnly => step == JobStep::Batch,
        }
    }

    /// Decide what `identity` removes when it exits.
    ///
    /// Parallel steps only ever remove their own step directory, and only
    /// when per-step directories are enabled.
    #[must_use]
    pub fn removal(self, identity: &JobIdentity, resolved: &ResolvedPath, per_step: bool) -> Removal {
        match identity.step {
            StepContext::Parallel(_) if per_step => Removal::Step(resolved.path.clone()),
            StepContext::Parallel(_) => Removal::Nothing,
            StepContext::Job(step) if self.owns(step, resolved) => match resolved.node_dir() {
                Some(node_dir) => Removal::Job {
                    path: node_dir,
                    collapse: Some(resolved.job_dir()),
                },
                None => Removal::Job {
                    path: resolved.job_dir(),
                    collapse: None,
                },
            },
            StepContext::Job(_) => Removal::Nothing,
        }
    }
}

/// Coordinator states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Provisioned,
    Bound,
    Active,
    TornDown,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Provisioned => "provisioned",
            Self::Bound => "bound",
            Self::Active => "active",
            Self::TornDown => "torn down",
        })
    }
}

/// Drives one identity through provision, bind, export and teardown.
///
/// `C` is a borrowed, owned or shared [`TmpdirConfig`]. Mounts made by
/// [`bind`](Self::bind) belong to this process's namespace, so only the
/// coordinator that made them can unbind them.
#[derive(Debug)]
pub struct TmpdirLifecycle<C: AsRef<TmpdirConfig>> {
    config: C,
    identity: JobIdentity,
    owner: Credentials,
    hostname: Option<String>,
    state: LifecycleState,
    resolved: Option<ResolvedPath>,
    isolation: Option<MountIsolation>,
}

impl<C: AsRef<TmpdirConfig>> TmpdirLifecycle<C> {
    #[must_use]
    pub fn new(config: C, identity: JobIdentity, owner: Credentials) -> Self {
        Self {
            config,
            identity,
            owner,
            hostname: None,
            state: LifecycleState::Uninitialized,
            resolved: None,
            isolation: None,
        }
    }

    /// Use a fixed host name for per-node paths.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    #[must_use]
    pub const fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    #[must_use]
    pub const fn resolved(&self) -> Option<&ResolvedPath> {
        self.resolved.as_ref()
    }

    #[must_use]
    pub const fn isolation(&self) -> Option<&MountIsolation> {
        self.isolation.as_ref()
    }

    /// Resolve and create the directory tree as the job's owner.
    ///
    /// Repeating the call after success returns the same path.
    pub fn provision(&mut self) -> Result<&ResolvedPath> {
        match self.state {
            LifecycleState::Uninitialized => {}
            LifecycleState::TornDown => {
                return Err(self.out_of_order("provision"));
            }
            _ => {
                return self
                    .resolved
                    .as_ref()
                    .ok_or_else(|| TmpdirError::Lifecycle("provisioned without a path".into()));
            }
        }

        let config = self.config.as_ref();
        let identity = self.identity;
        let hostname = self.hostname.clone();

        let (resolved, isolation) = with_identity(self.owner, || {
            let mut resolver = PathResolver::new(config);
            if let Some(host) = hostname {
                resolver = resolver.with_hostname(host);
            }
            let resolved = resolver.resolve(&identity, false)?;
            DirectoryBuilder::new(&resolved.base).create(&resolved.path)?;

            let isolation = match &config.isolation {
                Some(iso) => Some(create_bind_sources(iso, &resolved, &identity, config.per_step)?),
                None => None,
            };
            Ok((resolved, isolation))
        })
        .inspect_err(|e| {
            tracing::error!(job = %identity, error = %e, "unable to provision temporary directory");
        })?;

        tracing::info!(
            job = %identity,
            path = %resolved.path.display(),
            source = %resolved.source,
            "provisioned temporary directory"
        );

        // nothing to mount: the job keeps its resolved directory
        self.isolation = isolation.filter(|plan| !plan.bindings().is_empty());
        self.state = LifecycleState::Provisioned;
        Ok(&*self.resolved.insert(resolved))
    }

    /// Enter the private namespace and mount the planned bindings.
    ///
    /// Without isolation configured, or with nothing to mount, this is a
    /// no-op and the state stays `Provisioned`.
    pub fn bind(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Provisioned => {}
            LifecycleState::Bound => return Ok(()),
            _ => return Err(self.out_of_order("bind")),
        }

        let Some(isolation) = self.isolation.as_mut() else {
            tracing::debug!(job = %self.identity, "no bind mounts to set up");
            return Ok(());
        };

        isolation.bind_all().inspect_err(|e| {
            tracing::error!(job = %self.identity, error = %e, "unable to set up bind isolation");
        })?;
        self.state = LifecycleState::Bound;
        Ok(())
    }

    /// Mark the directory as in use and return the variable to export.
    pub fn activate(&mut self) -> Result<(String, String)> {
        if !matches!(
            self.state,
            LifecycleState::Provisioned | LifecycleState::Bound | LifecycleState::Active
        ) {
            return Err(self.out_of_order("activate"));
        }

        let path = match (&self.config.as_ref().isolation, self.state) {
            (Some(iso), LifecycleState::Bound) => iso.exported_path(),
            _ => self
                .resolved
                .as_ref()
                .map(|r| r.path.clone())
                .ok_or_else(|| TmpdirError::Lifecycle("active without a path".into()))?,
        };
        self.state = LifecycleState::Active;
        Ok(export_path(&path))
    }

    /// Unmount, then remove whatever this context owns.
    ///
    /// Runs from any state. Once removal has been attempted later calls do
    /// nothing; a privilege failure before that leaves the state unchanged
    /// so the call can be repeated. Failures are logged and the first one
    /// is returned.
    pub fn teardown(&mut self) -> Result<()> {
        if self.state == LifecycleState::TornDown {
            return Ok(());
        }

        let mut errors = ErrorSlot::default();

        if let Some(isolation) = self.isolation.as_mut() {
            for stuck in isolation.unbind_all() {
                tracing::info!(
                    target = %stuck.target.display(),
                    "removing contents of mount point that could not be unmounted"
                );
                errors.note(remove_tree(self.owner, &stuck.target, RemovalScope::ContentsOnly));
            }
        }

        let resolved = match &self.resolved {
            Some(resolved) => Some(resolved.clone()),
            None => resolve_for_teardown(self.config.as_ref(), &self.identity, self.owner)?,
        };
        if let Some(resolved) = resolved {
            errors.note(remove_owned(self.config.as_ref(), &self.identity, self.owner, &resolved));
        }
        self.state = LifecycleState::TornDown;
        errors.finish()
    }

    fn out_of_order(&self, operation: &str) -> TmpdirError {
        TmpdirError::Lifecycle(format!(
            "cannot {operation} job {} while {}",
            self.identity, self.state
        ))
    }
}

impl<C: AsRef<TmpdirConfig>> Drop for TmpdirLifecycle<C> {
    fn drop(&mut self) {
        if self.isolation.as_ref().is_some_and(MountIsolation::is_bound) {
            tracing::warn!(job = %self.identity, "dropping coordinator with bind mounts in place");
        }
    }
}

/// Resolve and create the directory tree for `identity`.
///
/// Bind sources are created too when isolation is configured, but nothing is
/// mounted; mounting needs a [`TmpdirLifecycle`] that lives as long as the job.
pub fn provision(
    identity: &JobIdentity,
    owner: Credentials,
    config: &TmpdirConfig,
) -> Result<ResolvedPath> {
    let mut lifecycle = TmpdirLifecycle::new(config, *identity, owner);
    lifecycle.provision().cloned()
}

/// The `TMPDIR` assignment for a resolved directory.
#[must_use]
pub fn export(resolved: &ResolvedPath) -> (String, String) {
    export_path(&resolved.path)
}

/// Remove what `identity` owns. Idempotent; never unmounts.
pub fn teardown(identity: &JobIdentity, owner: Credentials, config: &TmpdirConfig) -> Result<()> {
    let Some(resolved) = resolve_for_teardown(config, identity, owner)? else {
        return Ok(());
    };
    remove_owned(config, identity, owner, &resolved)
}

/// Provision or tear down, depending on what the host is doing.
pub fn dispatch(context: &JobContext, config: &TmpdirConfig) -> Result<Option<ResolvedPath>> {
    match context.role {
        HostRole::PrepareEnvironment => {
            provision(&context.identity, context.owner, config).map(Some)
        }
        HostRole::PrivilegedCleanup => {
            teardown(&context.identity, context.owner, config).map(|()| None)
        }
    }
}

fn export_path(path: &Path) -> (String, String) {
    (TMPDIR_VAR.to_owned(), path.to_string_lossy().into_owned())
}

fn create_bind_sources(
    iso: &IsolationConfig,
    resolved: &ResolvedPath,
    identity: &JobIdentity,
    per_step: bool,
) -> Result<MountIsolation> {
    let isolation = MountIsolation::plan(iso, resolved, identity, per_step);
    let tree = DirectoryBuilder::new(&resolved.base);
    let shm = DirectoryBuilder::new(&iso.dev_shm_prefix);
    for binding in isolation.bindings() {
        if binding.source.starts_with(&resolved.path) {
            tree.create(&binding.source)?;
        } else {
            shm.create(&binding.source)?;
        }
    }
    Ok(isolation)
}

/// The directory to tear down; `None` when no base is usable any more.
fn resolve_for_teardown(
    config: &TmpdirConfig,
    identity: &JobIdentity,
    owner: Credentials,
) -> Result<Option<ResolvedPath>> {
    match with_identity(owner, || PathResolver::new(config).resolve(identity, false)) {
        Ok(resolved) => Ok(Some(resolved)),
        Err(e @ TmpdirError::Privilege(_)) => Err(e),
        Err(e) => {
            tracing::debug!(job = %identity, error = %e, "nothing to tear down");
            Ok(None)
        }
    }
}

/// The private `/dev/shm` directory, which is node-local and never sharded.
fn dev_shm_dir(iso: &IsolationConfig, identity: &JobIdentity, per_step: bool) -> ResolvedPath {
    ResolvedPath {
        path: compose_path(&iso.dev_shm_prefix, identity, None, per_step),
        base: iso.dev_shm_prefix.clone(),
        source: BaseSource::LocalDefault,
        host: None,
        job_id: identity.job_id,
    }
}

fn remove_owned(
    config: &TmpdirConfig,
    identity: &JobIdentity,
    owner: Credentials,
    resolved: &ResolvedPath,
) -> Result<()> {
    let mut errors = ErrorSlot::default();

    if config.should_remove(resolved.source) {
        let removal = config.cleanup.removal(identity, resolved, config.per_step);
        errors.note(apply(owner, removal));
    } else {
        tracing::debug!(job = %identity, path = %resolved.path.display(), "keeping temporary directory");
    }

    if let Some(iso) = &config.isolation {
        if iso.map_dev_shm {
            let shm = dev_shm_dir(iso, identity, config.per_step);
            errors.note(apply(owner, config.cleanup.removal(identity, &shm, config.per_step)));
        }
    }

    errors.finish()
}

fn apply(owner: Credentials, removal: Removal) -> Result<()> {
    match removal {
        Removal::Nothing => Ok(()),
        Removal::Step(path) => remove_tree(owner, &path, RemovalScope::Tree),
        Removal::Job { path, collapse } => {
            remove_tree(owner, &path, RemovalScope::Tree)?;
            if let Some(job_dir) = collapse {
                collapse_job_dir(owner, &job_dir);
            }
            Ok(())
        }
    }
}

fn remove_tree(owner: Credentials, path: &Path, scope: RemovalScope) -> Result<()> {
    let report = with_identity(owner, || {
        SecureTreeRemover::new(owner.uid).scope(scope).remove(path)
    })?;
    if report.root_present {
        tracing::info!(
            path = %path.display(),
            entries = report.removed.len(),
            "removed temporary directory"
        );
    }
    Ok(())
}

/// Remove the shared job directory if this was the last node using it.
fn collapse_job_dir(owner: Credentials, job_dir: &Path) {
    match with_identity(owner, || std::fs::remove_dir(job_dir).map_err(TmpdirError::from)) {
        Ok(()) => tracing::info!(path = %job_dir.display(), "removed job directory"),
        Err(e) => tracing::debug!(path = %job_dir.display(), error = %e, "job directory left in place"),
    }
}

/// Keeps the first teardown failure and logs the rest.
#[derive(Default)]
struct ErrorSlot(Option<TmpdirError>);

impl ErrorSlot {
    fn note(&mut self, result: Result<()>) {
        if let Err(e) = result {
            tracing::debug!(error = %e, "teardown step failed");
            self.0.get_or_insert(e);
        }
    }

    fn finish(self) -> Result<()> {
        self.0.map_or(Ok(()), Err)
    }
}
