//! Bind mounts from a job's private directories onto shared mount points

use crate::config::IsolationConfig;
use crate::identity::JobIdentity;
use crate::path::{ResolvedPath, compose_path};
use crate::{Result, TmpdirError};
use std::ffi::{CString, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// One private directory shown at a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBinding {
    /// Directory that backs the mount point
    pub source: PathBuf,
    /// Where the job sees it
    pub target: PathBuf,
    /// Currently mounted in this process's namespace
    pub mounted: bool,
}

impl MountBinding {
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mounted: false,
        }
    }
}

/// The set of bind mounts made for one job, kept in mount order.
#[derive(Debug, Default)]
pub struct MountIsolation {
    bindings: Vec<MountBinding>,
    order_check: bool,
    in_namespace: bool,
}

impl MountIsolation {
    #[must_use]
    pub fn new(order_check: bool) -> Self {
        Self {
            order_check,
            ..Self::default()
        }
    }

    /// Plan the bindings `config` asks for around a resolved directory.
    ///
    /// Each mount target gets a source inside `resolved` named after the
    /// target (`/var/tmp` becomes `var_tmp`). The private `/dev/shm` source
    /// lives under the shm prefix and is never split per node.
    #[must_use]
    pub fn plan(
        config: &IsolationConfig,
        resolved: &ResolvedPath,
        identity: &JobIdentity,
        per_step: bool,
    ) -> Self {
        let mut isolation = Self::new(config.order_check);
        for target in config.mount_targets() {
            let source = resolved.path.join(flatten(&target));
            isolation.register(MountBinding::new(source, target));
        }
        if config.map_dev_shm {
            let source = compose_path(&config.dev_shm_prefix, identity, None, per_step);
            isolation.register(MountBinding::new(source, "/dev/shm"));
        }
        isolation
    }

    /// Track a binding. Repeated targets are ignored.
    pub fn register(&mut self, binding: MountBinding) {
        if self.bindings.iter().any(|b| b.target == binding.target) {
            tracing::warn!(target = %binding.target.display(), "ignoring repeated mount");
            return;
        }
        tracing::debug!(
            source = %binding.source.display(),
            target = %binding.target.display(),
            "added bind point"
        );
        self.bindings.push(binding);
        if self.order_check {
            self.reorder();
        }
    }

    /// Bindings in the order they are mounted.
    #[must_use]
    pub fn bindings(&self) -> &[MountBinding] {
        &self.bindings
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bindings.iter().any(|b| b.mounted)
    }

    /// Enter the private namespace (once) and mount every pending binding.
    pub fn bind_all(&mut self) -> Result<()> {
        if self.bindings.is_empty() {
            return Ok(());
        }
        if !self.in_namespace {
            super::namespace::enter_private_namespace()?;
            self.in_namespace = true;
        }
        for binding in &mut self.bindings {
            if binding.mounted {
                continue;
            }
            tracing::debug!(
                source = %binding.source.display(),
                target = %binding.target.display(),
                pid = std::process::id(),
                "bind mounting"
            );
            mount_bind(&binding.source, &binding.target)?;
            binding.mounted = true;
        }
        Ok(())
    }

    /// Undo the binding at `target`.
    ///
    /// Unknown, never-mounted and already-unmounted targets are a success.
    pub fn unbind(&mut self, target: &Path) -> Result<()> {
        let Some(binding) = self
            .bindings
            .iter_mut()
            .find(|b| b.target == target && b.mounted)
        else {
            return Ok(());
        };

        match umount(&binding.target) {
            Ok(()) => {
                tracing::debug!(target = %binding.target.display(), "unmounted bind point");
                binding.mounted = false;
                Ok(())
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::EINVAL | libc::ENOENT)) => {
                tracing::debug!(target = %binding.target.display(), "bind point already gone");
                binding.mounted = false;
                Ok(())
            }
            Err(e) => Err(TmpdirError::Mount(format!(
                "unable to unmount bind point {} -> {}: {e}",
                binding.target.display(),
                binding.source.display()
            ))),
        }
    }

    /// Unmount everything in reverse mount order.
    ///
    /// Returns the bindings that could not be unmounted; failures are
    /// logged, not escalated.
    pub fn unbind_all(&mut self) -> Vec<MountBinding> {
        let targets: Vec<PathBuf> = self
            .bindings
            .iter()
            .rev()
            .filter(|b| b.mounted)
            .map(|b| b.target.clone())
            .collect();

        let mut stuck = Vec::new();
        for target in targets {
            if let Err(e) = self.unbind(&target) {
                tracing::info!(error = %e, "bind point left mounted");
                if let Some(binding) = self.bindings.iter().find(|b| b.target == target) {
                    stuck.push(binding.clone());
                }
            }
        }
        stuck
    }

    /// Mount bindings that would hide another binding's source last.
    fn reorder(&mut self) {
        let shadows: Vec<bool> = self
            .bindings
            .iter()
            .map(|b| {
                self.bindings
                    .iter()
                    .any(|other| other.target != b.target && other.source.starts_with(&b.target))
            })
            .collect();
        let mut keyed: Vec<(bool, MountBinding)> =
            shadows.into_iter().zip(self.bindings.drain(..)).collect();
        keyed.sort_by_key(|(shadows, _)| *shadows);
        self.bindings = keyed.into_iter().map(|(_, b)| b).collect();
    }
}

/// `/var/tmp` -> `var_tmp`
fn flatten(target: &Path) -> PathBuf {
    let bytes = target.as_os_str().as_bytes();
    let trimmed = bytes.strip_prefix(b"/").unwrap_or(bytes);
    let flat: Vec<u8> = trimmed
        .iter()
        .map(|&c| if c == b'/' { b'_' } else { c })
        .collect();
    PathBuf::from(OsString::from_vec(flat))
}

// Helper functions for mount operations

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| TmpdirError::Mount(format!("invalid path {}: {}", path.display(), e)))
}

fn mount_bind(src: &Path, dst: &Path) -> Result<()> {
    let src_c = path_to_cstring(src)?;
    let dst_c = path_to_cstring(dst)?;

    // SAFETY: mount syscall with bind flag
    let ret = unsafe {
        libc::mount(
            src_c.as_ptr(),
            dst_c.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        )
    };

    if ret != 0 {
        return Err(TmpdirError::Mount(format!(
            "failed to bind mount {} to {}: {}",
            src.display(),
            dst.display(),
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

fn umount(path: &Path) -> std::io::Result<()> {
    let path_c = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: umount2 syscall
    let ret = unsafe { libc::umount2(path_c.as_ptr(), libc::MNT_FORCE) };

    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}
