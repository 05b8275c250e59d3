//! Scoped impersonation of the job's user.
//!
//! Entry order is supplementary groups, gid, uid. Restore order is the
//! reverse: once the uid is dropped the process no longer has the right to
//! change its gid, and once the uid is restored it has it again.

use crate::identity::Credentials;
use crate::{Result, TmpdirError};
use nix::unistd::{Gid, getgroups, setegid, seteuid, setgroups};

/// Effective identity switched to a job's credentials until dropped.
///
/// Dropping the scope restores whatever `enter` changed. Use [`Self::exit`]
/// to observe restore failures.
#[derive(Debug)]
#[must_use = "dropping the scope restores the original identity immediately"]
pub struct PrivilegeScope {
    original: Credentials,
    target: Credentials,
    saved_groups: Option<Vec<Gid>>,
    changed_gid: bool,
    changed_uid: bool,
    restored: bool,
}

impl PrivilegeScope {
    /// Switch the effective identity to `target`.
    ///
    /// Only the ids that differ from the current ones are touched. On any
    /// failure the partial change is rolled back before returning.
    pub fn enter(target: Credentials) -> Result<Self> {
        let original = Credentials::current();
        let mut scope = Self {
            original,
            target,
            saved_groups: None,
            changed_gid: false,
            changed_uid: false,
            restored: false,
        };

        if target.uid != original.uid {
            // The control process's supplementary groups must not leak into
            // the impersonated identity.
            let groups = getgroups().map_err(|e| {
                TmpdirError::Privilege(format!("failed to read supplementary groups: {e}"))
            })?;
            setgroups(&[target.gid]).map_err(|e| {
                TmpdirError::Privilege(format!(
                    "failed to set supplementary groups to {}: {e}",
                    target.gid
                ))
            })?;
            scope.saved_groups = Some(groups);
        }

        if target.gid != original.gid {
            setegid(target.gid).map_err(|e| {
                TmpdirError::Privilege(format!("setegid({}) failed: {e}", target.gid))
            })?;
            scope.changed_gid = true;
        }

        if target.uid != original.uid {
            seteuid(target.uid).map_err(|e| {
                TmpdirError::Privilege(format!("seteuid({}) failed: {e}", target.uid))
            })?;
            scope.changed_uid = true;
        }

        tracing::debug!(
            uid = target.uid.as_raw(),
            gid = target.gid.as_raw(),
            "entered privilege scope"
        );
        Ok(scope)
    }

    /// Credentials in effect inside the scope.
    #[must_use]
    pub const fn target(&self) -> Credentials {
        self.target
    }

    /// Restore the original identity, reporting failure.
    pub fn exit(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;

        if self.changed_uid {
            seteuid(self.original.uid).map_err(|e| {
                TmpdirError::Privilege(format!(
                    "failed to restore uid {}: {e}",
                    self.original.uid
                ))
            })?;
            self.changed_uid = false;
        }

        if self.changed_gid {
            setegid(self.original.gid).map_err(|e| {
                TmpdirError::Privilege(format!(
                    "failed to restore gid {}: {e}",
                    self.original.gid
                ))
            })?;
            self.changed_gid = false;
        }

        if let Some(groups) = self.saved_groups.take() {
            setgroups(&groups).map_err(|e| {
                TmpdirError::Privilege(format!("failed to restore supplementary groups: {e}"))
            })?;
        }

        tracing::debug!(
            uid = self.original.uid.as_raw(),
            gid = self.original.gid.as_raw(),
            "left privilege scope"
        );
        Ok(())
    }
}

impl Drop for PrivilegeScope {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::error!(error = %e, "unable to restore identity");
        }
    }
}

/// Run `op` as `target`, restoring the original identity afterwards.
///
/// A restore failure wins over the operation's own result.
pub fn with_identity<T>(target: Credentials, op: impl FnOnce() -> Result<T>) -> Result<T> {
    let scope = PrivilegeScope::enter(target)?;
    let result = op();
    match (result, scope.exit()) {
        (result, Ok(())) => result,
        (Ok(_), Err(restore)) => Err(restore),
        (Err(e), Err(restore)) => {
            tracing::error!(error = %e, "operation failed and identity could not be restored");
            Err(restore)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::geteuid;

    #[test]
    fn entering_own_identity_changes_nothing() {
        let before = Credentials::current();
        let scope = PrivilegeScope::enter(before).unwrap();
        assert_eq!(Credentials::current(), before);
        assert_eq!(scope.target(), before);
        scope.exit().unwrap();
        assert_eq!(Credentials::current(), before);
    }

    #[test]
    fn with_identity_passes_through_results() {
        let me = Credentials::current();
        assert_eq!(with_identity(me, || Ok(7)).unwrap(), 7);

        let err = with_identity(me, || -> Result<()> {
            Err(TmpdirError::Config("boom".into()))
        })
        .unwrap_err();
        assert!(matches!(err, TmpdirError::Config(_)));
        assert_eq!(Credentials::current(), me);
    }

    #[test]
    fn failed_switch_leaves_identity_untouched() {
        if geteuid().is_root() {
            // root can become anyone; switching here would affect other tests
            return;
        }
        let before = Credentials::current();
        let err = PrivilegeScope::enter(Credentials::new(0, 0)).unwrap_err();
        assert!(matches!(err, TmpdirError::Privilege(_)));
        assert_eq!(Credentials::current(), before);
    }
}
