//! Private mount namespace

use crate::{Result, TmpdirError};
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};

/// Move the calling process into its own mount namespace.
///
/// `/` is marked shared first so that the new namespace starts as a copy,
/// then marked slave so mounts made here never propagate back to the host
/// while host mounts still show up inside.
pub fn enter_private_namespace() -> Result<()> {
    require_sys_admin()?;

    tracing::debug!("marking mount points shared");
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_SHARED,
        None::<&str>,
    )
    .map_err(|e| TmpdirError::Mount(format!("failed to mark mount points for sharing: {e}")))?;

    unshare(CloneFlags::CLONE_NEWNS).map_err(|e| {
        TmpdirError::Mount(format!("failed to create new mount namespace: {e}"))
    })?;

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_SLAVE,
        None::<&str>,
    )
    .map_err(|e| {
        TmpdirError::Mount(format!(
            "failed to copy parent mount points into new namespace: {e}"
        ))
    })?;

    tracing::info!("entered private mount namespace");
    Ok(())
}

/// Bit of `CAP_SYS_ADMIN` in the capability masks.
const CAP_SYS_ADMIN: u32 = 21;

fn require_sys_admin() -> Result<()> {
    let status = std::fs::read_to_string("/proc/self/status")
        .map_err(|e| TmpdirError::Mount(format!("unable to read capabilities: {e}")))?;
    let effective = effective_caps(&status)
        .ok_or_else(|| TmpdirError::Mount("no CapEff line in /proc/self/status".into()))?;
    if effective & (1 << CAP_SYS_ADMIN) != 0 {
        Ok(())
    } else {
        Err(TmpdirError::Mount(
            "CAP_SYS_ADMIN is required for bind isolation".into(),
        ))
    }
}

/// The effective capability mask from a `/proc/<pid>/status` body.
fn effective_caps(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|value| u64::from_str_radix(value.trim(), 16).ok())
}
