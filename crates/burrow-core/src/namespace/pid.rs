//! PID namespace isolation.
//!
//! Gives the container its own process ID space, where the first process
//! spawned after the unshare becomes PID 1.

use burrow_common::error::{BurrowError, Result};

/// Moves future children of the calling process into a new PID namespace.
///
/// The calling process itself keeps its PID. The next `fork(2)` child
/// will see itself as PID 1 inside the new namespace.
///
/// # Errors
///
/// Returns [`BurrowError::Isolation`] if `unshare(CLONE_NEWPID)` is
/// unsupported or rejected (typically `EPERM` without `CAP_SYS_ADMIN`).
#[cfg(target_os = "linux")]
pub fn unshare_pid_namespace() -> Result<()> {
    use nix::sched::{CloneFlags, unshare};

    unshare(CloneFlags::CLONE_NEWPID).map_err(|e| BurrowError::Isolation {
        stage: "unshare",
        message: format!("PID namespace creation failed: {e}"),
    })?;
    tracing::debug!("PID namespace unshared");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: PID namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn unshare_pid_namespace() -> Result<()> {
    Err(BurrowError::Isolation {
        stage: "unshare",
        message: "Linux required for PID namespace isolation".into(),
    })
}
