//! Root switching via `chroot(2)`.
//!
//! `chroot` only changes the calling process's view of `/`; the directory
//! keeps existing at its original host path. The working directory is moved
//! to the new root so no handle into the old tree is left behind.

use std::path::Path;

use burrow_common::error::{BurrowError, Result};

/// Changes the calling process's root directory to `new_root` and moves the
/// working directory to the new `/`.
///
/// # Errors
///
/// Returns [`BurrowError::Isolation`] if `chroot(2)` is rejected (typically
/// `EPERM` without `CAP_SYS_CHROOT`) or if `chdir("/")` fails afterwards.
#[cfg(unix)]
pub fn change_root(new_root: &Path) -> Result<()> {
    nix::unistd::chroot(new_root).map_err(|e| BurrowError::Isolation {
        stage: "chroot",
        message: format!("chroot into {} failed: {e}", new_root.display()),
    })?;
    nix::unistd::chdir("/").map_err(|e| BurrowError::Isolation {
        stage: "chroot",
        message: format!("chdir to new root failed: {e}"),
    })?;
    tracing::debug!(root = %new_root.display(), "root changed");
    Ok(())
}

/// Stub for non-Unix platforms.
///
/// # Errors
///
/// Always returns an error: `chroot` requires a Unix host.
#[cfg(not(unix))]
pub fn change_root(_new_root: &Path) -> Result<()> {
    Err(BurrowError::Isolation {
        stage: "chroot",
        message: "Unix required for chroot isolation".into(),
    })
}
