//! # burrow-core
//!
//! Low-level Linux isolation primitives for burrow.
//!
//! This crate provides safe wrappers over:
//! - **Namespaces**: PID namespace unsharing.
//! - **Filesystem**: `chroot(2)` into a prepared root.
//!
//! Both operations are irreversible for the calling process. Callers are
//! expected to run them in a dedicated helper process.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod filesystem;
pub mod namespace;

/// Returns whether the calling process runs with an effective UID of 0.
///
/// Both `chroot(2)` and `unshare(CLONE_NEWPID)` need privileges that an
/// unprivileged user normally lacks; this is only used for diagnostics.
#[must_use]
pub fn is_privileged() -> bool {
    nix::unistd::geteuid().is_root()
}
