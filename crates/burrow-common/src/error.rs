//! Unified error type for the burrow workspace.
//!
//! Every stage of the run pipeline maps its failures onto exactly one
//! variant of [`BurrowError`]. Each variant carries the context needed for a
//! useful diagnostic (image, digest, path, or isolation stage). No stage
//! recovers locally: the first error aborts the run.

use std::path::PathBuf;

use thiserror::Error;

use crate::constants::{EXIT_CANNOT_INVOKE, EXIT_COMMAND_NOT_FOUND, EXIT_PIPELINE_FAILURE};

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BurrowError {
    /// The registry token exchange failed.
    #[error("registry authentication for {image} failed: {message}")]
    Auth {
        /// Repository the token was requested for.
        image: String,
        /// Description of the failure.
        message: String,
    },

    /// The image manifest could not be fetched or decoded.
    #[error("manifest for {image} could not be resolved: {message}")]
    Manifest {
        /// Repository whose manifest was requested.
        image: String,
        /// Description of the failure.
        message: String,
    },

    /// The registry answered with a manifest shape that is not a single-platform
    /// schema 2 image manifest (a manifest list, an OCI index, or schema 1).
    #[error(
        "manifest for {image} is not supported (mediaType {media_type}, schemaVersion {schema_version})"
    )]
    UnsupportedManifest {
        /// Repository whose manifest was requested.
        image: String,
        /// Media type reported by the document (or the response header).
        media_type: String,
        /// Schema version reported by the document.
        schema_version: u32,
    },

    /// A layer blob could not be opened.
    #[error("layer {digest} of {image} could not be fetched: {message}")]
    LayerFetch {
        /// Repository the layer belongs to.
        image: String,
        /// Digest of the layer blob.
        digest: String,
        /// Description of the failure.
        message: String,
    },

    /// The ephemeral root filesystem could not be created or seeded.
    #[error("root filesystem error at {path}: {source}")]
    RootFs {
        /// Path where the failure occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A layer could not be staged, verified, or unpacked into the root.
    #[error("extraction of layer {digest} into {path} failed: {message}")]
    Extraction {
        /// Digest of the layer being applied.
        digest: String,
        /// Root or staging path involved.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// A process isolation step (chroot, unshare, fork, wait) was rejected.
    #[error("isolation failed during {stage}: {message}")]
    Isolation {
        /// Isolation stage that failed.
        stage: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The target command could not be started inside the isolated root.
    #[error("could not launch {command}: {message}")]
    Launch {
        /// Command path as seen inside the root.
        command: String,
        /// Description of the failure.
        message: String,
        /// Whether the command was missing (as opposed to not executable).
        not_found: bool,
    },

    /// The ephemeral root could not be removed after the run.
    #[error("failed to remove root filesystem {path}: {source}")]
    Cleanup {
        /// Root filesystem path that could not be removed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration or invocation value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },
}

impl BurrowError {
    /// Returns the process exit status the CLI reports for this error.
    ///
    /// Launch failures follow the shell convention (`126` not executable,
    /// `127` not found); every other pipeline failure uses `125`.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Launch {
                not_found: true, ..
            } => EXIT_COMMAND_NOT_FOUND,
            Self::Launch { .. } => EXIT_CANNOT_INVOKE,
            _ => EXIT_PIPELINE_FAILURE,
        }
    }

    /// Short, stable name of the error category, used as a log field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Manifest { .. } | Self::UnsupportedManifest { .. } => "manifest",
            Self::LayerFetch { .. } => "layer-fetch",
            Self::RootFs { .. } => "rootfs",
            Self::Extraction { .. } => "extraction",
            Self::Isolation { .. } => "isolation",
            Self::Launch { .. } => "launch",
            Self::Cleanup { .. } => "cleanup",
            Self::Config { .. } => "config",
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BurrowError>;
