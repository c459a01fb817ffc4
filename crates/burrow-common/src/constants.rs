//! Registry endpoints, media types, and process exit codes.

/// Token-issuing endpoint of the default registry.
pub const DEFAULT_AUTH_URL: &str = "https://auth.docker.io/token";

/// `service` parameter sent to the token endpoint.
pub const DEFAULT_AUTH_SERVICE: &str = "registry.docker.io";

/// Base URL of the default registry's distribution API.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry.hub.docker.com";

/// Namespace prepended to bare repository names.
pub const DEFAULT_NAMESPACE: &str = "library";

/// The only tag burrow resolves.
pub const DEFAULT_TAG: &str = "latest";

/// Actions requested in the token scope.
pub const TOKEN_SCOPE_ACTIONS: &str = "pull,push";

/// Docker distribution schema 2 image manifest.
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker distribution schema 2 manifest list (multi-architecture).
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// OCI image manifest, same shape as the schema 2 manifest.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index (multi-architecture).
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Manifest schema version burrow understands.
pub const SUPPORTED_SCHEMA_VERSION: u32 = 2;

/// Prefix of the ephemeral root filesystem directory.
pub const ROOTFS_PREFIX: &str = "burrow-";

/// Prefix of the per-layer staging files.
pub const STAGING_PREFIX: &str = "burrow-layer-";

/// Permission bits applied to `/dev`, `/dev/null`, and the copied executable.
pub const SEED_MODE: u32 = 0o755;

/// Exit status for any failure of the pull, build, isolation, or cleanup pipeline.
pub const EXIT_PIPELINE_FAILURE: i32 = 125;

/// Exit status when the command exists in the root but cannot be executed.
pub const EXIT_CANNOT_INVOKE: i32 = 126;

/// Exit status when the command does not exist in the root.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Offset added to a terminating signal number to form the exit status.
pub const EXIT_SIGNAL_OFFSET: i32 = 128;

/// Application name used in diagnostics.
pub const APP_NAME: &str = "burrow";
