//! Global configuration model for a burrow run.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_AUTH_SERVICE, DEFAULT_AUTH_URL, DEFAULT_NAMESPACE, DEFAULT_REGISTRY_URL,
};
use crate::error::BurrowError;

/// Strategy used to unpack a staged layer into the root filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// Invoke the external `tar` utility on the staging file.
    #[default]
    Tar,
    /// Unpack in-process, honouring OCI whiteouts.
    Builtin,
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tar => write!(f, "tar"),
            Self::Builtin => write!(f, "builtin"),
        }
    }
}

impl FromStr for ExtractorKind {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tar" => Ok(Self::Tar),
            "builtin" => Ok(Self::Builtin),
            other => Err(BurrowError::Config {
                message: format!("unknown extractor {other:?} (expected `tar` or `builtin`)"),
            }),
        }
    }
}

/// Root configuration for a burrow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurrowConfig {
    /// Token-issuing endpoint.
    pub auth_url: String,
    /// `service` parameter for the token endpoint.
    pub auth_service: String,
    /// Base URL of the registry's distribution API.
    pub registry_url: String,
    /// Namespace prepended to bare image names.
    pub default_namespace: String,
    /// Parent directory for the ephemeral root; the system temp dir if unset.
    pub temp_root: Option<PathBuf>,
    /// How staged layers are unpacked.
    pub extractor: ExtractorKind,
    /// Program invoked by the `tar` extractor.
    pub tar_program: PathBuf,
    /// Whether blob size and SHA-256 are checked against the manifest.
    pub verify_digests: bool,
    /// Per-request timeout for registry calls; unbounded if unset.
    pub request_timeout_secs: Option<u64>,
}

impl Default for BurrowConfig {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            auth_service: DEFAULT_AUTH_SERVICE.to_string(),
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            temp_root: None,
            extractor: ExtractorKind::default(),
            tar_program: PathBuf::from("tar"),
            verify_digests: true,
            request_timeout_secs: None,
        }
    }
}

impl BurrowConfig {
    /// Returns the directory under which the ephemeral root is created.
    #[must_use]
    pub fn temp_parent(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Returns the registry base URL without a trailing slash.
    #[must_use]
    pub fn registry_base(&self) -> &str {
        self.registry_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_docker_hub() {
        let config = BurrowConfig::default();
        assert_eq!(config.auth_url, "https://auth.docker.io/token");
        assert_eq!(config.registry_url, "https://registry.hub.docker.com");
        assert_eq!(config.default_namespace, "library");
        assert_eq!(config.extractor, ExtractorKind::Tar);
        assert!(config.verify_digests);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: BurrowConfig =
            serde_json::from_str(r#"{"registry_url": "http://127.0.0.1:5000/", "extractor": "builtin"}"#)
                .unwrap();
        assert_eq!(config.registry_base(), "http://127.0.0.1:5000");
        assert_eq!(config.extractor, ExtractorKind::Builtin);
        assert_eq!(config.auth_service, DEFAULT_AUTH_SERVICE);
    }

    #[test]
    fn extractor_kind_parses_known_names() {
        assert_eq!("tar".parse::<ExtractorKind>().unwrap(), ExtractorKind::Tar);
        assert_eq!("builtin".parse::<ExtractorKind>().unwrap(), ExtractorKind::Builtin);
        assert!("zip".parse::<ExtractorKind>().is_err());
    }

    #[test]
    fn temp_parent_prefers_configured_root() {
        let config = BurrowConfig {
            temp_root: Some(PathBuf::from("/var/tmp/burrow")),
            ..BurrowConfig::default()
        };
        assert_eq!(config.temp_parent(), PathBuf::from("/var/tmp/burrow"));
    }
}
