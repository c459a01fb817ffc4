//! Client for the registry's token and distribution APIs.
//!
//! A pull is three sequential steps, each depending on the previous one:
//! token exchange ([`RegistryClient::authenticate`]), manifest resolution
//! ([`RegistryClient::fetch_manifest`]), and blob stream opening
//! ([`RegistryClient::open_layers`]). There is no retry anywhere: the
//! first failure aborts the pull.

pub mod auth;
pub mod blob;
pub mod manifest;

use std::time::Duration;

use burrow_common::config::BurrowConfig;
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{ImageManifest, ImageReference};
use serde::Deserialize;

pub use auth::RegistryToken;
pub use blob::LayerBlob;

/// Blocking HTTP client bound to one registry and its token service.
#[derive(Debug)]
pub struct RegistryClient {
    http: reqwest::blocking::Client,
    auth_url: String,
    auth_service: String,
    registry_base: String,
}

/// Everything needed to build a root filesystem from an image.
#[derive(Debug)]
pub struct PulledImage {
    /// The resolved manifest.
    pub manifest: ImageManifest,
    /// One open stream per layer, in manifest order.
    pub layers: Vec<LayerBlob>,
}

impl RegistryClient {
    /// Builds a client from the run configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Config`] if the HTTP client cannot be
    /// constructed (for example when no TLS backend is available).
    pub fn new(config: &BurrowConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("burrow/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout_secs.map(Duration::from_secs))
            .build()
            .map_err(|e| BurrowError::Config {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            auth_url: config.auth_url.clone(),
            auth_service: config.auth_service.clone(),
            registry_base: config.registry_base().to_string(),
        })
    }

    /// Runs the full pull sequence: token, manifest, then one open stream per
    /// layer.
    ///
    /// # Errors
    ///
    /// Propagates the first [`BurrowError::Auth`], [`BurrowError::Manifest`],
    /// [`BurrowError::UnsupportedManifest`], or [`BurrowError::LayerFetch`].
    pub fn pull(&self, image: &ImageReference) -> Result<PulledImage> {
        let token = self.authenticate(image)?;
        let manifest = self.fetch_manifest(image, &token)?;
        tracing::info!(
            image = %image,
            layers = manifest.layers.len(),
            bytes = manifest.total_layer_size(),
            "manifest resolved"
        );
        let layers = self.open_layers(image, &token, &manifest)?;
        Ok(PulledImage { manifest, layers })
    }

    fn manifest_url(&self, image: &ImageReference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry_base,
            image.repository(),
            image.tag()
        )
    }

    fn blob_url(&self, image: &ImageReference, digest: &str) -> String {
        format!("{}/v2/{}/blobs/{digest}", self.registry_base, image.repository())
    }
}

/// Error document returned by distribution API endpoints.
#[derive(Debug, Deserialize)]
struct ErrorDocument {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
    /// Token services answer with a flat `details` field instead.
    #[serde(default)]
    details: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Builds a one-line description of a non-success response, preferring the
/// registry's structured error document over the raw body.
fn describe_failure(status: reqwest::StatusCode, body: &[u8]) -> String {
    if let Ok(doc) = serde_json::from_slice::<ErrorDocument>(body) {
        let mut parts: Vec<String> = doc
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect();
        parts.extend(doc.details);
        if !parts.is_empty() {
            return format!("HTTP {status} ({})", parts.join("; "));
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        format!("HTTP {status}")
    } else {
        let snippet: String = text.chars().take(200).collect();
        format!("HTTP {status} ({snippet})")
    }
}
