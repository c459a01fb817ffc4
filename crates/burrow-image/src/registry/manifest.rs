//! Image manifest retrieval and decoding.
//!
//! Only single-platform schema 2 manifests (Docker or OCI) are accepted.
//! Manifest lists, OCI indexes, and schema 1 documents are rejected with
//! [`BurrowError::UnsupportedManifest`] instead of being decoded as an image
//! with no layers.

use burrow_common::constants::{
    MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_MANIFEST_V2, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST, SUPPORTED_SCHEMA_VERSION,
};
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{ImageManifest, ImageReference};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use serde::de::IgnoredAny;

use super::{RegistryClient, RegistryToken, describe_failure};

/// Just enough of a manifest document to decide whether it can be decoded.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestProbe {
    #[serde(default)]
    schema_version: Option<u32>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<IgnoredAny>,
}

/// Decodes a manifest body, using the response's `Content-Type` when the
/// document does not name its own media type.
///
/// # Errors
///
/// Returns [`BurrowError::UnsupportedManifest`] for manifest lists, indexes,
/// schema 1, and unknown media types; [`BurrowError::Manifest`] for bodies
/// that are not JSON or do not match the schema 2 shape (including invalid
/// digests).
pub fn decode_manifest(
    image: &ImageReference,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<ImageManifest> {
    let manifest_err = |message: String| BurrowError::Manifest {
        image: image.repository().to_string(),
        message,
    };

    let probe: ManifestProbe = serde_json::from_slice(body)
        .map_err(|e| manifest_err(format!("manifest is not valid JSON: {e}")))?;

    let media_type = probe
        .media_type
        .clone()
        .filter(|m| !m.is_empty())
        .or_else(|| content_type.map(media_type_essence))
        .unwrap_or_default();
    let schema_version = probe.schema_version.unwrap_or(0);

    let is_index = probe.manifests.is_some()
        || media_type == MEDIA_TYPE_MANIFEST_LIST
        || media_type == MEDIA_TYPE_OCI_INDEX;
    let is_known_manifest = media_type.is_empty()
        || media_type == MEDIA_TYPE_MANIFEST_V2
        || media_type == MEDIA_TYPE_OCI_MANIFEST;

    if is_index || !is_known_manifest || schema_version != SUPPORTED_SCHEMA_VERSION {
        return Err(BurrowError::UnsupportedManifest {
            image: image.repository().to_string(),
            media_type,
            schema_version,
        });
    }

    let mut manifest: ImageManifest = serde_json::from_slice(body)
        .map_err(|e| manifest_err(format!("manifest does not match schema 2: {e}")))?;
    if manifest.media_type.is_empty() {
        manifest.media_type = media_type;
    }
    Ok(manifest)
}

/// Strips parameters such as `; charset=utf-8` from a `Content-Type` value.
fn media_type_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

impl RegistryClient {
    /// Fetches and decodes the `latest` manifest of `image`.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Manifest`] if the request fails, the status is
    /// not a success, or the body cannot be read or decoded, and
    /// [`BurrowError::UnsupportedManifest`] for documents burrow cannot use.
    pub fn fetch_manifest(
        &self,
        image: &ImageReference,
        token: &RegistryToken,
    ) -> Result<ImageManifest> {
        let url = self.manifest_url(image);
        tracing::debug!(url = %url, "requesting manifest");
        token.warn_if_expired(image);

        let manifest_err = |message: String| BurrowError::Manifest {
            image: image.repository().to_string(),
            message,
        };

        let response = self
            .http
            .get(&url)
            .header(ACCEPT, MEDIA_TYPE_MANIFEST_V2)
            .bearer_auth(token.bearer())
            .send()
            .map_err(|e| manifest_err(format!("manifest request failed: {e}")))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .map_err(|e| manifest_err(format!("failed to read manifest response: {e}")))?;

        if !status.is_success() {
            return Err(manifest_err(describe_failure(status, &body)));
        }

        decode_manifest(image, content_type.as_deref(), &body)
    }
}
