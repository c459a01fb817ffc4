//! Layer blob streams.
//!
//! Blobs are opened in manifest order and handed over unread. The bytes are
//! pulled by whoever drains the [`LayerBlob`]; dropping it closes the
//! underlying connection.

use std::fmt;
use std::io::{self, Read};

use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{Descriptor, Digest, ImageManifest, ImageReference};

use super::{RegistryClient, RegistryToken, describe_failure};

/// An open, lazily-read layer stream paired with its descriptor.
pub struct LayerBlob {
    descriptor: Descriptor,
    reader: Box<dyn Read + Send>,
}

impl LayerBlob {
    /// Pairs a descriptor with a byte stream.
    pub fn new(descriptor: Descriptor, reader: impl Read + Send + 'static) -> Self {
        Self {
            descriptor,
            reader: Box::new(reader),
        }
    }

    /// Digest the blob is expected to hash to.
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.descriptor.digest
    }

    /// Size in bytes declared by the manifest.
    #[must_use]
    pub const fn declared_size(&self) -> u64 {
        self.descriptor.size
    }

    /// Media type declared by the manifest.
    #[must_use]
    pub fn media_type(&self) -> &str {
        &self.descriptor.media_type
    }
}

impl Read for LayerBlob {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for LayerBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerBlob")
            .field("digest", &self.descriptor.digest)
            .field("size", &self.descriptor.size)
            .finish_non_exhaustive()
    }
}

impl RegistryClient {
    /// Opens one stream per layer of `manifest`, in manifest order.
    ///
    /// Nothing is read from the streams. If opening layer N fails, the
    /// streams for layers `0..N` are dropped (and closed) before the error
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::LayerFetch`] if any blob request fails or
    /// answers with a non-success status.
    pub fn open_layers(
        &self,
        image: &ImageReference,
        token: &RegistryToken,
        manifest: &ImageManifest,
    ) -> Result<Vec<LayerBlob>> {
        manifest
            .layers
            .iter()
            .map(|descriptor| self.open_blob(image, token, descriptor))
            .collect()
    }

    /// Opens a single blob stream.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::LayerFetch`] if the request fails or answers
    /// with a non-success status.
    pub fn open_blob(
        &self,
        image: &ImageReference,
        token: &RegistryToken,
        descriptor: &Descriptor,
    ) -> Result<LayerBlob> {
        let url = self.blob_url(image, descriptor.digest.as_str());
        tracing::debug!(url = %url, digest = %descriptor.digest, "opening layer blob");
        token.warn_if_expired(image);

        let fetch_err = |message: String| BurrowError::LayerFetch {
            image: image.repository().to_string(),
            digest: descriptor.digest.to_string(),
            message,
        };

        let response = self
            .http
            .get(&url)
            .bearer_auth(token.bearer())
            .send()
            .map_err(|e| fetch_err(format!("blob request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().unwrap_or_default();
            return Err(fetch_err(describe_failure(status, &body)));
        }

        tracing::info!(
            digest = %descriptor.digest,
            size = descriptor.size,
            "layer stream opened"
        );
        Ok(LayerBlob::new(descriptor.clone(), response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_blob_reads_through_to_inner_stream() {
        let digest = crate::hash::sha256_digest(b"payload").unwrap();
        let descriptor = Descriptor {
            media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".into(),
            size: 7,
            digest: digest.clone(),
        };
        let mut blob = LayerBlob::new(descriptor, &b"payload"[..]);
        assert_eq!(blob.digest(), &digest);
        assert_eq!(blob.declared_size(), 7);

        let mut out = String::new();
        let _ = blob.read_to_string(&mut out).unwrap();
        assert_eq!(out, "payload");
    }
}
