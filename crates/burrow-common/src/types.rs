//! Domain primitive types used across the burrow workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_TAG;
use crate::error::{BurrowError, Result};

/// Reference to an image in the default registry.
///
/// The tag is always `latest`. Bare names live under the configured default
/// namespace (`busybox` becomes `library/busybox`); names that already
/// contain a `/` are used as the repository path as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    name: String,
    repository: String,
}

impl ImageReference {
    /// Parses a user-supplied image name.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Config`] if the name is empty, contains
    /// characters outside the repository grammar, or pins a tag other than
    /// `latest` or a digest.
    pub fn parse(input: &str, namespace: &str) -> Result<Self> {
        let input = input.trim();
        let (name, tag) = split_tag(input);

        if tag.is_some_and(|t| t != DEFAULT_TAG) {
            return Err(BurrowError::Config {
                message: format!("image {input}: only the `{DEFAULT_TAG}` tag is supported"),
            });
        }
        if name.contains('@') {
            return Err(BurrowError::Config {
                message: format!("image {input}: digest references are not supported"),
            });
        }
        if name.is_empty() || !name.split('/').all(is_valid_component) {
            return Err(BurrowError::Config {
                message: format!("invalid image name: {input:?}"),
            });
        }

        let repository = if name.contains('/') || namespace.is_empty() {
            name.to_string()
        } else {
            format!("{namespace}/{name}")
        };

        Ok(Self {
            name: name.to_string(),
            repository,
        })
    }

    /// Returns the name as given by the user, without tag.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the repository path used in registry URLs and token scopes.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Returns the tag, which is always `latest`.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        DEFAULT_TAG
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, DEFAULT_TAG)
    }
}

/// Splits `name[:tag]`, where the tag is whatever follows the last `:` after
/// the last `/`.
fn split_tag(input: &str) -> (&str, Option<&str>) {
    let last_segment_start = input.rfind('/').map_or(0, |i| i + 1);
    match input[last_segment_start..].rfind(':') {
        Some(offset) => {
            let at = last_segment_start + offset;
            (&input[..at], Some(&input[at + 1..]))
        }
        None => (input, None),
    }
}

fn is_valid_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// Content-addressed blob identifier of the form `sha256:<64 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parses a digest string.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Config`] if the algorithm is not `sha256` or
    /// the hex part is not 64 lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self> {
        let Some(hex) = value.strip_prefix("sha256:") else {
            return Err(BurrowError::Config {
                message: format!("unsupported digest algorithm: {value}"),
            });
        };
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            return Err(BurrowError::Config {
                message: format!("invalid sha256 digest: {value}"),
            });
        }
        Ok(Self(value.to_string()))
    }

    /// Builds a digest from a hex-encoded SHA-256 value.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Config`] if `hex` is not a valid SHA-256 hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        Self::parse(&format!("sha256:{hex}"))
    }

    /// Returns the hex part of the digest.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }

    /// Returns the full `sha256:<hex>` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = BurrowError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// Content descriptor referencing a blob in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced blob.
    pub media_type: String,
    /// Size of the blob in bytes.
    pub size: u64,
    /// Digest of the blob.
    pub digest: Digest,
}

/// A single-platform image manifest.
///
/// Layers are ordered bottom to top: they must be applied in sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Manifest schema version (always 2 once decoded).
    pub schema_version: u32,
    /// Media type of the manifest document.
    #[serde(default)]
    pub media_type: String,
    /// Image configuration blob.
    pub config: Descriptor,
    /// Filesystem layers, bottom to top.
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Sum of the declared layer sizes in bytes.
    #[must_use]
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Outcome of the isolated command, once it has terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// The command exited on its own with the given status.
    Exited(i32),
    /// The command was killed by the given signal number.
    Signaled(i32),
}

impl Termination {
    /// Returns the exit status burrow reports for this termination.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => crate::constants::EXIT_SIGNAL_OFFSET + signal,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}
