//! # burrow-image
//!
//! Everything between an image name and a populated root directory:
//!
//! - **Registry**: anonymous token exchange, manifest resolution, and
//!   lazily-read blob streams.
//! - **Layers**: staging, digest verification, and unpacking in manifest
//!   order.
//! - **Hashing**: SHA-256 content verification.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod hash;
pub mod layer;
pub mod registry;

#[cfg(feature = "testing")]
#[allow(clippy::expect_used, clippy::missing_panics_doc)]
pub mod testing;
