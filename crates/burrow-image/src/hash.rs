//! SHA-256 content verification.
//!
//! Blobs are hashed while they stream to disk, so integrity is checked
//! without a second pass over the staged file.

use std::io::{self, Read};

use burrow_common::error::Result;
use burrow_common::types::Digest;
use sha2::{Digest as _, Sha256};

/// Computes the digest of an in-memory byte slice.
///
/// # Errors
///
/// Never fails in practice; the `Result` mirrors [`Digest::from_hex`].
pub fn sha256_digest(bytes: &[u8]) -> Result<Digest> {
    Digest::from_hex(&format!("{:x}", Sha256::digest(bytes)))
}

/// Reader adapter that hashes and counts every byte passing through it.
#[derive(Debug)]
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    /// Number of bytes read so far.
    pub const fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Consumes the adapter, returning the digest of everything read and the
    /// byte count.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the `Result` mirrors [`Digest::from_hex`].
    pub fn finish(self) -> Result<(Digest, u64)> {
        let digest = Digest::from_hex(&format!("{:x}", self.hasher.finalize()))?;
        Ok((digest, self.bytes_read))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn digest_of_empty_input_matches_known_value() {
        assert_eq!(sha256_digest(b"").unwrap().hex(), EMPTY_SHA256);
    }

    #[test]
    fn hashing_reader_matches_direct_digest() {
        let data = b"layer bytes".repeat(1000);
        let mut reader = HashingReader::new(&data[..]);
        let mut sink = Vec::new();
        let copied = io::copy(&mut reader, &mut sink).unwrap();
        assert_eq!(reader.bytes_read(), copied);

        let (digest, size) = reader.finish().unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(digest, sha256_digest(&data).unwrap());
        assert_eq!(sink, data);
    }
}
