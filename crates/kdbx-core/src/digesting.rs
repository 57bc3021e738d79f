//! A byte source that hashes everything read through it

use crate::error::Result;
use crate::hash::{HashAlgorithm, Hasher};
use crate::source::ByteSource;

/// Wraps a [`ByteSource`] and keeps a rolling digest of all bytes read.
///
/// The container decryptor reads the outer header through one of these so the
/// header hash falls out of parsing with no second pass.
#[derive(Debug)]
pub struct DigestingSource<S: ByteSource> {
    base: S,
    hasher: Hasher,
    consumed: usize,
}

impl<S: ByteSource> DigestingSource<S> {
    pub fn new(base: S, algorithm: HashAlgorithm) -> Self {
        Self {
            base,
            hasher: algorithm.hasher(),
            consumed: 0,
        }
    }

    /// Digest of all bytes read so far. Reading may continue afterwards.
    pub fn digest(&self) -> Vec<u8> {
        self.hasher.clone().finalize()
    }

    /// Number of bytes that have passed through the digest
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Give back the wrapped source, positioned after the last byte read
    pub fn into_inner(self) -> S {
        self.base
    }

    fn absorb(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.consumed += bytes.len();
    }
}

impl<S: ByteSource> ByteSource for DigestingSource<S> {
    fn can_read(&self) -> bool {
        self.base.can_read()
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let bytes = self.base.read(n)?;
        self.absorb(&bytes);
        Ok(bytes)
    }

    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let bytes = self.base.read_to_end()?;
        self.absorb(&bytes);
        Ok(bytes)
    }

    fn close(&mut self) {
        self.base.close()
    }
}
