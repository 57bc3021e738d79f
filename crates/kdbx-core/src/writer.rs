//! Writing KDBX 3.1 containers

use std::io::Write;

use flate2::write::GzEncoder;

use crate::cipher::{Cipher, Padding};
use crate::decrypt::derive_master_key;
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::hashed_block::{hash_blocks_with_size, DEFAULT_BLOCK_SIZE};
use crate::header::{Compression, ContainerHeader, InnerStream};
use crate::keys::{CompositeKey, KeySource};
use crate::keystream::Salsa20Stream;

/// Builds an encrypted container around an XML document.
///
/// The document must already carry the header hash (see
/// [`header_hash`](Self::header_hash)) and have its protected values masked
/// with [`protected_stream`](Self::protected_stream).
#[derive(Debug, Clone)]
pub struct ContainerWriter {
    header: ContainerHeader,
    block_size: usize,
}

impl ContainerWriter {
    pub fn new(header: ContainerHeader) -> Self {
        Self {
            header,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Payload size of each hashed block
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// The hash readers expect to find in the document's `Meta/HeaderHash`
    pub fn header_hash(&self) -> Result<Vec<u8>> {
        Ok(HashAlgorithm::Sha256.digest(&self.header.to_bytes()?))
    }

    /// A fresh keystream for masking the document's protected values
    pub fn protected_stream(&self) -> Salsa20Stream {
        Salsa20Stream::for_protected_stream(&self.header.protected_stream_key)
    }

    /// Encrypt `xml` under `key` and return the complete container
    pub fn write(&self, key: &CompositeKey, xml: &[u8]) -> Result<Vec<u8>> {
        if self.header.inner_stream != InnerStream::Salsa20 {
            return Err(Error::Format(format!(
                "unsupported inner random stream {:?}",
                self.header.inner_stream
            )));
        }
        let method = self.header.cipher_method()?;
        let mut out = self.header.to_bytes()?;

        let payload = match self.header.compression {
            Compression::None => xml.to_vec(),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(xml)?;
                encoder.finish()?
            }
        };

        let mut body = self.header.stream_start_bytes.to_vec();
        body.extend_from_slice(&hash_blocks_with_size(
            &payload,
            HashAlgorithm::Sha256,
            self.block_size,
        ));

        let master_key = derive_master_key(&self.header, &key.hash())?;
        let cipher = Cipher::new(method, &master_key, &self.header.encryption_iv, Padding::Pkcs7);
        out.extend_from_slice(&cipher.encrypt(&body)?);

        tracing::debug!(
            payload_len = payload.len(),
            container_len = out.len(),
            "container written"
        );
        Ok(out)
    }
}
