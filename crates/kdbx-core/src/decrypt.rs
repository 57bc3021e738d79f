//! KDBX 3.x container decryption
//!
//! Pipeline: header (hashed while parsed) → key derivation → AES-CBC body →
//! stream-start check → hashed blocks → optional gzip. The caller receives the
//! plaintext document together with the keystream for its protected values
//! and the header hash the document must repeat.

use std::io::Read;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::cipher::{Cipher, CipherMethod, Padding, BLOCK_SIZE};
use crate::digesting::DigestingSource;
use crate::error::{BlockFault, Error, Result};
use crate::hash::HashAlgorithm;
use crate::hashed_block::{HashedBlockReader, StreamState};
use crate::header::{Compression, ContainerHeader, InnerStream};
use crate::keys::{CompositeKey, KeySource};
use crate::keystream::Salsa20Stream;
use crate::source::{ByteSource, IoReader, SliceSource};

/// Tunables for opening a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptOptions {
    /// Abort on the first hashed-block integrity violation. When false,
    /// corrupted blocks are kept and reported through
    /// [`DecryptedContainer::corrupted`].
    pub stop_on_error: bool,
    /// Compare the header hash repeated in the document with the computed one
    pub verify_header_hash: bool,
    /// Headers asking for more key-transform rounds than this are rejected
    pub max_transform_rounds: u64,
}

impl Default for DecryptOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            verify_header_hash: true,
            max_transform_rounds: default_max_transform_rounds(),
        }
    }
}

fn default_max_transform_rounds() -> u64 {
    100_000_000
}

/// The plaintext of a container and what is needed to read it further
pub struct DecryptedContainer {
    pub header: ContainerHeader,
    /// SHA-256 over every header byte, End field included
    pub header_hash: Vec<u8>,
    /// The document, decompressed
    pub content: Zeroizing<Vec<u8>>,
    /// Keystream for the document's protected values, at its start
    pub stream: Salsa20Stream,
    /// Integrity violations tolerated in best-effort mode
    pub faults: Vec<BlockFault>,
}

impl DecryptedContainer {
    pub fn corrupted(&self) -> bool {
        !self.faults.is_empty()
    }
}

impl std::fmt::Debug for DecryptedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedContainer")
            .field("header", &self.header)
            .field("header_hash", &hex::encode(&self.header_hash))
            .field("content_len", &self.content.len())
            .field("faults", &self.faults)
            .finish_non_exhaustive()
    }
}

/// Derive the AES key for the body from the composite key digest:
/// `SHA256(master_seed || SHA256(AES-256-ECB^rounds(composite, transform_seed)))`
pub fn derive_master_key(header: &ContainerHeader, composite: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let transform = Cipher::new(
        CipherMethod::Aes256Ecb,
        &header.transform_seed,
        &[],
        Padding::None,
    );
    let transformed = Zeroizing::new(
        transform.encrypt_many_times(composite, header.transform_rounds)?,
    );
    let transformed = Zeroizing::new(HashAlgorithm::Sha256.digest(&transformed));

    let mut hasher = HashAlgorithm::Sha256.hasher();
    hasher.update(&header.master_seed);
    hasher.update(&transformed);
    Ok(Zeroizing::new(hasher.finalize()))
}

/// Decrypt the container read from `source` with `key`.
///
/// The source is consumed and closed. The header hash is computed here but
/// not compared; see [`crate::Database::open`] for the full check.
pub fn decrypt<S: ByteSource>(
    source: S,
    key: &CompositeKey,
    options: &DecryptOptions,
) -> Result<DecryptedContainer> {
    let mut digesting = DigestingSource::new(source, HashAlgorithm::Sha256);
    let header = ContainerHeader::read(&mut digesting)?;
    let header_hash = digesting.digest();
    let mut source = digesting.into_inner();
    tracing::debug!(
        major = header.major_version(),
        minor = header.minor_version(),
        rounds = header.transform_rounds,
        compression = ?header.compression,
        "parsed container header"
    );

    if header.transform_rounds > options.max_transform_rounds {
        return Err(Error::Format(format!(
            "header asks for {} key-transform rounds, more than the allowed {}",
            header.transform_rounds, options.max_transform_rounds
        )));
    }
    if header.inner_stream != InnerStream::Salsa20 {
        return Err(Error::Format(format!(
            "unsupported inner random stream {:?}",
            header.inner_stream
        )));
    }
    let method = header.cipher_method()?;

    let master_key = derive_master_key(&header, &key.hash())?;
    let cipher = Cipher::new(method, &master_key, &header.encryption_iv, Padding::Pkcs7);

    let ciphertext = source.read_to_end()?;
    source.close();
    // An empty or unaligned body was cut short
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::ShortRead {
            expected: ciphertext.len().div_ceil(BLOCK_SIZE).max(1) * BLOCK_SIZE,
            actual: ciphertext.len(),
        });
    }
    // Bad padding after decryption means the key was wrong or the body was altered
    let plaintext = Zeroizing::new(cipher.decrypt(&ciphertext).map_err(|e| match e {
        Error::Crypto(_) => Error::InvalidCredentials,
        other => other,
    })?);

    let marker_len = header.stream_start_bytes.len();
    if plaintext.len() < marker_len || plaintext[..marker_len] != header.stream_start_bytes[..] {
        return Err(Error::InvalidCredentials);
    }

    let body = SliceSource::new(plaintext[marker_len..].to_vec());
    let mut blocks = HashedBlockReader::new(body, HashAlgorithm::Sha256, options.stop_on_error);
    let content = read_body(&mut blocks, header.compression);

    // A halted stream is fatal whatever the policy; in strict mode so is any fault
    if blocks.state() == StreamState::Error || (options.stop_on_error && blocks.is_corrupted()) {
        blocks.check()?;
    }
    let content = content?;
    let faults = blocks.faults().to_vec();
    if !faults.is_empty() {
        tracing::warn!(
            faults = faults.len(),
            "container decrypted with integrity violations"
        );
    }

    let stream = Salsa20Stream::for_protected_stream(&header.protected_stream_key);
    tracing::info!(
        content_len = content.len(),
        blocks = blocks.blocks_read(),
        "container decrypted"
    );

    Ok(DecryptedContainer {
        header,
        header_hash,
        content,
        stream,
        faults,
    })
}

fn read_body<S: ByteSource>(
    blocks: &mut HashedBlockReader<S>,
    compression: Compression,
) -> Result<Zeroizing<Vec<u8>>> {
    match compression {
        Compression::None => Ok(Zeroizing::new(blocks.read_to_end()?)),
        Compression::Gzip => {
            let mut out = Zeroizing::new(Vec::new());
            GzDecoder::new(IoReader(blocks))
                .read_to_end(&mut out)
                .map_err(|e| Error::Format(format!("decompression failed: {}", e)))?;
            Ok(out)
        }
    }
}
