//! Hashed-block stream
//!
//! KeePass frames the decrypted body as a sequence of integrity-checked blocks:
//!
//! ```text
//! u32 LE   block index (0, 1, 2, ...)
//! [u8; H]  digest of the payload (H = 32 for SHA-256)
//! u32 LE   payload length
//! [u8; n]  payload
//! ```
//!
//! A block with length 0 terminates the stream. [`HashedBlockReader`] decodes
//! the framing back into a contiguous byte stream and records every integrity
//! violation; [`hash_blocks`] is the matching encoder.

use crate::error::{BlockFault, Error, Result};
use crate::hash::HashAlgorithm;
use crate::source::ByteSource;
use byteorder::{ByteOrder, LittleEndian};
use zeroize::Zeroizing;

/// Block size KeePass uses when writing (1 MiB)
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Where the reader is in its block-decoding cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No block has been requested yet
    Idle,
    /// A block header or payload is being pulled from the base source
    ReadingBlock,
    /// A verified (or, best-effort, unverified) payload is being served
    BlockReady,
    /// Reading halted on an integrity violation
    Error,
    /// The terminator block or the end of the base source was reached
    Ended,
}

/// Decodes a hashed-block stream from a base [`ByteSource`].
///
/// With `stop_on_error` set, the first integrity violation halts the stream.
/// Without it, index and hash mismatches are recorded and reading continues
/// with the untrusted payload. Truncation always halts. Either way,
/// [`is_corrupted`](Self::is_corrupted) reports whether any violation was seen.
pub struct HashedBlockReader<S: ByteSource> {
    base: S,
    algorithm: HashAlgorithm,
    stop_on_error: bool,
    state: StreamState,
    next_index: u32,
    block: Zeroizing<Vec<u8>>,
    pos: usize,
    faults: Vec<BlockFault>,
}

impl<S: ByteSource> HashedBlockReader<S> {
    pub fn new(base: S, algorithm: HashAlgorithm, stop_on_error: bool) -> Self {
        Self {
            base,
            algorithm,
            stop_on_error,
            state: StreamState::Idle,
            next_index: 0,
            block: Zeroizing::new(Vec::new()),
            pos: 0,
            faults: Vec::new(),
        }
    }

    /// Whether any integrity violation has been observed so far
    pub fn is_corrupted(&self) -> bool {
        !self.faults.is_empty()
    }

    /// Every violation observed so far, in stream order
    pub fn faults(&self) -> &[BlockFault] {
        &self.faults
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Number of block headers consumed, terminator excluded
    pub fn blocks_read(&self) -> u32 {
        self.next_index
    }

    /// `Err` carrying the first recorded violation, if any
    pub fn check(&self) -> Result<()> {
        match self.faults.first() {
            Some(fault) => Err(Error::Integrity(fault.clone())),
            None => Ok(()),
        }
    }

    fn record(&mut self, fault: BlockFault) {
        tracing::debug!("hashed block stream: {}", fault);
        self.faults.push(fault);
    }

    fn halt(&mut self, fault: BlockFault) -> bool {
        self.record(fault);
        self.state = StreamState::Error;
        false
    }

    /// Pull the next block from the base source. Returns `false` once no
    /// further payload will be produced.
    fn read_block(&mut self) -> Result<bool> {
        if matches!(self.state, StreamState::Error | StreamState::Ended) {
            return Ok(false);
        }
        if !self.base.can_read() {
            self.state = StreamState::Ended;
            return Ok(false);
        }

        self.state = StreamState::ReadingBlock;
        let index = self.next_index;

        let index_bytes = self.base.read(4)?;
        if index_bytes.is_empty() {
            // Source ended on a block boundary without a terminator
            self.state = StreamState::Ended;
            return Ok(false);
        }
        if index_bytes.len() < 4 {
            return Ok(self.halt(BlockFault::Truncated { index }));
        }

        let found = LittleEndian::read_u32(&index_bytes);
        if found != index {
            let fault = BlockFault::IndexMismatch {
                expected: index,
                found,
            };
            if self.stop_on_error {
                return Ok(self.halt(fault));
            }
            self.record(fault);
        }

        let hash_len = self.algorithm.output_len();
        let expected_hash = self.base.read(hash_len)?;
        if expected_hash.len() != hash_len {
            return Ok(self.halt(BlockFault::Truncated { index }));
        }

        let length_bytes = self.base.read(4)?;
        if length_bytes.len() < 4 {
            return Ok(self.halt(BlockFault::Truncated { index }));
        }
        let length = LittleEndian::read_i32(&length_bytes);
        if length < 0 {
            return Ok(self.halt(BlockFault::InvalidLength {
                index,
                length: length as i64,
            }));
        }
        if length == 0 {
            if !self.is_terminator_hash(&expected_hash) {
                self.record(BlockFault::BadTerminator { index });
            }
            tracing::debug!("hashed block stream terminated after {} blocks", index);
            self.state = StreamState::Ended;
            return Ok(false);
        }

        self.next_index = index.wrapping_add(1);
        let length = length as usize;
        let payload = Zeroizing::new(self.base.read(length)?);
        if payload.len() != length {
            return Ok(self.halt(BlockFault::Truncated { index }));
        }

        if self.algorithm.digest(&payload) != expected_hash {
            let fault = BlockFault::HashMismatch { index };
            if self.stop_on_error {
                return Ok(self.halt(fault));
            }
            tracing::warn!("block {} failed its hash check, continuing best-effort", index);
            self.record(fault);
        }

        tracing::debug!("hashed block {} ready ({} bytes)", index, length);
        self.block = payload;
        self.pos = 0;
        self.state = StreamState::BlockReady;
        Ok(true)
    }

    fn is_terminator_hash(&self, hash: &[u8]) -> bool {
        hash.iter().all(|&b| b == 0) || hash == self.algorithm.digest(&[]).as_slice()
    }

    fn buffered(&self) -> usize {
        self.block.len() - self.pos
    }
}

impl<S: ByteSource> ByteSource for HashedBlockReader<S> {
    fn can_read(&self) -> bool {
        if self.buffered() > 0 {
            return true;
        }
        match self.state {
            StreamState::Error | StreamState::Ended => false,
            _ => (!self.is_corrupted() || !self.stop_on_error) && self.base.can_read(),
        }
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n.min(DEFAULT_BLOCK_SIZE));
        while out.len() < n {
            if self.buffered() == 0 && !self.read_block()? {
                break;
            }
            let take = (n - out.len()).min(self.buffered());
            out.extend_from_slice(&self.block[self.pos..self.pos + take]);
            self.pos += take;
        }
        Ok(out)
    }

    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = self.block[self.pos..].to_vec();
        self.pos = self.block.len();
        while self.read_block()? {
            out.extend_from_slice(&self.block);
            self.pos = self.block.len();
        }
        Ok(out)
    }

    fn close(&mut self) {
        self.base.close();
        self.block = Zeroizing::new(Vec::new());
        self.pos = 0;
        self.state = StreamState::Ended;
    }
}

impl<S: ByteSource> std::fmt::Debug for HashedBlockReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashedBlockReader")
            .field("algorithm", &self.algorithm)
            .field("stop_on_error", &self.stop_on_error)
            .field("state", &self.state)
            .field("next_index", &self.next_index)
            .field("faults", &self.faults)
            .finish()
    }
}

/// Frame `data` as a hashed-block stream using [`DEFAULT_BLOCK_SIZE`] blocks
pub fn hash_blocks(data: &[u8], algorithm: HashAlgorithm) -> Vec<u8> {
    hash_blocks_with_size(data, algorithm, DEFAULT_BLOCK_SIZE)
}

/// Frame `data` as full blocks of `block_size` bytes, one final short block
/// for any remainder, and the zero-length terminator KeePass expects.
pub fn hash_blocks_with_size(data: &[u8], algorithm: HashAlgorithm, block_size: usize) -> Vec<u8> {
    let block_size = block_size.max(1);
    let hash_len = algorithm.output_len();
    let block_count = data.len().div_ceil(block_size);
    let mut out = Vec::with_capacity(data.len() + (block_count + 1) * (8 + hash_len));

    let mut index: u32 = 0;
    for chunk in data.chunks(block_size) {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&algorithm.digest(chunk));
        out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        out.extend_from_slice(chunk);
        index = index.wrapping_add(1);
    }

    out.extend_from_slice(&index.to_le_bytes());
    out.extend(std::iter::repeat(0u8).take(hash_len));
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}
