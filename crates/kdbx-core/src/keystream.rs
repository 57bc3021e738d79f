//! Salsa20 keystream generator for protected values
//!
//! KeePass masks in-memory protected values with a Salsa20 keystream. The
//! generator here is the standard 20-round Salsa20 core over native 32-bit
//! words, producing 64-byte blocks with a 64-bit little-endian block counter.
//! It is resumable: bytes not consumed by one [`RandomStream::next_bytes`]
//! call are handed out by the next.

use byteorder::{ByteOrder, LittleEndian};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;

/// Nonce KeePass uses for the protected-value stream
pub const PROTECTED_STREAM_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 8;
const BLOCK_LEN: usize = 64;

/// "expand 32-byte k"
const SIGMA: [u32; 4] = [0x6170_7865, 0x3320_646e, 0x7962_2d32, 0x6b20_6574];

/// A source of pseudorandom bytes consumed strictly in order
pub trait RandomStream {
    /// The next `n` bytes of the stream
    fn next_bytes(&mut self, n: usize) -> Zeroizing<Vec<u8>>;
}

impl<R: RandomStream + ?Sized> RandomStream for &mut R {
    fn next_bytes(&mut self, n: usize) -> Zeroizing<Vec<u8>> {
        (**self).next_bytes(n)
    }
}

/// Salsa20 keystream generator
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Salsa20Stream {
    state: [u32; 16],
    block: [u8; BLOCK_LEN],
    cursor: usize,
}

impl Salsa20Stream {
    /// A generator for `key` (32 bytes) and `nonce` (8 bytes), starting at block 0
    pub fn new(key: &[u8], nonce: &[u8]) -> Result<Self> {
        let key: &[u8; KEY_LEN] = key.try_into().map_err(|_| {
            Error::Configuration(format!(
                "Salsa20 key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            ))
        })?;
        let nonce: &[u8; NONCE_LEN] = nonce.try_into().map_err(|_| {
            Error::Configuration(format!(
                "Salsa20 nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            ))
        })?;
        Ok(Self::from_key_nonce(key, nonce))
    }

    /// The generator KeePass uses for protected values: the key is the
    /// SHA-256 of the header's protected stream key, the nonce is fixed.
    pub fn for_protected_stream(key_material: &[u8]) -> Self {
        let digest = Zeroizing::new(HashAlgorithm::Sha256.digest(key_material));
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        let stream = Self::from_key_nonce(&key, &PROTECTED_STREAM_NONCE);
        key.zeroize();
        stream
    }

    fn from_key_nonce(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Self {
        let mut state = [0u32; 16];
        state[0] = SIGMA[0];
        state[5] = SIGMA[1];
        state[10] = SIGMA[2];
        state[15] = SIGMA[3];
        LittleEndian::read_u32_into(&key[..16], &mut state[1..5]);
        LittleEndian::read_u32_into(&key[16..], &mut state[11..15]);
        LittleEndian::read_u32_into(nonce, &mut state[6..8]);

        Self {
            state,
            block: [0u8; BLOCK_LEN],
            cursor: BLOCK_LEN,
        }
    }

    /// Jump to the start of block `counter`, discarding any buffered bytes
    pub fn seek_block(&mut self, counter: u64) {
        self.state[8] = counter as u32;
        self.state[9] = (counter >> 32) as u32;
        self.block.zeroize();
        self.cursor = BLOCK_LEN;
    }

    /// Index of the next block to be generated
    pub fn block_counter(&self) -> u64 {
        (u64::from(self.state[9]) << 32) | u64::from(self.state[8])
    }

    fn next_block(&mut self) {
        let mut x = self.state;
        for _ in 0..10 {
            // columns
            quarter_round(&mut x, 0, 4, 8, 12);
            quarter_round(&mut x, 5, 9, 13, 1);
            quarter_round(&mut x, 10, 14, 2, 6);
            quarter_round(&mut x, 15, 3, 7, 11);
            // rows
            quarter_round(&mut x, 0, 1, 2, 3);
            quarter_round(&mut x, 5, 6, 7, 4);
            quarter_round(&mut x, 10, 11, 8, 9);
            quarter_round(&mut x, 15, 12, 13, 14);
        }
        for (word, initial) in x.iter_mut().zip(self.state.iter()) {
            *word = word.wrapping_add(*initial);
        }
        LittleEndian::write_u32_into(&x, &mut self.block);
        x.zeroize();

        let counter = self.block_counter().wrapping_add(1);
        self.state[8] = counter as u32;
        self.state[9] = (counter >> 32) as u32;
        self.cursor = 0;
    }
}

impl RandomStream for Salsa20Stream {
    fn next_bytes(&mut self, n: usize) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(n));
        while out.len() < n {
            if self.cursor == BLOCK_LEN {
                self.next_block();
            }
            let take = (n - out.len()).min(BLOCK_LEN - self.cursor);
            out.extend_from_slice(&self.block[self.cursor..self.cursor + take]);
            self.cursor += take;
        }
        out
    }
}

impl std::fmt::Debug for Salsa20Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Salsa20Stream")
            .field("block_counter", &self.block_counter())
            .field("buffered", &(BLOCK_LEN - self.cursor))
            .finish_non_exhaustive()
    }
}

#[inline(always)]
fn quarter_round(x: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    x[b] ^= x[a].wrapping_add(x[d]).rotate_left(7);
    x[c] ^= x[b].wrapping_add(x[a]).rotate_left(9);
    x[d] ^= x[c].wrapping_add(x[b]).rotate_left(13);
    x[a] ^= x[d].wrapping_add(x[c]).rotate_left(18);
}

#[cfg(test)]
mod tests {
    use super::*;
    use salsa20::cipher::{KeyIvInit, StreamCipher};

    #[test]
    fn test_zero_key_zero_nonce() {
        let mut stream = Salsa20Stream::new(&[0u8; 32], &[0u8; 8]).unwrap();
        assert_eq!(
            hex::encode(&*stream.next_bytes(64)),
            "9a97f65b9b4c721b960a672145fca8d4e32e67f9111ea979ce9c4826806aeee6\
             3de9c0da2bd7f91ebcb2639bf989c6251b29bf38d39a9bdce7c55f4b2ac12a39"
        );
        assert_eq!(stream.block_counter(), 1);
    }

    #[test]
    fn test_estream_set1_vector0() {
        let mut key = [0u8; 32];
        key[0] = 0x80;
        let mut stream = Salsa20Stream::new(&key, &[0u8; 8]).unwrap();
        assert_eq!(
            hex::encode(&*stream.next_bytes(64)),
            "e3be8fdd8beca2e3ea8ef9475b29a6e7003951e1097a5c38d23b7a5fad9f6844\
             b22c97559e2723c7cbbd3fe4fc8d9a0744652a83e72a9c461876af4d7ef1a117"
        );
    }

    #[test]
    fn test_core_example_with_counter() {
        let mut key = [0u8; 32];
        for i in 0..16 {
            key[i] = (i + 1) as u8;
            key[16 + i] = (201 + i) as u8;
        }
        let nonce: Vec<u8> = (101u8..=108).collect();
        let counter = u64::from_le_bytes([109, 110, 111, 112, 113, 114, 115, 116]);

        let mut stream = Salsa20Stream::new(&key, &nonce).unwrap();
        stream.seek_block(counter);
        let expected: [u8; 64] = [
            69, 37, 68, 39, 41, 15, 107, 193, 255, 139, 122, 6, 170, 233, 217, 98, 89, 144, 182,
            106, 21, 51, 200, 65, 239, 49, 222, 34, 215, 114, 40, 126, 104, 197, 7, 225, 197, 153,
            31, 2, 102, 78, 76, 176, 84, 245, 246, 184, 177, 160, 133, 130, 6, 72, 149, 119, 192,
            195, 132, 236, 234, 103, 246, 74,
        ];
        assert_eq!(&stream.next_bytes(64)[..], &expected[..]);
        assert_eq!(stream.block_counter(), counter + 1);
    }

    #[test]
    fn test_matches_reference_crate() {
        let key: [u8; 32] = core::array::from_fn(|i| (i * 7 + 3) as u8);
        let nonce = PROTECTED_STREAM_NONCE;

        let mut expected = vec![0u8; 1000];
        let mut reference = salsa20::Salsa20::new(&key.into(), &nonce.into());
        reference.apply_keystream(&mut expected);

        let mut stream = Salsa20Stream::new(&key, &nonce).unwrap();
        assert_eq!(&stream.next_bytes(1000)[..], &expected[..]);
    }

    #[test]
    fn test_resumable_across_calls() {
        let mut whole = Salsa20Stream::for_protected_stream(b"stream key");
        let expected = whole.next_bytes(200);

        let mut pieces = Salsa20Stream::for_protected_stream(b"stream key");
        let mut got = Vec::new();
        for n in [1usize, 63, 0, 5, 64, 67] {
            got.extend_from_slice(&pieces.next_bytes(n));
        }
        assert_eq!(&got[..], &expected[..]);
    }

    #[test]
    fn test_protected_stream_key_is_hashed() {
        let material = [0x42u8; 32];
        let digest = HashAlgorithm::Sha256.digest(&material);
        let mut direct = Salsa20Stream::new(&digest, &PROTECTED_STREAM_NONCE).unwrap();
        let mut derived = Salsa20Stream::for_protected_stream(&material);
        assert_eq!(direct.next_bytes(96), derived.next_bytes(96));
    }

    #[test]
    fn test_rejects_bad_lengths() {
        assert!(Salsa20Stream::new(&[0u8; 16], &[0u8; 8]).is_err());
        assert!(Salsa20Stream::new(&[0u8; 32], &[0u8; 12]).is_err());
    }

    #[test]
    fn test_counter_carries_into_high_word() {
        let mut stream = Salsa20Stream::new(&[1u8; 32], &[2u8; 8]).unwrap();
        stream.seek_block(u64::from(u32::MAX));
        stream.next_bytes(64);
        assert_eq!(stream.block_counter(), 1u64 << 32);
    }
}
