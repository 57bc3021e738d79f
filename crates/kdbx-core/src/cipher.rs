//! Symmetric cipher abstraction
//!
//! A [`Cipher`] is configured with a method, key, IV and padding mode, all of
//! which can be changed after construction since the key and IV of a container
//! are only known once its header has been parsed. Every operation validates
//! the configuration first and either returns the full output or an error,
//! never partial output.

use aes::{Aes128, Aes256};
use cipher::block_padding::{NoPadding, Pkcs7, UnpadError};
use cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Cipher algorithm and mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherMethod {
    Aes128Cbc,
    Aes256Cbc,
    Aes128Ecb,
    Aes256Ecb,
}

impl CipherMethod {
    pub fn key_len(self) -> usize {
        match self {
            CipherMethod::Aes128Cbc | CipherMethod::Aes128Ecb => 16,
            CipherMethod::Aes256Cbc | CipherMethod::Aes256Ecb => 32,
        }
    }

    /// Required IV length; ECB takes none
    pub fn iv_len(self) -> usize {
        match self {
            CipherMethod::Aes128Cbc | CipherMethod::Aes256Cbc => BLOCK_SIZE,
            CipherMethod::Aes128Ecb | CipherMethod::Aes256Ecb => 0,
        }
    }

    pub fn block_size(self) -> usize {
        BLOCK_SIZE
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherMethod::Aes128Cbc => "aes-128-cbc",
            CipherMethod::Aes256Cbc => "aes-256-cbc",
            CipherMethod::Aes128Ecb => "aes-128-ecb",
            CipherMethod::Aes256Ecb => "aes-256-ecb",
        }
    }
}

impl std::fmt::Display for CipherMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CipherMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-cbc" => Ok(CipherMethod::Aes128Cbc),
            "aes-256-cbc" => Ok(CipherMethod::Aes256Cbc),
            "aes-128-ecb" => Ok(CipherMethod::Aes128Ecb),
            "aes-256-ecb" => Ok(CipherMethod::Aes256Ecb),
            other => Err(Error::Configuration(format!(
                "unknown cipher method: {}",
                other
            ))),
        }
    }
}

/// Padding applied on encryption and removed on decryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// Input must already be a multiple of the block size
    None,
    #[default]
    Pkcs7,
}

/// A configurable block cipher
#[derive(Clone, Default)]
pub struct Cipher {
    method: Option<CipherMethod>,
    key: Zeroizing<Vec<u8>>,
    iv: Vec<u8>,
    padding: Padding,
}

impl Cipher {
    pub fn new(method: CipherMethod, key: &[u8], iv: &[u8], padding: Padding) -> Self {
        Self {
            method: Some(method),
            key: Zeroizing::new(key.to_vec()),
            iv: iv.to_vec(),
            padding,
        }
    }

    pub fn set_method(&mut self, method: CipherMethod) {
        self.method = Some(method);
    }

    pub fn set_key(&mut self, key: &[u8]) {
        self.key = Zeroizing::new(key.to_vec());
    }

    pub fn set_iv(&mut self, iv: &[u8]) {
        self.iv = iv.to_vec();
    }

    pub fn set_padding(&mut self, padding: Padding) {
        self.padding = padding;
    }

    pub fn method(&self) -> Option<CipherMethod> {
        self.method
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    /// Encrypt `plaintext` with the configured padding
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let method = self.validate()?;
        self.encrypt_raw(method, plaintext, self.padding)
    }

    /// Decrypt `ciphertext` and strip the configured padding
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let method = self.validate()?;
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(Error::Crypto(format!(
                "ciphertext length {} is not a multiple of the block size",
                ciphertext.len()
            )));
        }

        let key = self.key.as_slice();
        let iv = self.iv.as_slice();
        let padding = self.padding;
        let result = match method {
            CipherMethod::Aes128Cbc => {
                let decryptor =
                    cbc::Decryptor::<Aes128>::new_from_slices(key, iv).map_err(invalid_length)?;
                decrypt_with(decryptor, ciphertext, padding)
            }
            CipherMethod::Aes256Cbc => {
                let decryptor =
                    cbc::Decryptor::<Aes256>::new_from_slices(key, iv).map_err(invalid_length)?;
                decrypt_with(decryptor, ciphertext, padding)
            }
            CipherMethod::Aes128Ecb => {
                let decryptor =
                    ecb::Decryptor::<Aes128>::new_from_slice(key).map_err(invalid_length)?;
                decrypt_with(decryptor, ciphertext, padding)
            }
            CipherMethod::Aes256Ecb => {
                let decryptor =
                    ecb::Decryptor::<Aes256>::new_from_slice(key).map_err(invalid_length)?;
                decrypt_with(decryptor, ciphertext, padding)
            }
        };

        result.map_err(|_| Error::Crypto("invalid padding".to_string()))
    }

    /// Encrypt `block` with no padding `rounds` times, feeding each output
    /// back in. Zero rounds returns `block` unchanged.
    ///
    /// This is the AES-KDF key-transform primitive, so the ECB methods take a
    /// fast path that keeps one expanded key schedule for every round.
    pub fn encrypt_many_times(&self, block: &[u8], rounds: u64) -> Result<Vec<u8>> {
        let method = self.validate()?;
        check_aligned(block)?;

        match method {
            CipherMethod::Aes128Ecb => {
                let cipher = Aes128::new_from_slice(&self.key).map_err(invalid_length)?;
                Ok(ecb_rounds(&cipher, block, rounds))
            }
            CipherMethod::Aes256Ecb => {
                let cipher = Aes256::new_from_slice(&self.key).map_err(invalid_length)?;
                Ok(ecb_rounds(&cipher, block, rounds))
            }
            CipherMethod::Aes128Cbc | CipherMethod::Aes256Cbc => {
                let mut data = block.to_vec();
                for _ in 0..rounds {
                    data = self.encrypt_raw(method, &data, Padding::None)?;
                }
                Ok(data)
            }
        }
    }

    fn validate(&self) -> Result<CipherMethod> {
        let method = self
            .method
            .ok_or_else(|| Error::Configuration("cipher method is not set".to_string()))?;

        if self.key.is_empty() {
            return Err(Error::Configuration("cipher key is not set".to_string()));
        }
        if self.key.len() != method.key_len() {
            return Err(Error::Configuration(format!(
                "{} requires a {}-byte key, got {}",
                method,
                method.key_len(),
                self.key.len()
            )));
        }
        if self.iv.len() != method.iv_len() {
            return Err(Error::Configuration(format!(
                "{} requires a {}-byte IV, got {}",
                method,
                method.iv_len(),
                self.iv.len()
            )));
        }
        Ok(method)
    }

    fn encrypt_raw(
        &self,
        method: CipherMethod,
        plaintext: &[u8],
        padding: Padding,
    ) -> Result<Vec<u8>> {
        if padding == Padding::None {
            check_aligned(plaintext)?;
        }

        let key = self.key.as_slice();
        let iv = self.iv.as_slice();
        let out = match method {
            CipherMethod::Aes128Cbc => {
                let encryptor =
                    cbc::Encryptor::<Aes128>::new_from_slices(key, iv).map_err(invalid_length)?;
                encrypt_with(encryptor, plaintext, padding)
            }
            CipherMethod::Aes256Cbc => {
                let encryptor =
                    cbc::Encryptor::<Aes256>::new_from_slices(key, iv).map_err(invalid_length)?;
                encrypt_with(encryptor, plaintext, padding)
            }
            CipherMethod::Aes128Ecb => {
                let encryptor =
                    ecb::Encryptor::<Aes128>::new_from_slice(key).map_err(invalid_length)?;
                encrypt_with(encryptor, plaintext, padding)
            }
            CipherMethod::Aes256Ecb => {
                let encryptor =
                    ecb::Encryptor::<Aes256>::new_from_slice(key).map_err(invalid_length)?;
                encrypt_with(encryptor, plaintext, padding)
            }
        };
        Ok(out)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("method", &self.method)
            .field("key", &"***")
            .field("iv_len", &self.iv.len())
            .field("padding", &self.padding)
            .finish()
    }
}

fn encrypt_with<E: BlockEncryptMut>(encryptor: E, data: &[u8], padding: Padding) -> Vec<u8> {
    match padding {
        Padding::None => encryptor.encrypt_padded_vec_mut::<NoPadding>(data),
        Padding::Pkcs7 => encryptor.encrypt_padded_vec_mut::<Pkcs7>(data),
    }
}

fn decrypt_with<D: BlockDecryptMut>(
    decryptor: D,
    data: &[u8],
    padding: Padding,
) -> std::result::Result<Vec<u8>, UnpadError> {
    match padding {
        Padding::None => decryptor.decrypt_padded_vec_mut::<NoPadding>(data),
        Padding::Pkcs7 => decryptor.decrypt_padded_vec_mut::<Pkcs7>(data),
    }
}

fn ecb_rounds<C: BlockEncrypt>(cipher: &C, block: &[u8], rounds: u64) -> Vec<u8> {
    let mut data = block.to_vec();
    for _ in 0..rounds {
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block(cipher::Block::<C>::from_mut_slice(chunk));
        }
    }
    data
}

fn check_aligned(data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(Error::Crypto(format!(
            "input length {} is not a multiple of the block size and padding is disabled",
            data.len()
        )));
    }
    Ok(())
}

fn invalid_length(_: cipher::InvalidLength) -> Error {
    Error::Configuration("invalid key or IV length".to_string())
}
