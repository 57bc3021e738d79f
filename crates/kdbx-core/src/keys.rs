//! Key sources and the composite key
//!
//! Every credential a container can be locked with is reduced to a digest by
//! a [`KeySource`]. A [`CompositeKey`] collects those digests in order and
//! hashes them together into the one value the key derivation starts from.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use xml::reader::{EventReader, XmlEvent};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;

/// Anything that yields raw key material
pub trait KeySource {
    /// The digest this source contributes to a composite key
    fn hash(&self) -> Zeroizing<Vec<u8>>;
}

/// A key whose digest is already known
#[derive(Clone)]
pub struct KeyFromHash {
    hash: Zeroizing<Vec<u8>>,
}

impl KeyFromHash {
    pub fn new(hash: &[u8]) -> Self {
        Self {
            hash: Zeroizing::new(hash.to_vec()),
        }
    }
}

impl KeySource for KeyFromHash {
    fn hash(&self) -> Zeroizing<Vec<u8>> {
        self.hash.clone()
    }
}

impl std::fmt::Debug for KeyFromHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFromHash").field("hash", &"***").finish()
    }
}

/// A master password. Only its digest is kept.
#[derive(Clone)]
pub struct KeyFromPassword {
    hash: Zeroizing<Vec<u8>>,
}

impl KeyFromPassword {
    pub fn new(password: &str, algorithm: HashAlgorithm) -> Self {
        Self {
            hash: Zeroizing::new(algorithm.digest(password.as_bytes())),
        }
    }
}

impl KeySource for KeyFromPassword {
    fn hash(&self) -> Zeroizing<Vec<u8>> {
        self.hash.clone()
    }
}

impl std::fmt::Debug for KeyFromPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFromPassword").field("hash", &"***").finish()
    }
}

/// The layout a key file was recognized as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFileFormat {
    /// `<KeyFile><Key><Data>` holding base64
    XmlV1,
    /// `<KeyFile>` version 2.0, hex data with a checksum attribute
    XmlV2,
    /// Exactly 32 raw bytes
    Binary,
    /// Exactly 64 hex characters
    Hex,
}

/// A key file.
///
/// Parsing never fails outright: when no known layout matches, the key is
/// marked unparsed and its digest is meaningless. Check [`is_parsed`] or use
/// [`KeyFromFile::try_new`].
///
/// [`is_parsed`]: KeyFromFile::is_parsed
#[derive(Clone)]
pub struct KeyFromFile {
    hash: Zeroizing<Vec<u8>>,
    format: Option<KeyFileFormat>,
}

impl KeyFromFile {
    pub fn new(content: &[u8]) -> Self {
        let parsed = parse_xml_key_file(content).or_else(|| parse_raw_key_file(content));
        match parsed {
            Some((hash, format)) => {
                tracing::debug!(?format, "key file recognized");
                Self {
                    hash,
                    format: Some(format),
                }
            }
            None => {
                tracing::debug!(len = content.len(), "key file not recognized");
                Self {
                    hash: Zeroizing::new(Vec::new()),
                    format: None,
                }
            }
        }
    }

    /// Parse `content`, failing with a format error if no layout matches
    pub fn try_new(content: &[u8]) -> Result<Self> {
        let key = Self::new(content);
        if !key.is_parsed() {
            return Err(Error::Format("unrecognized key file".to_string()));
        }
        Ok(key)
    }

    pub fn is_parsed(&self) -> bool {
        self.format.is_some()
    }

    pub fn format(&self) -> Option<KeyFileFormat> {
        self.format
    }
}

impl KeySource for KeyFromFile {
    fn hash(&self) -> Zeroizing<Vec<u8>> {
        self.hash.clone()
    }
}

impl std::fmt::Debug for KeyFromFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFromFile")
            .field("format", &self.format)
            .field("hash", &"***")
            .finish()
    }
}

fn parse_raw_key_file(content: &[u8]) -> Option<(Zeroizing<Vec<u8>>, KeyFileFormat)> {
    match content.len() {
        32 => Some((Zeroizing::new(content.to_vec()), KeyFileFormat::Binary)),
        64 => hex::decode(content)
            .ok()
            .map(|bytes| (Zeroizing::new(bytes), KeyFileFormat::Hex)),
        _ => None,
    }
}

/// Look for `KeyFile/Key/Data`, plus `KeyFile/Meta/Version` to tell the
/// base64 layout from the hex one.
fn parse_xml_key_file(content: &[u8]) -> Option<(Zeroizing<Vec<u8>>, KeyFileFormat)> {
    let reader = EventReader::new(content);
    let mut path: Vec<String> = Vec::new();
    let mut version: Option<String> = None;
    let mut data: Option<Zeroizing<String>> = None;
    let mut checksum: Option<String> = None;

    for event in reader {
        match event.ok()? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                path.push(name.local_name);
                if path == ["KeyFile", "Key", "Data"] {
                    checksum = attributes
                        .into_iter()
                        .find(|attr| attr.name.local_name == "Hash")
                        .map(|attr| attr.value);
                    data.get_or_insert_with(|| Zeroizing::new(String::new()));
                }
            }
            XmlEvent::Characters(text) | XmlEvent::CData(text) => {
                if path == ["KeyFile", "Key", "Data"] {
                    if let Some(buf) = data.as_mut() {
                        buf.push_str(&text);
                    }
                } else if path == ["KeyFile", "Meta", "Version"] {
                    version = Some(text.trim().to_string());
                }
            }
            XmlEvent::EndElement { .. } => {
                path.pop();
            }
            _ => {}
        }
    }

    let data = data?;
    let is_v2 = version.as_deref().is_some_and(|v| v.starts_with("2."));
    if is_v2 {
        let digits: Zeroizing<String> =
            Zeroizing::new(data.chars().filter(|c| !c.is_whitespace()).collect());
        let bytes = Zeroizing::new(hex::decode(digits.as_bytes()).ok()?);
        if let Some(expected) = checksum {
            let expected = hex::decode(expected.trim()).ok()?;
            let actual = HashAlgorithm::Sha256.digest(&bytes);
            if actual[..expected.len().min(actual.len())] != expected[..] {
                tracing::warn!("key file checksum does not match its data");
                return None;
            }
        }
        Some((bytes, KeyFileFormat::XmlV2))
    } else {
        let bytes = BASE64.decode(data.trim()).ok()?;
        Some((Zeroizing::new(bytes), KeyFileFormat::XmlV1))
    }
}

/// An ordered set of key digests combined into one.
///
/// Order matters: KeePass adds the password before the key file.
#[derive(Clone, Default)]
pub struct CompositeKey {
    algorithm: HashAlgorithm,
    keys: Vec<Zeroizing<Vec<u8>>>,
}

impl CompositeKey {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            keys: Vec::new(),
        }
    }

    /// Build the key for a password and/or key file, in KeePass order.
    /// An unparsed key file is rejected.
    pub fn from_credentials(
        password: Option<&str>,
        key_file: Option<&KeyFromFile>,
    ) -> Result<Self> {
        let mut key = Self::new(HashAlgorithm::Sha256);
        if let Some(password) = password {
            key.add_key(&KeyFromPassword::new(password, HashAlgorithm::Sha256));
        }
        if let Some(key_file) = key_file {
            if !key_file.is_parsed() {
                return Err(Error::Format("unrecognized key file".to_string()));
            }
            key.add_key(key_file);
        }
        Ok(key)
    }

    /// Append a copy of `source`'s digest
    pub fn add_key(&mut self, source: &dyn KeySource) {
        self.keys.push(source.hash());
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

impl KeySource for CompositeKey {
    fn hash(&self) -> Zeroizing<Vec<u8>> {
        let mut hasher = self.algorithm.hasher();
        for key in &self.keys {
            hasher.update(key);
        }
        Zeroizing::new(hasher.finalize())
    }
}

impl std::fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeKey")
            .field("algorithm", &self.algorithm)
            .field("keys", &self.keys.len())
            .finish()
    }
}
