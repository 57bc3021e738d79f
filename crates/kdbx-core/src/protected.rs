//! Protected field values

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};
use crate::keystream::RandomStream;

/// A field value as read from the document
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub enum BoxedString {
    /// Held XOR-masked until accessed
    Protected { masked: Vec<u8>, mask: Vec<u8> },
    Unprotected(String),
}

impl BoxedString {
    pub fn unprotected(value: impl Into<String>) -> Self {
        BoxedString::Unprotected(value.into())
    }

    pub fn is_protected(&self) -> bool {
        matches!(self, BoxedString::Protected { .. })
    }

    /// The plaintext bytes
    pub fn plain_bytes(&self) -> Zeroizing<Vec<u8>> {
        match self {
            BoxedString::Protected { masked, mask } => Zeroizing::new(
                masked.iter().zip(mask.iter()).map(|(m, k)| m ^ k).collect(),
            ),
            BoxedString::Unprotected(value) => Zeroizing::new(value.as_bytes().to_vec()),
        }
    }

    /// The plaintext, with invalid UTF-8 replaced
    pub fn plain_string(&self) -> Zeroizing<String> {
        match self {
            BoxedString::Unprotected(value) => Zeroizing::new(value.clone()),
            BoxedString::Protected { .. } => {
                Zeroizing::new(String::from_utf8_lossy(&self.plain_bytes()).into_owned())
            }
        }
    }
}

impl std::fmt::Debug for BoxedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoxedString::Protected { masked, .. } => {
                write!(f, "BoxedString::Protected(len = {})", masked.len())
            }
            BoxedString::Unprotected(_) => write!(f, "BoxedString::Unprotected(***)"),
        }
    }
}

/// Masks and unmasks protected values against a keystream.
///
/// Every call consumes keystream bytes, so values must pass through in the
/// order they appear in the document.
pub struct ProtectedValueCodec<R: RandomStream> {
    stream: R,
}

impl<R: RandomStream> ProtectedValueCodec<R> {
    pub fn new(stream: R) -> Self {
        Self { stream }
    }

    /// Decode a base64 `Protected="True"` payload and pair it with the next
    /// keystream bytes
    pub fn unprotect(&mut self, encoded: &str) -> Result<BoxedString> {
        let masked = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Format(format!("invalid protected value: {}", e)))?;
        let mask = self.stream.next_bytes(masked.len());
        Ok(BoxedString::Protected {
            masked,
            mask: mask.to_vec(),
        })
    }

    /// Mask `plain` with the next keystream bytes and base64-encode it
    pub fn protect(&mut self, plain: &[u8]) -> String {
        let mask = self.stream.next_bytes(plain.len());
        let masked: Zeroizing<Vec<u8>> =
            Zeroizing::new(plain.iter().zip(mask.iter()).map(|(p, k)| p ^ k).collect());
        BASE64.encode(&*masked)
    }

    pub fn into_inner(self) -> R {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystream::Salsa20Stream;

    #[test]
    fn test_protect_then_unprotect() {
        let mut writer = ProtectedValueCodec::new(Salsa20Stream::for_protected_stream(b"k"));
        let first = writer.protect(b"hunter2");
        let second = writer.protect("pässwörd".as_bytes());

        let mut reader = ProtectedValueCodec::new(Salsa20Stream::for_protected_stream(b"k"));
        let a = reader.unprotect(&first).unwrap();
        let b = reader.unprotect(&second).unwrap();
        assert!(a.is_protected());
        assert_eq!(a.plain_string().as_str(), "hunter2");
        assert_eq!(b.plain_string().as_str(), "pässwörd");
    }

    #[test]
    fn test_order_matters() {
        let mut writer = ProtectedValueCodec::new(Salsa20Stream::for_protected_stream(b"k"));
        let _skipped = writer.protect(b"first");
        let second = writer.protect(b"second");

        let mut reader = ProtectedValueCodec::new(Salsa20Stream::for_protected_stream(b"k"));
        let wrong = reader.unprotect(&second).unwrap();
        assert_ne!(wrong.plain_bytes().as_slice(), b"second");
    }

    #[test]
    fn test_masked_bytes_differ_from_plaintext() {
        let mut codec = ProtectedValueCodec::new(Salsa20Stream::for_protected_stream(b"k"));
        let encoded = codec.protect(b"plaintext");
        assert_ne!(BASE64.decode(encoded).unwrap(), b"plaintext");
    }

    #[test]
    fn test_invalid_base64() {
        let mut codec = ProtectedValueCodec::new(Salsa20Stream::for_protected_stream(b"k"));
        let err = codec.unprotect("not base64!").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_unprotected_passthrough() {
        let value = BoxedString::unprotected("visible");
        assert!(!value.is_protected());
        assert_eq!(value.plain_string().as_str(), "visible");
        assert_eq!(format!("{:?}", value), "BoxedString::Unprotected(***)");
    }
}
