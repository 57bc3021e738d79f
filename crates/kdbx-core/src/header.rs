//! KDBX 3.x outer header
//!
//! The header is a fixed signature and version followed by type-length-value
//! fields (`u8` id, `u16` LE length, data) up to an End field. Only the fields
//! needed to drive decryption are modeled.

use byteorder::{LittleEndian, WriteBytesExt};
use serde::Serialize;
use uuid::{uuid, Uuid};
use zeroize::Zeroizing;

use crate::cipher::CipherMethod;
use crate::error::{Error, Result};
use crate::source::ByteSource;

pub const SIGNATURE_1: u32 = 0x9AA2_D903;
pub const SIGNATURE_2: u32 = 0xB54B_FB67;
const SIGNATURE_2_KDB: u32 = 0xB54B_FB65;
const SIGNATURE_2_PRE_RELEASE: u32 = 0xB54B_FB66;

/// Version written by [`ContainerHeader::to_bytes`] (3.1)
pub const VERSION_3_1: u32 = 0x0003_0001;

pub const CIPHER_AES256: Uuid = uuid!("31c1f2e6-bf71-4350-be58-05216afc5aff");

const SEED_LEN: usize = 32;
const IV_LEN: usize = 16;

// Header field ids
const FIELD_END: u8 = 0;
const FIELD_COMMENT: u8 = 1;
const FIELD_CIPHER_ID: u8 = 2;
const FIELD_COMPRESSION: u8 = 3;
const FIELD_MASTER_SEED: u8 = 4;
const FIELD_TRANSFORM_SEED: u8 = 5;
const FIELD_TRANSFORM_ROUNDS: u8 = 6;
const FIELD_ENCRYPTION_IV: u8 = 7;
const FIELD_PROTECTED_STREAM_KEY: u8 = 8;
const FIELD_STREAM_START_BYTES: u8 = 9;
const FIELD_INNER_RANDOM_STREAM_ID: u8 = 10;

const END_FIELD_DATA: [u8; 4] = [0x0D, 0x0A, 0x0D, 0x0A];

/// Body compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl Compression {
    fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            other => Err(Error::Format(format!("unknown compression algorithm {}", other))),
        }
    }

    fn id(self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
        }
    }
}

/// Algorithm masking protected values in the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InnerStream {
    None,
    ArcFour,
    Salsa20,
    ChaCha20,
}

impl InnerStream {
    fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(InnerStream::None),
            1 => Ok(InnerStream::ArcFour),
            2 => Ok(InnerStream::Salsa20),
            3 => Ok(InnerStream::ChaCha20),
            other => Err(Error::Format(format!("unknown inner random stream {}", other))),
        }
    }

    fn id(self) -> u32 {
        match self {
            InnerStream::None => 0,
            InnerStream::ArcFour => 1,
            InnerStream::Salsa20 => 2,
            InnerStream::ChaCha20 => 3,
        }
    }
}

/// The parsed outer header of a KDBX 3.x container
#[derive(Clone)]
pub struct ContainerHeader {
    /// Major version in the high 16 bits, minor in the low
    pub version: u32,
    pub comment: Option<Vec<u8>>,
    pub cipher_id: Uuid,
    pub compression: Compression,
    pub master_seed: Zeroizing<Vec<u8>>,
    pub transform_seed: Zeroizing<Vec<u8>>,
    pub transform_rounds: u64,
    pub encryption_iv: Vec<u8>,
    pub protected_stream_key: Zeroizing<Vec<u8>>,
    pub stream_start_bytes: Zeroizing<Vec<u8>>,
    pub inner_stream: InnerStream,
}

impl ContainerHeader {
    /// Parse a header from `source`, leaving it positioned at the first byte
    /// of the encrypted body
    pub fn read<S: ByteSource>(source: &mut S) -> Result<Self> {
        let sig1 = source.read_u32_le()?;
        let sig2 = source.read_u32_le()?;
        if sig1 != SIGNATURE_1 {
            return Err(Error::Format("not a KeePass database".to_string()));
        }
        match sig2 {
            SIGNATURE_2 => {}
            SIGNATURE_2_KDB => {
                return Err(Error::Format(
                    "KeePass 1.x databases (.kdb) are not supported".to_string(),
                ))
            }
            SIGNATURE_2_PRE_RELEASE => {
                return Err(Error::Format(
                    "pre-release KeePass 2.x databases are not supported".to_string(),
                ))
            }
            _ => return Err(Error::Format("not a KeePass database".to_string())),
        }

        let version = source.read_u32_le()?;
        let major = version >> 16;
        let minor = version & 0xFFFF;
        match major {
            2 | 3 => {}
            4 => {
                return Err(Error::Format(format!(
                    "KDBX {}.{} databases are not supported",
                    major, minor
                )))
            }
            _ => {
                return Err(Error::Format(format!(
                    "unsupported database version {}.{}",
                    major, minor
                )))
            }
        }

        let mut comment = None;
        let mut cipher_id = None;
        let mut compression = None;
        let mut master_seed = None;
        let mut transform_seed = None;
        let mut transform_rounds = None;
        let mut encryption_iv = None;
        let mut protected_stream_key = None;
        let mut stream_start_bytes = None;
        let mut inner_stream = None;

        loop {
            let field_id = source.read_u8()?;
            let field_len = source.read_u16_le()? as usize;
            let data = Zeroizing::new(source.read_exact_bytes(field_len)?);
            tracing::trace!(field_id, field_len, "header field");

            match field_id {
                FIELD_END => break,
                FIELD_COMMENT => comment = Some(data.to_vec()),
                FIELD_CIPHER_ID => {
                    let id = Uuid::from_slice(&data)
                        .map_err(|_| Error::Format("malformed cipher id".to_string()))?;
                    cipher_id = Some(id);
                }
                FIELD_COMPRESSION => {
                    let id = read_u32_field(&data, "compression")?;
                    compression = Some(Compression::from_id(id)?);
                }
                FIELD_MASTER_SEED => {
                    master_seed = Some(fixed_len(data, SEED_LEN, "master seed")?);
                }
                FIELD_TRANSFORM_SEED => {
                    transform_seed = Some(fixed_len(data, SEED_LEN, "transform seed")?);
                }
                FIELD_TRANSFORM_ROUNDS => {
                    if data.len() != 8 {
                        return Err(Error::Format("malformed transform rounds".to_string()));
                    }
                    transform_rounds = Some(u64::from_le_bytes([
                        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
                    ]));
                }
                FIELD_ENCRYPTION_IV => {
                    encryption_iv = Some(fixed_len(data, IV_LEN, "encryption IV")?.to_vec());
                }
                FIELD_PROTECTED_STREAM_KEY => {
                    if data.is_empty() {
                        return Err(Error::Format("empty protected stream key".to_string()));
                    }
                    protected_stream_key = Some(data);
                }
                FIELD_STREAM_START_BYTES => {
                    stream_start_bytes = Some(fixed_len(data, SEED_LEN, "stream start bytes")?);
                }
                FIELD_INNER_RANDOM_STREAM_ID => {
                    let id = read_u32_field(&data, "inner random stream id")?;
                    inner_stream = Some(InnerStream::from_id(id)?);
                }
                other => tracing::debug!(field_id = other, "ignoring unknown header field"),
            }
        }

        Ok(Self {
            version,
            comment,
            cipher_id: cipher_id.ok_or_else(|| missing("cipher id"))?,
            compression: compression.ok_or_else(|| missing("compression flags"))?,
            master_seed: master_seed.ok_or_else(|| missing("master seed"))?,
            transform_seed: transform_seed.ok_or_else(|| missing("transform seed"))?,
            transform_rounds: transform_rounds.ok_or_else(|| missing("transform rounds"))?,
            encryption_iv: encryption_iv.ok_or_else(|| missing("encryption IV"))?,
            protected_stream_key: protected_stream_key
                .ok_or_else(|| missing("protected stream key"))?,
            stream_start_bytes: stream_start_bytes.ok_or_else(|| missing("stream start bytes"))?,
            inner_stream: inner_stream.ok_or_else(|| missing("inner random stream id"))?,
        })
    }

    /// A header with fresh random seeds, IV and stream keys
    pub fn generate(transform_rounds: u64, compression: Compression) -> Result<Self> {
        Ok(Self {
            version: VERSION_3_1,
            comment: None,
            cipher_id: CIPHER_AES256,
            compression,
            master_seed: random_bytes(SEED_LEN)?,
            transform_seed: random_bytes(SEED_LEN)?,
            transform_rounds,
            encryption_iv: random_bytes(IV_LEN)?.to_vec(),
            protected_stream_key: random_bytes(SEED_LEN)?,
            stream_start_bytes: random_bytes(SEED_LEN)?,
            inner_stream: InnerStream::Salsa20,
        })
    }

    /// The cipher named by `cipher_id`, if supported
    pub fn cipher_method(&self) -> Result<CipherMethod> {
        if self.cipher_id == CIPHER_AES256 {
            Ok(CipherMethod::Aes256Cbc)
        } else {
            Err(Error::Format(format!("unsupported cipher {}", self.cipher_id)))
        }
    }

    pub fn major_version(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn minor_version(&self) -> u16 {
        (self.version & 0xFFFF) as u16
    }

    /// Serialize the header, End field included
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(SIGNATURE_1)?;
        out.write_u32::<LittleEndian>(SIGNATURE_2)?;
        out.write_u32::<LittleEndian>(self.version)?;

        if let Some(comment) = &self.comment {
            write_field(&mut out, FIELD_COMMENT, comment)?;
        }
        write_field(&mut out, FIELD_CIPHER_ID, self.cipher_id.as_bytes())?;
        write_field(&mut out, FIELD_COMPRESSION, &self.compression.id().to_le_bytes())?;
        write_field(&mut out, FIELD_MASTER_SEED, &self.master_seed)?;
        write_field(&mut out, FIELD_TRANSFORM_SEED, &self.transform_seed)?;
        write_field(&mut out, FIELD_TRANSFORM_ROUNDS, &self.transform_rounds.to_le_bytes())?;
        write_field(&mut out, FIELD_ENCRYPTION_IV, &self.encryption_iv)?;
        write_field(&mut out, FIELD_PROTECTED_STREAM_KEY, &self.protected_stream_key)?;
        write_field(&mut out, FIELD_STREAM_START_BYTES, &self.stream_start_bytes)?;
        write_field(&mut out, FIELD_INNER_RANDOM_STREAM_ID, &self.inner_stream.id().to_le_bytes())?;
        write_field(&mut out, FIELD_END, &END_FIELD_DATA)?;
        Ok(out)
    }
}

impl std::fmt::Debug for ContainerHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHeader")
            .field("version", &format_args!("{}.{}", self.major_version(), self.minor_version()))
            .field("cipher_id", &self.cipher_id)
            .field("compression", &self.compression)
            .field("transform_rounds", &self.transform_rounds)
            .field("inner_stream", &self.inner_stream)
            .finish_non_exhaustive()
    }
}

fn write_field(out: &mut Vec<u8>, id: u8, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| Error::Format(format!("header field {} too long", id)))?;
    out.write_u8(id)?;
    out.write_u16::<LittleEndian>(len)?;
    out.extend_from_slice(data);
    Ok(())
}

fn read_u32_field(data: &[u8], name: &str) -> Result<u32> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::Format(format!("malformed {}", name)))?;
    Ok(u32::from_le_bytes(bytes))
}

fn fixed_len(data: Zeroizing<Vec<u8>>, len: usize, name: &str) -> Result<Zeroizing<Vec<u8>>> {
    if data.len() != len {
        return Err(Error::Format(format!(
            "{} must be {} bytes, got {}",
            name,
            len,
            data.len()
        )));
    }
    Ok(data)
}

fn missing(name: &str) -> Error {
    Error::Format(format!("header is missing the {}", name))
}

fn random_bytes(len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(vec![0u8; len]);
    getrandom::fill(&mut buf)
        .map_err(|e| Error::Crypto(format!("random number generation failed: {}", e)))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digesting::DigestingSource;
    use crate::error::ErrorKind;
    use crate::hash::HashAlgorithm;
    use crate::source::SliceSource;

    fn sample() -> ContainerHeader {
        ContainerHeader {
            version: VERSION_3_1,
            comment: None,
            cipher_id: CIPHER_AES256,
            compression: Compression::None,
            master_seed: Zeroizing::new(vec![1u8; 32]),
            transform_seed: Zeroizing::new(vec![2u8; 32]),
            transform_rounds: 6000,
            encryption_iv: vec![3u8; 16],
            protected_stream_key: Zeroizing::new(vec![4u8; 32]),
            stream_start_bytes: Zeroizing::new(vec![5u8; 32]),
            inner_stream: InnerStream::Salsa20,
        }
    }

    #[test]
    fn test_parse_serialized_header() {
        let mut bytes = sample().to_bytes().unwrap();
        let header_len = bytes.len();
        bytes.extend_from_slice(b"body");

        let mut source =
            DigestingSource::new(SliceSource::new(bytes.clone()), HashAlgorithm::Sha256);
        let header = ContainerHeader::read(&mut source).unwrap();

        assert_eq!(header.major_version(), 3);
        assert_eq!(header.minor_version(), 1);
        assert_eq!(header.transform_rounds, 6000);
        assert_eq!(header.compression, Compression::None);
        assert_eq!(header.inner_stream, InnerStream::Salsa20);
        assert_eq!(*header.master_seed, vec![1u8; 32]);
        assert_eq!(header.cipher_method().unwrap(), CipherMethod::Aes256Cbc);

        assert_eq!(source.consumed(), header_len);
        assert_eq!(source.digest(), HashAlgorithm::Sha256.digest(&bytes[..header_len]));
        assert_eq!(source.into_inner().read_to_end().unwrap(), b"body");
    }

    #[test]
    fn test_comment_and_unknown_fields() {
        let mut header = sample();
        header.comment = Some(b"made by hand".to_vec());
        let mut bytes = header.to_bytes().unwrap();
        // Splice an unknown field in right after the version
        let unknown = [0x42u8, 0x02, 0x00, 0xAA, 0xBB];
        bytes.splice(12..12, unknown);

        let parsed = ContainerHeader::read(&mut SliceSource::new(bytes)).unwrap();
        assert_eq!(parsed.comment.as_deref(), Some(&b"made by hand"[..]));
    }

    #[test]
    fn test_rejects_other_formats() {
        let mut kdbx4 = sample().to_bytes().unwrap();
        kdbx4[8..12].copy_from_slice(&0x0004_0000u32.to_le_bytes());
        let err = ContainerHeader::read(&mut SliceSource::new(kdbx4)).unwrap_err();
        assert!(err.to_string().contains("KDBX 4.0"));

        let mut kdb = sample().to_bytes().unwrap();
        kdb[4..8].copy_from_slice(&SIGNATURE_2_KDB.to_le_bytes());
        let err = ContainerHeader::read(&mut SliceSource::new(kdb)).unwrap_err();
        assert!(err.to_string().contains("KeePass 1.x"));

        let zip = b"PK\x03\x04 not a db".to_vec();
        let err = ContainerHeader::read(&mut SliceSource::new(zip)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_missing_field() {
        let bytes = sample().to_bytes().unwrap();
        // Drop the trailing inner stream id and End fields, re-add End only
        let end_len = 3 + END_FIELD_DATA.len();
        let stream_id_len = 3 + 4;
        let mut truncated = bytes[..bytes.len() - end_len - stream_id_len].to_vec();
        truncated.extend_from_slice(&[FIELD_END, 0, 0]);

        let err = ContainerHeader::read(&mut SliceSource::new(truncated)).unwrap_err();
        assert!(err.to_string().contains("inner random stream id"));
    }

    #[test]
    fn test_wrong_seed_length() {
        let mut header = sample();
        header.master_seed = Zeroizing::new(vec![1u8; 16]);
        let bytes = header.to_bytes().unwrap();
        let err = ContainerHeader::read(&mut SliceSource::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_truncated_header_is_short_read() {
        let bytes = sample().to_bytes().unwrap();
        let err = ContainerHeader::read(&mut SliceSource::new(bytes[..40].to_vec())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShortRead);
    }

    #[test]
    fn test_generate_is_random() {
        let a = ContainerHeader::generate(10, Compression::Gzip).unwrap();
        let b = ContainerHeader::generate(10, Compression::Gzip).unwrap();
        assert_ne!(*a.master_seed, *b.master_seed);
        assert_eq!(a.encryption_iv.len(), 16);
        assert_eq!(a.inner_stream, InnerStream::Salsa20);
    }

    #[test]
    fn test_debug_hides_seeds() {
        let rendered = format!("{:?}", sample());
        assert!(rendered.contains("3.1"));
        assert!(!rendered.contains("master_seed"));
    }
}
