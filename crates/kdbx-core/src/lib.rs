//! kdbx-core - KeePass 2.x container decryption
//!
//! This crate turns an encrypted KDBX 3.x container into verified plaintext:
//! composite key derivation, the AES key transform, body decryption, the
//! hashed-block integrity stream and the Salsa20 keystream that masks
//! protected values. [`Database::open`] runs the whole pipeline and checks
//! the header hash the document repeats.

pub mod cipher;
mod database;
pub mod decrypt;
mod digesting;
pub mod document;
mod error;
pub mod hash;
pub mod hashed_block;
pub mod header;
pub mod keys;
pub mod keystream;
pub mod protected;
pub mod source;
mod writer;

pub use crate::cipher::{Cipher, CipherMethod, Padding};
pub use database::{open_database, Database, DatabaseMetadata};
pub use decrypt::{decrypt, DecryptOptions, DecryptedContainer};
pub use digesting::DigestingSource;
pub use document::{scan_document, DocumentSummary, ProtectedField};
pub use error::{BlockFault, Error, ErrorKind, Result};
pub use hash::HashAlgorithm;
pub use hashed_block::{hash_blocks, HashedBlockReader};
pub use header::{Compression, ContainerHeader};
pub use keys::{CompositeKey, KeyFromFile, KeyFromHash, KeyFromPassword, KeySource};
pub use keystream::{RandomStream, Salsa20Stream};
pub use protected::{BoxedString, ProtectedValueCodec};
pub use source::{ByteSource, IoReader, ReaderSource, SliceSource};
pub use writer::ContainerWriter;

// Re-export types that users might need
pub use uuid::Uuid;
pub use zeroize::Zeroizing;
