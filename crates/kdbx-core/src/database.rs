//! Opening KeePass databases

use std::path::Path;

use serde::Serialize;
use zeroize::Zeroizing;

use crate::decrypt::{decrypt, DecryptOptions};
use crate::document::{scan_document, DocumentSummary, ProtectedField};
use crate::error::{BlockFault, Error, Result};
use crate::header::{Compression, ContainerHeader};
use crate::keys::CompositeKey;
use crate::protected::BoxedString;
use crate::source::{ByteSource, ReaderSource};

/// A decrypted and checked KeePass database
pub struct Database {
    header: ContainerHeader,
    header_hash: Vec<u8>,
    document: DocumentSummary,
    xml: Zeroizing<Vec<u8>>,
    faults: Vec<BlockFault>,
    header_hash_verified: bool,
}

/// Metadata about the database, safe to display or serialize
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseMetadata {
    pub name: String,
    pub generator: Option<String>,
    pub version: String,
    pub cipher: String,
    pub compression: Compression,
    pub transform_rounds: u64,
    pub entry_count: usize,
    pub group_count: usize,
    pub protected_values: usize,
    pub header_hash: String,
    pub header_hash_verified: bool,
    pub corrupted: bool,
}

impl Database {
    /// Decrypt the container in `source`, scan its document and check the
    /// header hash the document repeats against the one computed while
    /// parsing
    pub fn open<S: ByteSource>(
        source: S,
        key: &CompositeKey,
        options: &DecryptOptions,
    ) -> Result<Self> {
        let mut container = decrypt(source, key, options)?;
        let document = scan_document(&container.content, &mut container.stream)?;

        let header_hash_verified = match &document.header_hash {
            Some(stored) if *stored == container.header_hash => true,
            Some(_) if options.verify_header_hash => {
                return Err(Error::Format("header hash mismatch".to_string()));
            }
            None if options.verify_header_hash => {
                return Err(Error::Format("document does not carry a header hash".to_string()));
            }
            _ => {
                tracing::warn!("header hash not verified");
                false
            }
        };

        Ok(Self {
            header: container.header,
            header_hash: container.header_hash,
            document,
            xml: container.content,
            faults: container.faults,
            header_hash_verified,
        })
    }

    /// Open the database file at `path`
    pub fn open_path(
        path: impl AsRef<Path>,
        key: &CompositeKey,
        options: &DecryptOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Opening database {}", path.display());
        Self::open(ReaderSource::open(path)?, key, options)
    }

    /// Database name, empty when the document has none
    pub fn name(&self) -> &str {
        self.document.database_name.as_deref().unwrap_or("")
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn header_hash(&self) -> &[u8] {
        &self.header_hash
    }

    pub fn document(&self) -> &DocumentSummary {
        &self.document
    }

    /// The decrypted XML. Protected values in it are still masked.
    pub fn xml(&self) -> &[u8] {
        &self.xml
    }

    /// Protected values in document order
    pub fn protected_fields(&self) -> &[ProtectedField] {
        &self.document.protected
    }

    /// Protected values stored under `key`, e.g. `"Password"`
    pub fn protected_values<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Iterator<Item = &'a BoxedString> + 'a {
        self.document
            .protected
            .iter()
            .filter(move |field| field.key.as_deref() == Some(key))
            .map(|field| &field.value)
    }

    pub fn is_corrupted(&self) -> bool {
        !self.faults.is_empty()
    }

    pub fn faults(&self) -> &[BlockFault] {
        &self.faults
    }

    pub fn metadata(&self) -> DatabaseMetadata {
        DatabaseMetadata {
            name: self.name().to_string(),
            generator: self.document.generator.clone(),
            version: format!("{}.{}", self.header.major_version(), self.header.minor_version()),
            cipher: self
                .header
                .cipher_method()
                .map(|method| method.to_string())
                .unwrap_or_else(|_| self.header.cipher_id.to_string()),
            compression: self.header.compression,
            transform_rounds: self.header.transform_rounds,
            entry_count: self.document.entries,
            group_count: self.document.groups,
            protected_values: self.document.protected.len(),
            header_hash: hex::encode(&self.header_hash),
            header_hash_verified: self.header_hash_verified,
            corrupted: self.is_corrupted(),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("header", &self.header)
            .field("document", &self.document)
            .field("xml_len", &self.xml.len())
            .field("faults", &self.faults)
            .finish_non_exhaustive()
    }
}

/// Shorthand for [`Database::open`]
pub fn open_database<S: ByteSource>(
    source: S,
    key: &CompositeKey,
    options: &DecryptOptions,
) -> Result<Database> {
    Database::open(source, key, options)
}
