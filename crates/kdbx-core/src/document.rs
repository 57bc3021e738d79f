//! Scanning the decrypted XML document
//!
//! A single forward pass that pulls out what the container layer needs to
//! check (the repeated header hash) and what a summary needs (name, counts),
//! while unmasking every protected value in document order so the keystream
//! stays aligned.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use xml::reader::{EventReader, XmlEvent};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::keystream::RandomStream;
use crate::protected::{BoxedString, ProtectedValueCodec};

const ROOT: &str = "KeePassFile";

/// A protected value found in the document
#[derive(Debug, Clone)]
pub struct ProtectedField {
    /// The `Key` of the enclosing `String`, when there is one
    pub key: Option<String>,
    pub value: BoxedString,
}

/// What a scan of the document found
#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentSummary {
    pub generator: Option<String>,
    pub database_name: Option<String>,
    #[serde(skip)]
    pub header_hash: Option<Vec<u8>>,
    pub groups: usize,
    /// Live entries; history snapshots are not counted
    pub entries: usize,
    #[serde(skip)]
    pub protected: Vec<ProtectedField>,
}

/// Scan `xml`, unmasking protected values with `stream`
pub fn scan_document<R: RandomStream>(xml: &[u8], stream: R) -> Result<DocumentSummary> {
    let mut codec = ProtectedValueCodec::new(stream);
    let mut summary = DocumentSummary::default();

    let mut path: Vec<String> = Vec::new();
    let mut text = Zeroizing::new(String::new());
    let mut protected_open = false;
    let mut string_key: Option<String> = None;

    for event in EventReader::new(xml) {
        let event = event.map_err(|e| Error::Format(format!("malformed document: {}", e)))?;
        match event {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                let name = name.local_name;
                if path.is_empty() && name != ROOT {
                    return Err(Error::Format(format!(
                        "document root is <{}>, expected <{}>",
                        name, ROOT
                    )));
                }

                let parent = path.last().map(String::as_str);
                let under_root = path.len() >= 2 && path[1] == "Root";
                match name.as_str() {
                    "Group" if under_root => summary.groups += 1,
                    "Entry" if parent == Some("Group") => summary.entries += 1,
                    "String" => string_key = None,
                    _ => {}
                }

                protected_open = attributes.iter().any(|attr| {
                    attr.name.local_name == "Protected" && attr.value.eq_ignore_ascii_case("true")
                });
                text.clear();
                path.push(name);
            }
            XmlEvent::Characters(chunk) | XmlEvent::CData(chunk) => text.push_str(&chunk),
            XmlEvent::EndElement { .. } => {
                let Some(name) = path.pop() else {
                    continue;
                };
                let parent = path.last().map(String::as_str);

                if protected_open {
                    let value = codec.unprotect(&text)?;
                    let key = if parent == Some("String") {
                        string_key.clone()
                    } else {
                        None
                    };
                    tracing::trace!(key = key.as_deref(), "unmasked protected value");
                    summary.protected.push(ProtectedField { key, value });
                    protected_open = false;
                } else if path.len() == 2 && path[1] == "Meta" {
                    match name.as_str() {
                        "Generator" => summary.generator = Some(text.trim().to_string()),
                        "DatabaseName" => summary.database_name = Some(text.to_string()),
                        "HeaderHash" => {
                            let hash = BASE64
                                .decode(text.trim())
                                .map_err(|e| Error::Format(format!("invalid header hash: {}", e)))?;
                            summary.header_hash = Some(hash);
                        }
                        _ => {}
                    }
                } else if name == "Key" && parent == Some("String") {
                    string_key = Some(text.to_string());
                }
                text.clear();
            }
            _ => {}
        }
    }

    if summary.database_name.is_none() && summary.groups == 0 {
        return Err(Error::Format("empty database".to_string()));
    }

    tracing::debug!(
        groups = summary.groups,
        entries = summary.entries,
        protected = summary.protected.len(),
        "document scanned"
    );
    Ok(summary)
}
