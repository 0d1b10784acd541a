//! Scan context assembled during negotiation
//!
//! The Config stage contributes [`Paths`] and arguments, the Header stage
//! contributes the [`ScanHeader`]. Once the Stream stage starts the context
//! is frozen and shared read-only with every strategy.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Scan metadata failed to parse
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderParseError {
    #[error("Scan header is empty")]
    Empty,

    #[error("Scan header is not valid UTF-8 at byte {valid_up_to}")]
    InvalidUtf8 { valid_up_to: usize },
}

/// Parsed scan metadata
///
/// The server treats the document as opaque: it is validated as text and
/// forwarded verbatim to external modules and remote workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHeader {
    document: String,
}

impl ScanHeader {
    /// Parse a serialized header blob
    pub fn parse(raw: &[u8]) -> Result<Self, HeaderParseError> {
        let document = std::str::from_utf8(raw).map_err(|e| HeaderParseError::InvalidUtf8 {
            valid_up_to: e.valid_up_to(),
        })?;

        if document.trim_matches(|c: char| c.is_whitespace() || c == '\0').is_empty() {
            return Err(HeaderParseError::Empty);
        }

        Ok(Self {
            document: document.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.document
    }

    /// Bytes as they should be re-sent downstream
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.document.as_bytes())
    }
}

/// Filesystem locations the server resolves against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paths {
    /// Installation root; pipeline files live under `<home>/pipelines`
    pub home: PathBuf,
    /// Scratch directory handed to external modules
    pub working_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            home: PathBuf::from("/usr/local/share/streamgate"),
            working_dir: std::env::temp_dir(),
        }
    }
}

impl Paths {
    pub fn pipelines_dir(&self) -> PathBuf {
        self.home.join("pipelines")
    }
}

/// Everything a strategy may know about the scan it is processing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanContext {
    /// `None` when the peer closed the Header stage without metadata
    pub header: Option<ScanHeader>,
    pub paths: Paths,
    /// Server arguments, flattened to strings
    pub args: BTreeMap<String, String>,
}

impl ScanContext {
    pub fn new(header: Option<ScanHeader>, paths: Paths, args: BTreeMap<String, String>) -> Self {
        Self { header, paths, args }
    }

    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_text_document() {
        let header = ScanHeader::parse(b"<ismrmrdHeader></ismrmrdHeader>").unwrap();
        assert_eq!(header.as_str(), "<ismrmrdHeader></ismrmrdHeader>");
        assert_eq!(&header.to_bytes()[..], b"<ismrmrdHeader></ismrmrdHeader>");
    }

    #[test]
    fn test_parse_rejects_blank_and_binary() {
        assert_eq!(ScanHeader::parse(b"  \n\0"), Err(HeaderParseError::Empty));
        assert_eq!(
            ScanHeader::parse(&[b'o', b'k', 0xFF, 0xFE]),
            Err(HeaderParseError::InvalidUtf8 { valid_up_to: 2 })
        );
    }

    #[test]
    fn test_paths_roundtrip_through_json() {
        let paths = Paths {
            home: PathBuf::from("/opt/streamgate"),
            working_dir: PathBuf::from("/tmp/work"),
        };
        let json = serde_json::to_string(&paths).unwrap();
        let back: Paths = serde_json::from_str(&json).unwrap();
        assert_eq!(back, paths);
        assert_eq!(back.pipelines_dir(), PathBuf::from("/opt/streamgate/pipelines"));
    }
}
