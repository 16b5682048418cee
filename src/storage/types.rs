//! Storage types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Longest extension accepted in a blob id
pub const MAX_EXTENSION_LEN: usize = 16;

// ============================================================================
// Namespace
// ============================================================================

/// Top-level namespace a blob lives under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// The uploaded media as supplied
    Original,
    /// Derived preview, sharing the original's id
    Thumbnail,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::Original, Namespace::Thumbnail];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Original => "original",
            Namespace::Thumbnail => "thumbnail",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "original" => Ok(Namespace::Original),
            "thumbnail" => Ok(Namespace::Thumbnail),
            other => Err(StoreError::InvalidKey(format!("unknown namespace '{}'", other))),
        }
    }
}

// ============================================================================
// Blob Id
// ============================================================================

/// Content-derived blob id of the form `<hex-digest>.<ext>`
///
/// Both parts are normalised to lowercase. The charset is restricted to hex
/// digits, one dot and an alphanumeric extension, so an id is always a safe
/// single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId(String);

impl BlobId {
    /// Build an id from a hex digest and a file extension
    pub fn new(digest: &str, extension: &str) -> Result<Self, StoreError> {
        Self::parse(&format!("{}.{}", digest, extension))
    }

    /// Parse and validate an id
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidKey(format!("malformed blob id '{}'", raw));

        let (digest, extension) = raw.split_once('.').ok_or_else(invalid)?;

        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        if extension.is_empty()
            || extension.len() > MAX_EXTENSION_LEN
            || !extension.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(invalid());
        }

        Ok(Self(format!(
            "{}.{}",
            digest.to_ascii_lowercase(),
            extension.to_ascii_lowercase()
        )))
    }

    /// The hex digest part
    pub fn digest(&self) -> &str {
        self.0.split_once('.').map(|(digest, _)| digest).unwrap_or(&self.0)
    }

    /// The extension part, without the dot
    pub fn extension(&self) -> &str {
        self.0.split_once('.').map(|(_, ext)| ext).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BlobId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> Self {
        id.0
    }
}

// ============================================================================
// Blob Key
// ============================================================================

/// Namespaced storage key, written `namespace/id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobKey {
    pub namespace: Namespace,
    pub id: BlobId,
}

impl BlobKey {
    pub fn new(namespace: Namespace, id: BlobId) -> Self {
        Self { namespace, id }
    }

    pub fn original(id: BlobId) -> Self {
        Self::new(Namespace::Original, id)
    }

    pub fn thumbnail(id: BlobId) -> Self {
        Self::new(Namespace::Thumbnail, id)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

impl FromStr for BlobKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, id) = s
            .split_once('/')
            .ok_or_else(|| StoreError::InvalidKey(format!("missing namespace in '{}'", s)))?;

        Ok(Self {
            namespace: namespace.parse()?,
            id: id.parse()?,
        })
    }
}

impl TryFrom<String> for BlobKey {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlobKey> for String {
    fn from(key: BlobKey) -> Self {
        key.to_string()
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Blob store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Blob not found: {0}")]
    NotFound(BlobKey),

    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}
