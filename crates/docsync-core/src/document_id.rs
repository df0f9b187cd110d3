//! DocumentId: the identity of a replicated document.
//!
//! Ids come verbatim from URL fragments. Any non-empty text without control
//! characters is accepted; storage escapes ids before using them as keys.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const MAX_DOCUMENT_ID_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentIdError {
    #[error("Document ID is empty")]
    Empty,
    #[error("Document ID is too long ({0} chars, max {MAX_DOCUMENT_ID_LEN})")]
    TooLong(usize),
    #[error("Document ID contains invalid character {0:?}")]
    InvalidCharacter(char),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    /// Generate a fresh id (UUID v4 text).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DocumentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocumentId {
    type Err = DocumentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DocumentIdError::Empty);
        }
        if s.len() > MAX_DOCUMENT_ID_LEN {
            return Err(DocumentIdError::TooLong(s.len()));
        }
        if let Some(c) = s.chars().find(|c| c.is_control()) {
            return Err(DocumentIdError::InvalidCharacter(c));
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for DocumentId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DocumentId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
