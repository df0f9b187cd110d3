//! RepoId: Unique identifier for a repository instance in the sync network.
//!
//! Wraps a u64 internally but displays as a 16-character hex string.
//! Peers that announce a different identifier format (a UUID, a JS peer name)
//! are mapped onto the same space with a stable hash, so every connection
//! ends up keyed by a `RepoId`.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Longest foreign identifier accepted in a handshake.
const MAX_FOREIGN_ID_LEN: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepoIdError {
    #[error("Repo ID is empty")]
    Empty,
    #[error("Repo ID is too long ({0} chars)")]
    TooLong(usize),
    #[error("Repo ID contains whitespace or control characters")]
    InvalidCharacters,
}

/// A unique identifier for a repository instance.
///
/// # Examples
/// ```
/// use docsync_core::RepoId;
///
/// let id = RepoId::generate();
/// println!("{}", id); // "a1b2c3d4e5f67890"
///
/// let parsed: RepoId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoId(u64);

impl RepoId {
    /// Generate a new random repo ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for RepoId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for RepoId {
    type Err = RepoIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RepoIdError::Empty);
        }

        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            // 16 hex digits always fit in a u64
            if let Ok(id) = u64::from_str_radix(s, 16) {
                return Ok(Self(id));
            }
        }

        if s.len() > MAX_FOREIGN_ID_LEN {
            return Err(RepoIdError::TooLong(s.len()));
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(RepoIdError::InvalidCharacters);
        }

        // Foreign format (UUIDs, named peers): lowercase so case variants agree
        Ok(Self(fnv1a_hash(&s.to_ascii_lowercase())))
    }
}

impl From<u64> for RepoId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<RepoId> for u64 {
    fn from(id: RepoId) -> u64 {
        id.0
    }
}

// Serialize as hex string for consistency in logs, errors, JSON
impl serde::Serialize for RepoId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for RepoId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// FNV-1a hash. Stable across Rust versions (unlike DefaultHasher).
pub(crate) fn fnv1a_hash(s: &str) -> u64 {
    fnv1a_bytes(s.as_bytes())
}

pub(crate) fn fnv1a_bytes(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_zero_padded() {
        assert_eq!(RepoId(0xff).to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_hex() {
        let id: RepoId = "a1b2c3d4e5f67890".parse().unwrap();
        assert_eq!(id.as_u64(), 0xa1b2c3d4e5f67890);

        let upper: RepoId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(upper, id);
    }

    #[test]
    fn test_roundtrip() {
        let original = RepoId::generate();
        let parsed: RepoId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_uuid_maps_deterministically() {
        let lower: RepoId = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        let upper: RepoId = "550E8400-E29B-41D4-A716-446655440000".parse().unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn test_named_peer_maps_deterministically() {
        let a: RepoId = "browser-peer-x7".parse().unwrap();
        let b: RepoId = "browser-peer-x7".parse().unwrap();
        let c: RepoId = "browser-peer-x8".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!("".parse::<RepoId>(), Err(RepoIdError::Empty));
        assert_eq!(
            "has space".parse::<RepoId>(),
            Err(RepoIdError::InvalidCharacters)
        );
        let long = "x".repeat(MAX_FOREIGN_ID_LEN + 1);
        assert_eq!(
            long.parse::<RepoId>(),
            Err(RepoIdError::TooLong(MAX_FOREIGN_ID_LEN + 1))
        );
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(RepoId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = RepoId::generate();
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, format!("\"{}\"", original));
        let parsed: RepoId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
