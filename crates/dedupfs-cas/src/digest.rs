//! Fixed-length content digests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CasError;

/// Longest digest any supported [`HashAlgorithm`](crate::HashAlgorithm) produces.
pub const MAX_DIGEST_LEN: usize = 32;

/// Digest of a block or of a whole file.
///
/// Stored inline so it is `Copy` and can be used as a map key without
/// allocating. Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    len: u8,
    bytes: [u8; MAX_DIGEST_LEN],
}

impl Digest {
    /// Build a digest from raw bytes. Returns `None` for empty input or
    /// input longer than [`MAX_DIGEST_LEN`].
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        if raw.is_empty() || raw.len() > MAX_DIGEST_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_DIGEST_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            len: raw.len() as u8,
            bytes,
        })
    }

    /// Hash output is always within bounds, so this copy cannot fail.
    pub(crate) fn from_hash_output(raw: &[u8]) -> Self {
        let len = raw.len().min(MAX_DIGEST_LEN);
        let mut bytes = [0u8; MAX_DIGEST_LEN];
        bytes[..len].copy_from_slice(&raw[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    /// Parse a lowercase or uppercase hex string.
    pub fn from_hex(hex: &str) -> Result<Self, CasError> {
        let raw = hex::decode(hex).map_err(|e| CasError::InvalidDigest(format!("{hex}: {e}")))?;
        Self::from_slice(&raw)
            .ok_or_else(|| CasError::InvalidDigest(format!("{hex}: bad length {}", raw.len())))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl FromStr for Digest {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_hex()
    }
}

impl TryFrom<String> for Digest {
    type Error = CasError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}
