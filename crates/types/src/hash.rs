//! 32-byte Blake3 digests.

use lodestone_codec::{Codec, CodecResult, Reader};
use std::fmt;

/// A 32-byte Blake3 digest.
///
/// Doubles as a content address (trie nodes, contract code) and as a
/// tree-root commitment. Ordered and hashable so it can key ordered
/// maps; every constructor is deterministic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Digest width in bytes.
    pub const BYTES: usize = 32;

    /// The all-zero digest, reserved as a sentinel (empty tree root).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Digest arbitrary bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Wrap raw digest bytes without rehashing.
    ///
    /// # Panics
    ///
    /// If `bytes` is not exactly [`Hash::BYTES`] long.
    pub fn from_hash_bytes(bytes: &[u8]) -> Self {
        let raw: [u8; 32] = bytes.try_into().expect("raw digest must be 32 bytes");
        Self(raw)
    }

    /// Digest several slices as one continuous input.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Parse a 64-character lowercase or uppercase hex string.
    pub fn from_hex(hex: &str) -> Result<Self, HexError> {
        if hex.len() != 2 * Self::BYTES {
            return Err(HexError::WrongLength { actual: hex.len() });
        }
        let mut raw = [0u8; Self::BYTES];
        hex::decode_to_slice(hex, &mut raw).map_err(|_| HexError::InvalidCharacter)?;
        Ok(Self(raw))
    }

    /// Lowercase hex rendering of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Borrow the digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The digest as an owned array.
    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    /// Whether this is the all-zero sentinel.
    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }
}

impl Codec for Hash {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self(r.read_array()?))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full digests drown out everything else in debug output; a
        // 12-character prefix is plenty to tell values apart.
        write!(f, "Hash({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Failure parsing a digest from hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    /// The string does not contain exactly 64 hex characters.
    #[error("hash hex must be 64 characters, got {actual}")]
    WrongLength {
        /// Length of the rejected string.
        actual: usize,
    },

    /// The string contains a character outside `[0-9a-fA-F]`.
    #[error("hash hex contains a non-hex character")]
    InvalidCharacter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic_and_input_sensitive() {
        assert_eq!(Hash::from_bytes(b"abc"), Hash::from_bytes(b"abc"));
        assert_ne!(Hash::from_bytes(b"abc"), Hash::from_bytes(b"abd"));
    }

    #[test]
    fn test_from_parts_equals_concatenated_input() {
        assert_eq!(
            Hash::from_parts(&[b"ab", b"cd", b""]),
            Hash::from_bytes(b"abcd")
        );
    }

    #[test]
    fn test_hex_roundtrip() {
        let digest = Hash::from_bytes(b"roundtrip");
        assert_eq!(Hash::from_hex(&digest.to_hex()), Ok(digest));
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert_eq!(
            Hash::from_hex("abc"),
            Err(HexError::WrongLength { actual: 3 })
        );
        let not_hex = "zz".repeat(32);
        assert_eq!(Hash::from_hex(&not_hex), Err(HexError::InvalidCharacter));
    }

    #[test]
    fn test_zero_sentinel() {
        assert!(Hash::ZERO.is_zero());
        assert!(!Hash::from_bytes(&[]).is_zero());
    }

    #[test]
    fn test_from_hash_bytes_preserves_input() {
        let digest = Hash::from_bytes(b"wrap");
        assert_eq!(Hash::from_hash_bytes(digest.as_bytes()), digest);
    }

    #[test]
    fn test_codec_roundtrip_is_fixed_width() {
        let digest = Hash::from_bytes(b"codec");
        let encoded = digest.encode();
        assert_eq!(encoded.len(), Hash::BYTES);
        assert_eq!(Hash::decode(&encoded), Ok(digest));
    }
}
