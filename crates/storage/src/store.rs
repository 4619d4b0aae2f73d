//! The byte-level key-value store trait implemented by all backends.

use lodestone_codec::CodecError;
use thiserror::Error;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error taxonomy shared by the whole state stack.
///
/// Callers (validator, VM) dispatch on the kind: a `KeyNotFound` during
/// transaction execution aborts the transaction, an `Io` during persist
/// abandons the block, an `InvariantViolation` indicates a logic bug or
/// double-apply upstream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A required key is absent.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Stored bytes failed to parse to the expected schema.
    #[error("decode error: {0}")]
    Decode(#[from] CodecError),

    /// The underlying byte store failed.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A schema-level invariant does not hold.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl StoreError {
    /// `KeyNotFound` for a raw byte key, rendered as hex.
    pub fn key_not_found(key: &[u8]) -> Self {
        StoreError::KeyNotFound(hex::encode(key))
    }

    /// `InvariantViolation` for a `put` that would overwrite a key with
    /// different bytes.
    pub fn content_mismatch(key: &[u8]) -> Self {
        StoreError::InvariantViolation(format!(
            "content-address mismatch: key {} already holds different bytes",
            hex::encode(key),
        ))
    }
}

/// An opaque persistent map from byte keys to byte values.
///
/// The world-state stack stores trie nodes here keyed by their own content
/// hash, so the store is effectively append-only: `put` of a key that
/// already holds the same bytes is a no-op, and `put` of a key that holds
/// *different* bytes is an [`StoreError::InvariantViolation`] — it would
/// mean two distinct preimages share a digest.
///
/// Writes are durable before they return. The store is single-writer
/// relative to the state stack using it; concurrent readers are fine, as
/// nodes are immutable once written.
pub trait RawKvStore: Send + Sync {
    /// Look up a key, `None` when absent.
    fn get_opt(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Write a key. See the trait docs for the content-address discipline.
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Delete a key. Deleting an absent key is not an error.
    fn remove(&self, key: &[u8]) -> StoreResult<()>;

    /// Return at most `limit` `(key, value)` pairs whose key starts with
    /// `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Look up a key, failing with [`StoreError::KeyNotFound`] when absent.
    fn get(&self, key: &[u8]) -> StoreResult<Vec<u8>> {
        self.get_opt(key)?
            .ok_or_else(|| StoreError::key_not_found(key))
    }

    /// Check key presence.
    fn exists(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get_opt(key)?.is_some())
    }
}
