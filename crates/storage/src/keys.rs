//! Helper functions for key ranges used by storage implementations.

/// Compute the exclusive end key for a prefix scan.
///
/// Returns `None` if the prefix is empty or all `0xFF` bytes (no valid
/// exclusive upper bound); callers then scan to the end of the keyspace.
pub fn next_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] < 255 {
            next[i] += 1;
            next.truncate(i + 1);
            return Some(next);
        }
    }
    None
}
