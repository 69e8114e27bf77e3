//! Small helpers shared across the crate — content hashing, mostly.
//!
//! Mirrors the teacher's `blake3_hash_bytes` helper: the durable identifiers
//! assigned to archives and call logs are derived from this hash, not from
//! random UUIDs, so that two independently-created stores with identical
//! seed material collide predictably in tests.

/// Computes the BLAKE3 digest of `data` and returns it as a lowercase hex
/// string.
///
/// # Examples
///
/// ```
/// use callframe::util::blake3_hex;
///
/// let digest = blake3_hex(b"callframe");
/// assert_eq!(digest.len(), 64);
/// ```
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
