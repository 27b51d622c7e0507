//! Content hashing helpers

/// BLAKE3 hash of the input, hex-encoded.
///
/// Content identifiers inside a shard are the blake3 hex digest of the
/// entry payload.
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
