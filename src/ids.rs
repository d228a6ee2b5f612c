//! Deterministic identifiers for graph elements.
//!
//! Entity and relation ids are content hashes so that the same mention seen
//! twice resolves to the same row, which is what makes the store upserts
//! idempotent.

use sha2::{Digest, Sha256};

/// Length of the hex id prefix kept from the digest.
const ID_LEN: usize = 16;

/// Hash a sequence of parts into a short stable id.
///
/// Parts are trimmed and lowercased before hashing, empty parts are skipped,
/// and the remainder is joined with `::`. The result is the first 16 hex
/// characters of the SHA-256 digest.
#[must_use]
pub fn stable_id(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("::");

    let digest = Sha256::digest(joined.as_bytes());
    let mut hex = String::with_capacity(ID_LEN);
    for byte in digest.iter().take(ID_LEN / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Id of an entity node: `hash(series, name, type)` with normalized parts.
#[must_use]
pub fn node_id(series: &str, name: &str, entity_type: &str) -> String {
    stable_id(&[series, name, entity_type])
}

/// Id of a directed relation: `hash(series, src_id, pred, dst_id)`.
///
/// The predicate is part of the identity; two edges between the same
/// endpoints with different predicates are distinct rows.
#[must_use]
pub fn relation_id(series: &str, src_id: &str, pred: &str, dst_id: &str) -> String {
    stable_id(&[series, src_id, pred, dst_id])
}
