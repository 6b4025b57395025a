use serde_json::Value;
use sha2::{Digest, Sha256};

use flowops_shared::ContentHash;

/// Compact JSON text. Object keys come out sorted because `serde_json::Map`
/// is a `BTreeMap` unless the `preserve_order` feature is enabled.
pub(crate) fn canonical_json(value: &Value) -> String {
    value.to_string()
}

pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// Hash an already normalized definition.
pub fn hash_normalized(normalized: &Value) -> ContentHash {
    let canonical = canonical_json(normalized);
    ContentHash::new(format!("sha256:{}", sha256_hex(canonical.as_bytes())))
}
