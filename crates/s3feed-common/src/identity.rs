//! Stable identities for objects and the records derived from them

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the object hash.
pub const OBJECT_HASH_LEN: usize = 10;

/// Short sha256 prefix of the bucket ARN followed by the object key.
pub fn object_hash(bucket_arn: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bucket_arn.as_bytes());
    hasher.update(key.as_bytes());
    let mut encoded = hex::encode(hasher.finalize());
    encoded.truncate(OBJECT_HASH_LEN);
    encoded
}

/// Per-record dedup id: object hash plus the zero-padded byte offset.
pub fn record_id(object_hash: &str, offset: u64) -> String {
    format!("{}-{:012}", object_hash, offset)
}
