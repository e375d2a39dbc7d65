//! Stable FNV-1a fingerprints for transform ids and the bundle hash.

use serde::Serialize;

use crate::error::{Error, Result};

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// FNV-1a over the canonical JSON encoding of `value`.
///
/// Maps serialize in key order (every map in the bundle is a `BTreeMap`), so
/// equal values always fingerprint equally across processes.
pub fn fingerprint_json<T: Serialize>(value: &T) -> Result<u64> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| Error::internal(format!("cannot fingerprint value: {err}")))?;
    Ok(fnv1a_hash(&bytes))
}

/// Mixes several fingerprints into one, order-sensitively.
pub fn combine(parts: &[u64]) -> u64 {
    parts
        .iter()
        .fold(fnv1a_init(), |hash, part| fnv1a_bytes(hash, &part.to_le_bytes()))
}
