//! Deterministic bucketing.
//!
//! Every client implementation must map identical inputs to bit-identical floats, so the
//! digest-to-float conversion below is exact rather than "close enough".
use sha2::{Digest, Sha256};

/// Largest `f64` strictly below `1.0`.
const MAX_BELOW_ONE: f64 = 1.0 - f64::EPSILON / 2.0;

/// Hash `identity` against a numeric container (rule, experiment or holdout id) and an optional
/// suffix (respool time) into `[0, 1)`.
pub fn hash_double(identity: &str, container_id: u32, suffix: Option<&str>) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(container_id.to_string().as_bytes());
    if let Some(suffix) = suffix {
        hasher.update(suffix.as_bytes());
    }
    let digest: [u8; 32] = hasher.finalize().into();
    unit_interval(&digest)
}

/// Hash `identity` salted with an arbitrary string (mutual exclusion group name) into `[0, 1)`.
pub fn hash_double_with_salt(identity: &str, salt: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(salt.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    unit_interval(&digest)
}

/// Interpret `digest` as a big-endian unsigned 256-bit integer and return `digest / 2^256`
/// rounded to the nearest `f64` (ties to even).
fn unit_interval(digest: &[u8; 32]) -> f64 {
    let Some(first) = digest.iter().position(|b| *b != 0) else {
        return 0.0;
    };
    // Bit indices are counted from the most significant bit of the digest.
    let bit = |i: usize| -> u64 {
        if i < 256 {
            u64::from((digest[i / 8] >> (7 - i % 8)) & 1)
        } else {
            0
        }
    };
    let lead = first * 8 + digest[first].leading_zeros() as usize;

    let mut mantissa: u64 = 0;
    for i in lead..lead + 53 {
        mantissa = (mantissa << 1) | bit(i);
    }
    let round = bit(lead + 53) == 1;
    let sticky = (lead + 54..256).any(|i| bit(i) == 1);
    if round && (sticky || mantissa & 1 == 1) {
        mantissa += 1;
    }

    // mantissa <= 2^53 and the exponent stays within the normal range, so this is exact.
    let value = mantissa as f64 * 2f64.powi(-((lead + 53) as i32));
    value.min(MAX_BELOW_ONE)
}

/// Walk `entries` subtracting each weight from `threshold` and return the first entry that
/// drives it negative. Returns `None` when weights are exhausted first (they sum below the
/// threshold).
pub fn select_weighted<T>(
    entries: impl IntoIterator<Item = (T, f64)>,
    threshold: f64,
) -> Option<T> {
    let mut remaining = threshold;
    for (entry, weight) in entries {
        remaining -= weight;
        if remaining < 0.0 {
            return Some(entry);
        }
    }
    None
}

/// Map a hash onto an index into a list of `len` items.
pub(crate) fn index_for(hash: f64, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some(((hash * len as f64) as usize).min(len - 1))
}
