use crate::attestation::errors::AttnError;
use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use std::hint::black_box;
use std::time::{SystemTime, UNIX_EPOCH};

/// Constant-time comparison; unequal lengths compare unequal.
///
/// Running time depends on the length of the inputs only.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b) {
        acc |= black_box(x ^ y);
    }
    acc == 0
}

/// Returns 1 if `x & y` has any bit set and 0 otherwise.
///
/// Lengths are treated as public: on mismatch this returns 0 without looking
/// at the contents.
pub fn constant_time_mask(x: &[u8], y: &[u8]) -> u8 {
    if x.len() != y.len() {
        return 0;
    }
    let mut acc = 0u8;
    for (a, b) in x.iter().zip(y) {
        acc |= black_box(a & b);
    }
    // fold every set bit down to bit 0 without branching
    acc |= acc >> 4;
    acc |= acc >> 2;
    acc |= acc >> 1;
    acc & 1
}

/// Returns the current Unix timestamp in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Base64-decodes `value`, tagging errors with the provided label.
pub fn decode_b64(label: &str, value: &str) -> Result<Vec<u8>, AttnError> {
    b64.decode(value.as_bytes())
        .map_err(|e| AttnError::Decode(format!("{label}: {e}")))
}
