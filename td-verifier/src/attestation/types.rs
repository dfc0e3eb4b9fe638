use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::attestation::errors::AttnError;

/// Fixed-size byte string, base64 on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedBytes<const N: usize>(pub [u8; N]);

/// 48-byte TDX measurement (SHA-384 sized).
pub type Byte48 = FixedBytes<48>;
/// 32-byte TPM 2.0 SHA-256 PCR digest.
pub type Byte32 = FixedBytes<32>;

impl<const N: usize> FixedBytes<N> {
    pub const fn zero() -> Self {
        Self([0u8; N])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Decodes base64 `value` and right-pads it with zeroes to `N` bytes.
    ///
    /// Shorter inputs are accepted so that a 32-byte SHA-256 measurement can be
    /// registered in a 48-byte slot.
    pub fn from_b64_padded(label: &str, value: &str) -> Result<Self, AttnError> {
        let decoded = b64
            .decode(value.as_bytes())
            .map_err(|e| AttnError::Decode(format!("{label} is not encoded as base64 string: {e}")))?;
        Self::from_slice_padded(label, &decoded)
    }

    pub fn from_slice_padded(label: &str, bytes: &[u8]) -> Result<Self, AttnError> {
        if bytes.len() > N {
            return Err(AttnError::Decode(format!(
                "data encoded by {label} is longer than expected max {N} bytes: {} > {N}",
                bytes.len()
            )));
        }
        let mut out = [0u8; N];
        out[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(out))
    }
}

impl<const N: usize> Default for FixedBytes<N> {
    fn default() -> Self {
        Self::zero()
    }
}

impl<const N: usize> fmt::Display for FixedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&b64.encode(self.0))
    }
}

impl<const N: usize> fmt::Debug for FixedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedBytes<{N}>({})", hex::encode(self.0))
    }
}

impl<const N: usize> Serialize for FixedBytes<N> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&b64.encode(self.0))
    }
}

impl<'de, const N: usize> Deserialize<'de> for FixedBytes<N> {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        let raw = b64.decode(s.as_bytes()).map_err(DeError::custom)?;
        let arr: [u8; N] = raw.as_slice().try_into().map_err(|_| {
            DeError::custom(format!("invalid encoded length: expected {N}, got {}", raw.len()))
        })?;
        Ok(Self(arr))
    }
}

/// Arbitrary-length byte string, base64 on the wire.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Bytes(v)
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&b64.encode(&self.0))
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes({} bytes)", self.0.len())
    }
}

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&b64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        // Go's encoding/json renders a nil []byte as null.
        let s = Option::<String>::deserialize(d)?;
        match s {
            None => Ok(Bytes::default()),
            Some(s) => b64.decode(s.as_bytes()).map(Bytes).map_err(DeError::custom),
        }
    }
}
