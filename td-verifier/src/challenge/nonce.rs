use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::Duration;

use super::ChallengeError;
use crate::attestation::AttestationKind;

/// How long an issued nonce can be bound to a login.
pub const NONCE_TTL: Duration = Duration::from_secs(15);
/// Draws attempted before giving up on a collision-free nonce.
pub const NONCE_ATTEMPTS: usize = 5;
/// TDX nonces fill the 64-byte report data.
pub const TDX_NONCE_SIZE: usize = 64;
/// TPM 2.0 nonces go into the quote's qualifying data.
pub const TPM2_NONCE_SIZE: usize = 20;

pub fn nonce_size(kind: AttestationKind) -> usize {
    match kind {
        AttestationKind::Tdx => TDX_NONCE_SIZE,
        AttestationKind::Tpm2 => TPM2_NONCE_SIZE,
    }
}

/// Injectable CSPRNG.
pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), ChallengeError>;
}

/// Operating system randomness.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<(), ChallengeError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| ChallengeError::Random(e.to_string()))
    }
}

/// Draws `size` random bytes, base64 encoded.
pub(crate) fn draw(entropy: &dyn EntropySource, size: usize) -> Result<String, ChallengeError> {
    let mut raw = vec![0u8; size];
    entropy.fill(&mut raw)?;
    Ok(b64.encode(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_per_kind() {
        assert_eq!(nonce_size(AttestationKind::Tdx), 64);
        assert_eq!(nonce_size(AttestationKind::Tpm2), 20);
    }

    #[test]
    fn draws_encoded_bytes() {
        let nonce = draw(&OsEntropy, TDX_NONCE_SIZE).unwrap();
        assert_eq!(b64.decode(nonce).unwrap().len(), TDX_NONCE_SIZE);
    }
}
