//! Single-use challenges: TOTP codes and attestation nonces.
//!
//! Both are recorded in a [`SingleUseCache`] under
//! `"{kind}/{name}/{totp|nonce}/{value}"`, which is what makes a code or a
//! nonce usable exactly once within its TTL.

pub mod cache;
pub mod nonce;
pub mod totp;

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::attestation::AttestationKind;
pub use cache::{Clock, ManualClock, SingleUseCache, SystemClock};
pub use nonce::{
    nonce_size, EntropySource, OsEntropy, NONCE_ATTEMPTS, NONCE_TTL, TDX_NONCE_SIZE, TPM2_NONCE_SIZE,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("`totp` field is required")]
    TotpMissing,
    #[error("totp code is invalid")]
    TotpInvalid,
    #[error("totp code was already used")]
    TotpReplay,
    #[error("invalid totp secret: {0}")]
    TotpSecret(String),
    #[error("cache entry already exists")]
    AlreadyExists,
    #[error("failed to generate nonce after 5 iterations")]
    NonceExhausted,
    #[error("failed to generate random bytes: {0}")]
    Random(String),
    #[error("unexpected nonce")]
    UnexpectedNonce,
}

/// Cache key of a challenge entry.
pub fn entry_key(kind: AttestationKind, name: &str, what: &str, value: &str) -> String {
    format!("{kind}/{name}/{what}/{value}")
}

/// TOTP gate and nonce issuance over one shared cache.
#[derive(Clone)]
pub struct Challenges {
    cache: Arc<SingleUseCache>,
    entropy: Arc<dyn EntropySource>,
}

impl Challenges {
    pub fn new(cache: Arc<SingleUseCache>, entropy: Arc<dyn EntropySource>) -> Self {
        Self { cache, entropy }
    }

    pub fn cache(&self) -> &Arc<SingleUseCache> {
        &self.cache
    }

    /// Accepts `code` once if it is valid for `secret` now or one period away.
    pub fn validate_totp(
        &self,
        kind: AttestationKind,
        name: &str,
        secret: &str,
        code: &str,
    ) -> Result<(), ChallengeError> {
        debug!(attestation_type = %kind, domain = name, "validating totp code");

        let code = code.trim();
        if code.is_empty() {
            return Err(ChallengeError::TotpMissing);
        }

        let valid = totp::validate(secret, code, self.cache.now()).inspect_err(|err| {
            error!(attestation_type = %kind, domain = name, error = %err, "failed to validate totp code");
        })?;
        if !valid {
            error!(attestation_type = %kind, domain = name, "totp code is invalid");
            return Err(ChallengeError::TotpInvalid);
        }

        let entry = entry_key(kind, name, "totp", code);
        if self.cache.get(&entry) || self.cache.add(&entry, totp::TOTP_USED_TTL).is_err() {
            error!(attestation_type = %kind, domain = name, "totp code was already used");
            return Err(ChallengeError::TotpReplay);
        }
        Ok(())
    }

    /// Draws a nonce of `size` bytes and registers it for `name`.
    pub fn issue_nonce(
        &self,
        kind: AttestationKind,
        name: &str,
        size: usize,
    ) -> Result<String, ChallengeError> {
        debug!(attestation_type = %kind, domain = name, "generating nonce");

        for _ in 0..NONCE_ATTEMPTS {
            let nonce = nonce::draw(self.entropy.as_ref(), size).inspect_err(|err| {
                error!(attestation_type = %kind, domain = name, error = %err, "failed to generate nonce");
            })?;
            let entry = entry_key(kind, name, "nonce", &nonce);
            if self.cache.get(&entry) || self.cache.add(&entry, NONCE_TTL).is_err() {
                warn!(attestation_type = %kind, domain = name, "regenerating nonce due to a collision");
                continue;
            }
            return Ok(nonce);
        }

        error!(attestation_type = %kind, domain = name, "failed to generate nonce after {NONCE_ATTEMPTS} iterations");
        Err(ChallengeError::NonceExhausted)
    }

    /// The nonce must have been issued to `name` and not yet expired.
    ///
    /// The entry is left in place: login replay is already prevented by the
    /// single-use TOTP code.
    pub fn check_nonce(
        &self,
        kind: AttestationKind,
        name: &str,
        nonce: &str,
    ) -> Result<(), ChallengeError> {
        debug!(attestation_type = %kind, domain = name, "validating nonce");
        if self.cache.get(&entry_key(kind, name, "nonce", nonce)) {
            Ok(())
        } else {
            error!(attestation_type = %kind, domain = name, "unexpected nonce");
            Err(ChallengeError::UnexpectedNonce)
        }
    }
}
