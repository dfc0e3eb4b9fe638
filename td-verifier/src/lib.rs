//! Verification core for attested authentication of trusted domains.
//!
//! [`attestation`] parses and checks TDX quotes and TPM 2.0 platform
//! attestations against a stored baseline, [`challenge`] owns the single-use
//! TOTP and nonce machinery that binds an attestation to one login attempt.

pub mod attestation;
pub mod challenge;
pub mod provider;
pub mod tpm;

pub use attestation::AttestationKind;
