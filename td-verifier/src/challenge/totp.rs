//! RFC 6238 time-based one-time passwords with HMAC-SHA-256.
//!
//! Trusted domains derive a fresh code every second, so the codes double as a
//! short-lived proof that the caller holds the registered secret.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

use super::ChallengeError;
use crate::attestation::constant_time_eq;

pub const TOTP_DIGITS: u32 = 8;
pub const TOTP_PERIOD: Duration = Duration::from_secs(1);
/// Periods accepted on either side of the current one.
pub const TOTP_SKEW: u64 = 1;
/// How long a used code stays blocked; covers the whole skew window.
pub const TOTP_USED_TTL: Duration = Duration::from_secs(3 * TOTP_PERIOD.as_secs());

const SECRET_SIZE: usize = 20;

type HmacSha256 = Hmac<Sha256>;

/// Fresh random secret, base32 without padding.
pub fn generate_secret(rng: &mut dyn RngCore) -> Result<String, ChallengeError> {
    let mut raw = Zeroizing::new([0u8; SECRET_SIZE]);
    rng.try_fill_bytes(&mut raw[..])
        .map_err(|e| ChallengeError::Random(e.to_string()))?;
    Ok(BASE32_NOPAD.encode(&raw[..]))
}

/// Secret generated from the operating system's CSPRNG.
pub fn generate_os_secret() -> Result<String, ChallengeError> {
    generate_secret(&mut OsRng)
}

/// Decodes a base32 secret. Case, surrounding whitespace and padding are
/// tolerated.
pub fn decode_secret(secret: &str) -> Result<Zeroizing<Vec<u8>>, ChallengeError> {
    let normalised: String = secret
        .trim()
        .chars()
        .filter(|c| *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalised.is_empty() {
        return Err(ChallengeError::TotpSecret("secret is empty".into()));
    }
    BASE32_NOPAD
        .decode(normalised.as_bytes())
        .map(Zeroizing::new)
        .map_err(|e| ChallengeError::TotpSecret(e.to_string()))
}

fn counter_at(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() / TOTP_PERIOD.as_secs()
}

/// HOTP value for `counter`, zero padded to [`TOTP_DIGITS`].
pub fn code_for_counter(key: &[u8], counter: u64) -> Result<String, ChallengeError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ChallengeError::TotpSecret(e.to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    let code = binary % 10u32.pow(TOTP_DIGITS);
    Ok(format!("{code:0width$}", width = TOTP_DIGITS as usize))
}

/// Code valid at `at` for `secret`.
pub fn generate_code(secret: &str, at: SystemTime) -> Result<String, ChallengeError> {
    let key = decode_secret(secret)?;
    code_for_counter(&key, counter_at(at))
}

/// Whether `code` matches the period of `at` or one within the skew.
///
/// All candidate periods are compared so the outcome does not leak which one
/// matched.
pub fn validate(secret: &str, code: &str, at: SystemTime) -> Result<bool, ChallengeError> {
    let code = code.trim();
    if code.len() != TOTP_DIGITS as usize {
        return Ok(false);
    }
    let key = decode_secret(secret)?;
    let counter = counter_at(at);
    let mut matched = false;
    for c in counter.saturating_sub(TOTP_SKEW)..=counter.saturating_add(TOTP_SKEW) {
        let candidate = code_for_counter(&key, c)?;
        matched |= constant_time_eq(candidate.as_bytes(), code.as_bytes());
    }
    Ok(matched)
}

/// Seconds until the next period starts, for clients that must not reuse a
/// code they just spent.
pub fn until_next_period(at: SystemTime) -> Duration {
    let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    let period = TOTP_PERIOD.as_nanos();
    let into = since_epoch.as_nanos() % period;
    Duration::from_nanos((period - into) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    // RFC 6238 appendix B, SHA-256 seed.
    const RFC_SEED: &[u8] = b"12345678901234567890123456789012";

    #[test]
    fn matches_rfc6238_vectors() {
        // with a 30s step the RFC counters are T/30
        assert_eq!(code_for_counter(RFC_SEED, 59 / 30).unwrap(), "46119246");
        assert_eq!(code_for_counter(RFC_SEED, 1_111_111_109 / 30).unwrap(), "68084774");
        assert_eq!(code_for_counter(RFC_SEED, 2_000_000_000 / 30).unwrap(), "90698825");
    }

    #[test]
    fn accepts_skew_of_one_period() {
        let secret = BASE32_NOPAD.encode(RFC_SEED);
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let code = generate_code(&secret, t).unwrap();

        assert!(validate(&secret, &code, t).unwrap());
        assert!(validate(&secret, &code, t + Duration::from_secs(1)).unwrap());
        assert!(validate(&secret, &code, t - Duration::from_secs(1)).unwrap());
        assert!(!validate(&secret, &code, t + Duration::from_secs(2)).unwrap());
        assert!(!validate(&secret, "1234567", t).unwrap());
    }

    #[test]
    fn secret_decoding_is_lenient() {
        let secret = BASE32_NOPAD.encode(b"hello world");
        let lower = format!("  {}==  ", secret.to_lowercase());
        assert_eq!(decode_secret(&lower).unwrap().as_slice(), b"hello world");
        assert!(matches!(decode_secret(""), Err(ChallengeError::TotpSecret(_))));
        assert!(decode_secret("not base32!").is_err());
    }

    #[test]
    fn generated_secret_is_160_bits() {
        let mut rng = StepRng::new(1, 1);
        let secret = generate_secret(&mut rng).unwrap();
        assert_eq!(secret.len(), 32);
        assert_eq!(decode_secret(&secret).unwrap().len(), SECRET_SIZE);
    }

    #[test]
    fn next_period_is_within_one_second() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_250);
        assert_eq!(until_next_period(t), Duration::from_millis(750));
    }
}
