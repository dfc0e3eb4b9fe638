use serde::{Deserialize, Serialize};

use crate::attestation::errors::{AttnError, Findings};
use crate::attestation::types::{Byte32, Bytes};
use crate::attestation::util::constant_time_eq;

/// Number of PCRs a PC-client TPM exposes per bank.
pub const PCR_COUNT: usize = 24;

/// Hash algorithm of a PCR bank, numbered like Go's `crypto.Hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashAlg(pub u32);

impl HashAlg {
    pub const SHA1: HashAlg = HashAlg(3);
    pub const SHA256: HashAlg = HashAlg(5);

    /// TPM_ALG_ID of the algorithm.
    pub fn tpm_alg_id(self) -> Option<u16> {
        match self {
            HashAlg::SHA1 => Some(0x0004),
            HashAlg::SHA256 => Some(0x000b),
            _ => None,
        }
    }

    pub fn from_tpm_alg_id(id: u16) -> Option<HashAlg> {
        match id {
            0x0004 => Some(HashAlg::SHA1),
            0x000b => Some(HashAlg::SHA256),
            _ => None,
        }
    }

    pub fn digest_size(self) -> Option<usize> {
        match self {
            HashAlg::SHA1 => Some(20),
            HashAlg::SHA256 => Some(32),
            _ => None,
        }
    }
}

/// Single PCR value as reported by the attesting platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pcr {
    #[serde(rename = "Index", alias = "index")]
    pub index: i64,
    #[serde(rename = "Digest", alias = "digest")]
    pub digest: Bytes,
    #[serde(rename = "DigestAlg", alias = "digest_alg")]
    pub digest_alg: HashAlg,
}

/// Indexes the SHA-256 bank of `pcrs` into 24 slots.
///
/// Other banks are skipped. Out-of-range and repeated indices are fatal.
pub fn sha256_slots(pcrs: &[Pcr]) -> Result<[Option<&[u8]>; PCR_COUNT], AttnError> {
    let mut slots: [Option<&[u8]>; PCR_COUNT] = [None; PCR_COUNT];
    for pcr in pcrs.iter().filter(|p| p.digest_alg == HashAlg::SHA256) {
        let idx = usize::try_from(pcr.index)
            .ok()
            .filter(|i| *i < PCR_COUNT)
            .ok_or(AttnError::PcrIndexOutOfBounds(pcr.index))?;
        if slots[idx].is_some() {
            return Err(AttnError::DuplicatePcrIndex(pcr.index));
        }
        slots[idx] = Some(pcr.digest.as_slice());
    }
    Ok(slots)
}

/// Compares every slot, configured or not. Empty actual slots read as zeroes.
pub fn compare_slots(
    expected: &[Option<Byte32>; PCR_COUNT],
    actual: &[Option<&[u8]>; PCR_COUNT],
) -> Findings {
    let dummy = Byte32::zero();
    let mut findings = Findings::with_capacity(PCR_COUNT);
    for (idx, (expect, actual)) in expected.iter().zip(actual.iter()).enumerate() {
        let actual = actual.unwrap_or(dummy.as_slice());
        let configured = expect.is_some();
        let expect = expect.as_ref().unwrap_or(&dummy);
        let result = if constant_time_eq(expect.as_slice(), actual) {
            Ok(())
        } else {
            Err(AttnError::PcrMismatch(idx))
        };
        findings.push(configured, result);
    }
    findings
}

/// Looks up the digest of PCR `index` in bank `alg`.
pub fn find(pcrs: &[Pcr], alg: HashAlg, index: u32) -> Option<&Pcr> {
    pcrs.iter()
        .find(|p| p.digest_alg == alg && p.index == i64::from(index))
}
