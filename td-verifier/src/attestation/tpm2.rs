use serde::{Deserialize, Serialize};

use crate::attestation::errors::{AttnError, Findings};
use crate::attestation::pcr::{compare_slots, sha256_slots, Pcr, PCR_COUNT};
use crate::attestation::types::{Byte32, Bytes};
use crate::attestation::util::constant_time_eq;

/// `TPMVersion` value of a TPM 2.0 device.
pub const TPM_VERSION_20: u8 = 2;

/// Signed TPM2_Quote output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tpm2Quote {
    #[serde(rename = "Version", alias = "version")]
    pub version: u8,
    /// Marshalled TPMS_ATTEST.
    #[serde(rename = "Quote", alias = "quote")]
    pub quote: Bytes,
    /// Marshalled TPMT_SIGNATURE.
    #[serde(rename = "Signature", alias = "signature")]
    pub signature: Bytes,
}

/// Platform attestation submitted by a TPM 2.0 trusted domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformParameters {
    #[serde(rename = "TPMVersion", alias = "tpm_version")]
    pub tpm_version: u8,
    /// Marshalled TPMT_PUBLIC of the attestation key.
    #[serde(rename = "Public", alias = "public")]
    pub public: Bytes,
    #[serde(rename = "PCRs", alias = "pcrs", default)]
    pub pcrs: Vec<Pcr>,
    #[serde(rename = "Quotes", alias = "quotes", default)]
    pub quotes: Vec<Tpm2Quote>,
    /// Raw TCG PC-client event log.
    #[serde(rename = "EventLog", alias = "event_log", default)]
    pub event_log: Bytes,
}

/// Expected state of a TPM 2.0 trusted domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tpm2Baseline {
    /// Marshalled TPMT_PUBLIC of the attestation key issued to the domain.
    #[serde(rename = "tpm2_ak_public")]
    pub ak_public: Bytes,
    /// Expected SHA-256 PCR values. `None` slots are not enforced.
    #[serde(rename = "tpm2_pcrs", default)]
    pub pcrs: [Option<Byte32>; PCR_COUNT],
}

impl Tpm2Baseline {
    /// The attestation must echo the registered attestation key.
    pub fn check_ak_echo(&self, attestation: &PlatformParameters) -> Result<(), AttnError> {
        if constant_time_eq(self.ak_public.as_slice(), attestation.public.as_slice()) {
            Ok(())
        } else {
            Err(AttnError::UnexpectedAttestationKey)
        }
    }

    /// Compares the SHA-256 bank of `attestation` against the baseline.
    ///
    /// All 24 slots are compared whenever the pre-flight passes.
    pub fn match_attestation(&self, attestation: Option<&PlatformParameters>) -> Findings {
        let Some(attestation) = attestation else {
            return Findings::fatal(AttnError::Tpm2AttestationIsNil);
        };
        if attestation.tpm_version != TPM_VERSION_20 {
            return Findings::fatal(AttnError::UnexpectedTpmVersion(attestation.tpm_version));
        }
        match sha256_slots(&attestation.pcrs) {
            Ok(actual) => compare_slots(&self.pcrs, &actual),
            Err(err) => Findings::fatal(err),
        }
    }
}
