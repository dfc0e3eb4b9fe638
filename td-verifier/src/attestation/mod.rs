pub mod config;
pub mod errors;
pub mod eventlog;
pub mod pcr;
pub mod quote;
pub mod tdx;
pub mod tpm2;
pub mod types;
pub mod verifier;

pub(crate) mod tpm_wire;
mod util;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use config::VerifierConfig;
pub use errors::{AttnError, Findings, MultiError};
pub use pcr::{HashAlg, Pcr};
pub use quote::QuoteV4;
pub use tdx::TdxBaseline;
pub use tpm2::{PlatformParameters, Tpm2Baseline, Tpm2Quote};
pub use types::{Byte32, Byte48, Bytes};
pub use util::{constant_time_eq, constant_time_mask, decode_b64, now_secs};
pub use verifier::{
    AttestationKey, DcapQuoteVerifier, NativePlatformVerifier, PlatformVerifier, QuoteVerifier,
};

/// Attestation technology a trusted domain authenticates with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationKind {
    Tdx,
    Tpm2,
}

impl AttestationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttestationKind::Tdx => "tdx",
            AttestationKind::Tpm2 => "tpm2",
        }
    }
}

impl fmt::Display for AttestationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttestationKind {
    type Err = AttnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tdx" => Ok(AttestationKind::Tdx),
            "tpm2" => Ok(AttestationKind::Tpm2),
            other => Err(AttnError::UnknownAttestationType(other.to_string())),
        }
    }
}
