//! Client-side producers of attestation evidence.

use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::attestation::pcr::{sha256_slots, PCR_COUNT};
use crate::attestation::quote::{QuoteV4, REPORT_DATA_SIZE};
use crate::attestation::types::FixedBytes;
use crate::attestation::{
    AttnError, Byte32, Bytes, PlatformParameters, TdxBaseline, Tpm2Baseline,
};
use crate::challenge::TPM2_NONCE_SIZE;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to base64-decode attestation nonce: {0}")]
    NonceEncoding(String),
    #[error("unexpected nonce length: {0} != {1}")]
    NonceLength(usize, usize),
    #[error("failed to generate tdx quote: {0}")]
    Generation(String),
    #[error("tpm2: {0}")]
    Tpm(String),
    #[error("invalid tpm2 attestation key blob: {0}")]
    AkBlob(String),
    #[error("server expects a different tpm2 attestation key")]
    AkMismatch,
    #[error(transparent)]
    Quote(#[from] AttnError),
}

/// Source of raw TDX quotes over caller-chosen report data.
pub trait QuoteProvider: Send + Sync {
    fn tdx_quote(&self, report_data: [u8; REPORT_DATA_SIZE]) -> Result<Vec<u8>, ProviderError>;
}

/// Quotes from the kernel's configfs-tsm report interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigfsTsmProvider;

impl QuoteProvider for ConfigfsTsmProvider {
    fn tdx_quote(&self, report_data: [u8; REPORT_DATA_SIZE]) -> Result<Vec<u8>, ProviderError> {
        let quote = configfs_tsm::create_tdx_quote(report_data)
            .map_err(|e| ProviderError::Generation(format!("{e:?}")))?;
        info!("generated tdx quote of {} bytes", quote.len());
        Ok(quote)
    }
}

/// Turns a base64 nonce issued by the server into quote report data.
pub fn report_data_from_nonce(nonce: &str) -> Result<[u8; REPORT_DATA_SIZE], ProviderError> {
    let raw = decode_nonce(nonce, REPORT_DATA_SIZE)?;
    raw.as_slice()
        .try_into()
        .map_err(|_| ProviderError::NonceLength(raw.len(), REPORT_DATA_SIZE))
}

/// Decodes a TPM 2.0 nonce, which becomes the quote's qualifying data.
pub fn tpm2_nonce(nonce: &str) -> Result<Vec<u8>, ProviderError> {
    decode_nonce(nonce, TPM2_NONCE_SIZE)
}

fn decode_nonce(nonce: &str, size: usize) -> Result<Vec<u8>, ProviderError> {
    let raw = b64
        .decode(nonce.trim().as_bytes())
        .map_err(|e| ProviderError::NonceEncoding(e.to_string()))?;
    if raw.len() != size {
        return Err(ProviderError::NonceLength(raw.len(), size));
    }
    Ok(raw)
}

/// Attestation key kept by a TPM 2.0 trusted domain between logins.
///
/// `private` is sealed to the TPM that created it and only loads there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AkBlob {
    /// Marshalled TPMT_PUBLIC, registered as `tpm2_ak_public`.
    pub public: Bytes,
    /// TPM2B_PRIVATE contents.
    pub private: Bytes,
}

impl AkBlob {
    /// Base64 of the JSON form, as stored in the blob file.
    pub fn encode(&self) -> Result<String, ProviderError> {
        let json = serde_json::to_vec(self).map_err(|e| ProviderError::AkBlob(e.to_string()))?;
        Ok(b64.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self, ProviderError> {
        let json = b64
            .decode(encoded.trim().as_bytes())
            .map_err(|e| ProviderError::AkBlob(format!("not base64: {e}")))?;
        let blob: AkBlob =
            serde_json::from_slice(&json).map_err(|e| ProviderError::AkBlob(e.to_string()))?;
        if blob.public.as_slice().is_empty() || blob.private.as_slice().is_empty() {
            return Err(ProviderError::AkBlob("empty key material".into()));
        }
        Ok(blob)
    }

    /// The server echoes the registered key with the nonce; quoting with any
    /// other key would only fail later, after burning a second TOTP code.
    pub fn check_echo(&self, ak_public: Option<&str>) -> Result<(), ProviderError> {
        let echoed = ak_public
            .map(|v| b64.decode(v.trim().as_bytes()))
            .transpose()
            .map_err(|e| ProviderError::AkBlob(format!("echoed key is not base64: {e}")))?;
        match echoed {
            Some(key) if key == self.public.as_slice() => Ok(()),
            _ => Err(ProviderError::AkMismatch),
        }
    }
}

/// Source of TPM 2.0 platform attestations.
pub trait PlatformAttester: Send + Sync {
    /// Creates an attestation key under the endorsement hierarchy.
    fn create_ak(&self) -> Result<AkBlob, ProviderError>;

    /// Quotes the SHA-256 bank with `ak`, binding `nonce`, and collects the
    /// PCR values and the event log that back the quote.
    fn attest_platform(&self, ak: &AkBlob, nonce: &[u8]) -> Result<PlatformParameters, ProviderError>;
}

/// Baseline of this machine with a fresh attestation key; the key goes to
/// the caller to keep for later logins.
pub fn local_tpm2_baseline(
    attester: &dyn PlatformAttester,
) -> Result<(Tpm2Baseline, AkBlob), ProviderError> {
    let ak = attester.create_ak()?;
    let attestation = attester.attest_platform(&ak, &[])?;
    let slots = sha256_slots(&attestation.pcrs)?;

    let mut pcrs: [Option<Byte32>; PCR_COUNT] = Default::default();
    for (expected, actual) in pcrs.iter_mut().zip(slots) {
        *expected = actual
            .and_then(|d| <[u8; 32]>::try_from(d).ok())
            .map(FixedBytes);
    }
    debug!(pcrs = pcrs.iter().flatten().count(), "read local tpm2 baseline");
    Ok((
        Tpm2Baseline {
            ak_public: ak.public.clone(),
            pcrs,
        },
        ak,
    ))
}

/// Baseline matching the TD this process runs in.
pub fn local_tdx_baseline(provider: &dyn QuoteProvider) -> Result<TdxBaseline, ProviderError> {
    let raw = provider.tdx_quote([0u8; REPORT_DATA_SIZE])?;
    let quote = QuoteV4::from_bytes(&raw)?;
    debug!("parsed local tdx quote");
    Ok(TdxBaseline::from_quote(&quote)?)
}
