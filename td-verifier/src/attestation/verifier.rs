use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

use super::config::VerifierConfig;
use super::errors::AttnError;
use super::eventlog::EventLog;
use super::pcr::{find, HashAlg, Pcr};
use super::tpm2::{PlatformParameters, Tpm2Quote, TPM_VERSION_20};
use super::tpm_wire::{AkPublic, QuoteInfo};
use super::util::{constant_time_eq, now_secs};

/// Chain-of-trust check of a raw TDX quote: signature, certificates, TCB.
#[async_trait]
pub trait QuoteVerifier: Send + Sync {
    async fn verify_quote(&self, raw_quote: &[u8]) -> Result<(), AttnError>;
}

/// Signature and event-log checks of a TPM 2.0 platform attestation.
pub trait PlatformVerifier: Send + Sync {
    /// Verifies every quote with the attestation key and binds them to `nonce`
    /// and to the submitted PCR values.
    fn verify_quotes(
        &self,
        ak_public: &[u8],
        attestation: &PlatformParameters,
        nonce: &[u8],
    ) -> Result<(), AttnError>;

    /// Replays the event log against the submitted PCR values.
    fn verify_event_log(&self, attestation: &PlatformParameters) -> Result<(), AttnError>;
}

/// DCAP quote verification with collateral from a PCCS.
pub struct DcapQuoteVerifier {
    cfg: VerifierConfig,
}

impl DcapQuoteVerifier {
    pub fn new(cfg: VerifierConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl QuoteVerifier for DcapQuoteVerifier {
    async fn verify_quote(&self, raw_quote: &[u8]) -> Result<(), AttnError> {
        let collateral = tokio::time::timeout(
            self.cfg.collateral_timeout,
            dcap_qvl::collateral::get_collateral(&self.cfg.pccs_url, raw_quote),
        )
        .await
        .map_err(|_| AttnError::QuoteSignature("timed out fetching collateral".into()))?
        .map_err(|e| AttnError::QuoteSignature(format!("failed to fetch collateral: {e:?}")))?;

        let report = dcap_qvl::verify::verify(raw_quote, &collateral, now_secs())
            .map_err(|e| AttnError::QuoteSignature(format!("{e:?}")))?;

        check_tcb_status(&self.cfg.allowed_tcb_statuses, &report.status)?;
        debug!(
            tcb_status = %report.status,
            advisories = ?report.advisory_ids,
            "tdx quote chain of trust verified"
        );
        Ok(())
    }
}

fn check_tcb_status(allowed: &HashSet<String>, status: &str) -> Result<(), AttnError> {
    if allowed.contains(status) {
        Ok(())
    } else {
        Err(AttnError::QuoteSignature(format!(
            "tcb status {status} is not allowed"
        )))
    }
}

/// Attestation key of a TPM 2.0 trusted domain.
pub struct AttestationKey(AkPublic);

impl AttestationKey {
    /// Parses a marshalled TPMT_PUBLIC (RSA or ECC NIST P-256).
    pub fn parse(tpmt_public: &[u8]) -> Result<Self, AttnError> {
        AkPublic::from_tpmt_public(tpmt_public).map(AttestationKey)
    }

    /// Verifies `quotes` and checks that together they cover every PCR in `pcrs`.
    ///
    /// Each quote must be signed by this key, carry `nonce` as its extra data
    /// and commit to the submitted values of the PCRs it selects.
    pub fn verify_all(&self, quotes: &[Tpm2Quote], pcrs: &[Pcr], nonce: &[u8]) -> Result<(), AttnError> {
        if quotes.is_empty() {
            return Err(AttnError::Tpm2Quote("no quotes provided".into()));
        }
        let mut covered: HashSet<(HashAlg, u32)> = HashSet::new();

        for (n, quote) in quotes.iter().enumerate() {
            let fail = |msg: String| AttnError::Tpm2Quote(format!("quote[{n}]: {msg}"));

            if quote.version != TPM_VERSION_20 {
                return Err(fail(format!("unsupported version {}", quote.version)));
            }
            self.0
                .verify(quote.quote.as_slice(), quote.signature.as_slice())
                .map_err(fail)?;

            let info = QuoteInfo::parse(quote.quote.as_slice()).map_err(fail)?;
            if !constant_time_eq(&info.extra_data, nonce) {
                return Err(fail("nonce mismatch".into()));
            }

            let mut hasher = Sha256::new();
            for sel in &info.selections {
                let alg = HashAlg::from_tpm_alg_id(sel.hash)
                    .ok_or_else(|| fail(format!("unsupported pcr bank {:#06x}", sel.hash)))?;
                for idx in &sel.pcrs {
                    let pcr = find(pcrs, alg, *idx)
                        .ok_or_else(|| fail(format!("pcr {idx} of bank {} not provided", alg.0)))?;
                    if Some(pcr.digest.0.len()) != alg.digest_size() {
                        return Err(fail(format!("pcr {idx} has a malformed digest")));
                    }
                    hasher.update(pcr.digest.as_slice());
                    covered.insert((alg, *idx));
                }
            }
            if !constant_time_eq(hasher.finalize().as_slice(), &info.pcr_digest) {
                return Err(fail("pcr composite digest mismatch".into()));
            }
        }

        for pcr in pcrs {
            let key = u32::try_from(pcr.index).map(|idx| (pcr.digest_alg, idx));
            if !key.is_ok_and(|k| covered.contains(&k)) {
                return Err(AttnError::Tpm2Quote(format!(
                    "pcr {} of bank {} was not covered by any quote",
                    pcr.index, pcr.digest_alg.0
                )));
            }
        }
        Ok(())
    }
}

/// In-process TPM 2.0 verification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePlatformVerifier;

impl PlatformVerifier for NativePlatformVerifier {
    fn verify_quotes(
        &self,
        ak_public: &[u8],
        attestation: &PlatformParameters,
        nonce: &[u8],
    ) -> Result<(), AttnError> {
        let key = AttestationKey::parse(ak_public)?;
        key.verify_all(&attestation.quotes, &attestation.pcrs, nonce)
    }

    fn verify_event_log(&self, attestation: &PlatformParameters) -> Result<(), AttnError> {
        EventLog::parse(attestation.event_log.as_slice())?.verify(&attestation.pcrs)
    }
}
