//! TPM 2.0 attestations from the local device through the TSS ESAPI.

use std::path::PathBuf;
use std::str::FromStr;

use tracing::{debug, info};
use tss_esapi::abstraction::{ak, ek, pcr};
use tss_esapi::handles::KeyHandle;
use tss_esapi::interface_types::algorithm::{
    AsymmetricAlgorithm, HashingAlgorithm, SignatureSchemeAlgorithm,
};
use tss_esapi::structures::{Data, PcrSelectionList, PcrSlot, Private, Public, SignatureScheme};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::Context;

use crate::attestation::pcr::PCR_COUNT;
use crate::attestation::tpm2::TPM_VERSION_20;
use crate::attestation::{Bytes, HashAlg, Pcr, PlatformParameters, Tpm2Quote};
use crate::provider::{AkBlob, PlatformAttester, ProviderError};

pub const DEFAULT_TCTI: &str = "device:/dev/tpmrm0";
pub const EVENT_LOG_PATH: &str = "/sys/kernel/security/tpm0/binary_bios_measurements";

const SHA256_SLOTS: [PcrSlot; PCR_COUNT] = [
    PcrSlot::Slot0,
    PcrSlot::Slot1,
    PcrSlot::Slot2,
    PcrSlot::Slot3,
    PcrSlot::Slot4,
    PcrSlot::Slot5,
    PcrSlot::Slot6,
    PcrSlot::Slot7,
    PcrSlot::Slot8,
    PcrSlot::Slot9,
    PcrSlot::Slot10,
    PcrSlot::Slot11,
    PcrSlot::Slot12,
    PcrSlot::Slot13,
    PcrSlot::Slot14,
    PcrSlot::Slot15,
    PcrSlot::Slot16,
    PcrSlot::Slot17,
    PcrSlot::Slot18,
    PcrSlot::Slot19,
    PcrSlot::Slot20,
    PcrSlot::Slot21,
    PcrSlot::Slot22,
    PcrSlot::Slot23,
];

fn tpm(what: &'static str) -> impl FnOnce(tss_esapi::Error) -> ProviderError {
    move |e| ProviderError::Tpm(format!("{what}: {e}"))
}

/// Attester backed by a TPM reachable through a TCTI such as
/// `device:/dev/tpmrm0` or `swtpm:port=2321`.
#[derive(Debug, Clone)]
pub struct TssPlatformAttester {
    tcti: String,
    event_log: PathBuf,
}

impl TssPlatformAttester {
    pub fn new(tcti: impl Into<String>) -> Self {
        Self {
            tcti: tcti.into(),
            event_log: PathBuf::from(EVENT_LOG_PATH),
        }
    }

    pub fn with_event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_log = path.into();
        self
    }

    fn context(&self) -> Result<Context, ProviderError> {
        let conf = TctiNameConf::from_str(&self.tcti).map_err(tpm("invalid tcti"))?;
        debug!(tcti = %self.tcti, "opening tpm2 device");
        Context::new(conf).map_err(tpm("failed to open tpm2 device"))
    }

    fn endorsement_key(ctx: &mut Context) -> Result<KeyHandle, ProviderError> {
        ek::create_ek_object(ctx, AsymmetricAlgorithm::Rsa, None)
            .map_err(tpm("failed to create endorsement key"))
    }
}

impl PlatformAttester for TssPlatformAttester {
    fn create_ak(&self) -> Result<AkBlob, ProviderError> {
        let mut ctx = self.context()?;
        let ek = Self::endorsement_key(&mut ctx)?;
        let created = ak::create_ak(
            &mut ctx,
            ek,
            HashingAlgorithm::Sha256,
            SignatureSchemeAlgorithm::RsaSsa,
            None,
            None,
        );
        flush(&mut ctx, ek);
        let created = created.map_err(tpm("failed to create attestation key"))?;

        let public = created
            .out_public
            .marshall()
            .map_err(tpm("failed to marshal attestation key"))?;
        info!("created tpm2 attestation key");
        Ok(AkBlob {
            public: Bytes(public),
            private: Bytes(created.out_private.value().to_vec()),
        })
    }

    fn attest_platform(&self, blob: &AkBlob, nonce: &[u8]) -> Result<PlatformParameters, ProviderError> {
        let public =
            Public::unmarshall(blob.public.as_slice()).map_err(tpm("failed to decode ak public"))?;
        let private = Private::try_from(blob.private.0.clone())
            .map_err(tpm("failed to decode ak private blob"))?;
        let event_log = std::fs::read(&self.event_log).map_err(|e| {
            ProviderError::Tpm(format!("failed to read {}: {e}", self.event_log.display()))
        })?;

        let mut ctx = self.context()?;
        let ek = Self::endorsement_key(&mut ctx)?;
        debug!("loading attestation key");
        let loaded = ak::load_ak(&mut ctx, ek, None, private, public);
        flush(&mut ctx, ek);
        let ak = loaded.map_err(tpm("failed to load attestation key"))?;

        let quoted = quote_sha256_bank(&mut ctx, ak, nonce);
        flush(&mut ctx, ak);
        let (quote, pcrs) = quoted?;

        info!(pcrs = pcrs.len(), "generated tpm2 attestation");
        Ok(PlatformParameters {
            tpm_version: TPM_VERSION_20,
            public: blob.public.clone(),
            pcrs,
            quotes: vec![quote],
            event_log: Bytes(event_log),
        })
    }
}

fn flush(ctx: &mut Context, handle: KeyHandle) {
    if let Err(e) = ctx.flush_context(handle.into()) {
        debug!(error = %e, "failed to flush tpm2 handle");
    }
}

/// Quotes all 24 SHA-256 PCRs; the values are read before and after so the
/// quote is known to match them.
fn quote_sha256_bank(
    ctx: &mut Context,
    ak: KeyHandle,
    nonce: &[u8],
) -> Result<(Tpm2Quote, Vec<Pcr>), ProviderError> {
    let selection = PcrSelectionList::builder()
        .with_selection(HashingAlgorithm::Sha256, &SHA256_SLOTS)
        .build()
        .map_err(tpm("invalid pcr selection"))?;
    let data = Data::try_from(nonce.to_vec()).map_err(tpm("invalid nonce"))?;

    let before = pcr::read_all(ctx, selection.clone()).map_err(tpm("failed to read pcrs"))?;
    let (attest, signature) = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.quote(ak, data, SignatureScheme::Null, selection.clone())
        })
        .map_err(tpm("failed to quote"))?;
    let after = pcr::read_all(ctx, selection).map_err(tpm("failed to read pcrs"))?;
    if before != after {
        return Err(ProviderError::Tpm(
            "pcr values changed while quoting; retry".into(),
        ));
    }

    let bank = after
        .pcr_bank(HashingAlgorithm::Sha256)
        .ok_or_else(|| ProviderError::Tpm("no sha256 pcr bank".into()))?;
    let pcrs = SHA256_SLOTS
        .iter()
        .enumerate()
        .filter_map(|(idx, slot)| {
            bank.get_digest(*slot).map(|d| Pcr {
                index: idx as i64,
                digest: Bytes(d.value().to_vec()),
                digest_alg: HashAlg::SHA256,
            })
        })
        .collect();

    let quote = Tpm2Quote {
        version: TPM_VERSION_20,
        quote: Bytes(attest.marshall().map_err(tpm("failed to marshal quote"))?),
        signature: Bytes(signature.marshall().map_err(tpm("failed to marshal signature"))?),
    };
    Ok((quote, pcrs))
}
