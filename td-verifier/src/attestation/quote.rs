//! TDX DCAP quote, version 4.
//!
//! Decoding and encoding go through `dcap-qvl`. [`QuoteV4`] is the view the
//! baseline check works on: every part is optional and every field is a plain
//! byte vector, so a malformed quote can be reported field by field.

use dcap_qvl::quote::{
    AuthData, AuthDataV4, CertificationData, Data, Header, QEReportCertificationData, Quote,
    Report, TDReport10,
};
use scale::Encode;

use crate::attestation::errors::AttnError;

pub const QUOTE_VERSION_4: u16 = 4;
pub const TEE_TYPE_TDX: u32 = 0x81;

pub const MEASUREMENT_SIZE: usize = 48;
pub const TD_ATTRIBUTES_SIZE: usize = 8;
pub const REPORT_DATA_SIZE: usize = 64;
pub const RTMR_COUNT: usize = 4;

const ATTESTATION_KEY_ECDSA_P256: u16 = 2;
// certification data types
const CERT_PCK_CHAIN: u16 = 5;
const CERT_QE_REPORT: u16 = 6;

pub type QuoteHeader = Header;

/// TD quote body. Field sizes are not enforced by the type so that the
/// verifier can reject malformed values itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TdQuoteBody {
    pub tee_tcb_svn: Vec<u8>,
    pub mr_seam: Vec<u8>,
    pub mr_signer_seam: Vec<u8>,
    pub seam_attributes: Vec<u8>,
    pub td_attributes: Vec<u8>,
    pub xfam: Vec<u8>,
    pub mr_td: Vec<u8>,
    pub mr_config_id: Vec<u8>,
    pub mr_owner: Vec<u8>,
    pub mr_owner_config: Vec<u8>,
    pub rtmrs: Vec<Vec<u8>>,
    pub report_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteV4 {
    pub header: Option<QuoteHeader>,
    pub td_quote_body: Option<TdQuoteBody>,
    /// Signature, attestation key and QE certification data.
    pub auth_data: Option<AuthData>,
}

impl QuoteV4 {
    /// Parses a raw quote as produced by the TDX quoting enclave.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, AttnError> {
        let Quote {
            header,
            report,
            auth_data,
        } = Quote::parse(raw)
            .map_err(|e| AttnError::UnknownQuoteFormat(format!("failed to decode quote: {e:#}")))?;

        if header.version != QUOTE_VERSION_4 {
            return Err(AttnError::UnknownQuoteFormat(format!(
                "unsupported quote version {}",
                header.version
            )));
        }
        let Report::TD10(report) = report else {
            return Err(AttnError::UnknownQuoteFormat(format!(
                "unsupported tee type {:#x}",
                header.tee_type
            )));
        };

        Ok(QuoteV4 {
            header: Some(header),
            td_quote_body: Some(TdQuoteBody::from(&report)),
            auth_data: Some(auth_data),
        })
    }

    /// Report data of the body, if present.
    pub fn report_data(&self) -> Option<&[u8]> {
        self.td_quote_body.as_ref().map(|b| b.report_data.as_slice())
    }

    /// Encodes the quote back into the wire format. Missing parts are filled
    /// with zeroes and an unsigned QE certification section.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = self.header.unwrap_or(Header {
            version: QUOTE_VERSION_4,
            attestation_key_type: ATTESTATION_KEY_ECDSA_P256,
            tee_type: TEE_TYPE_TDX,
            qe_svn: 0,
            pce_svn: 0,
            qe_vendor_id: [0u8; 16],
            user_data: [0u8; 20],
        });
        let body = self.td_quote_body.clone().unwrap_or_else(TdQuoteBody::zeroed);
        Quote {
            header,
            report: Report::TD10(body.to_report()),
            auth_data: self.auth_data.clone().unwrap_or_else(unsigned_auth_data),
        }
        .encode()
    }
}

impl From<&TDReport10> for TdQuoteBody {
    fn from(r: &TDReport10) -> Self {
        TdQuoteBody {
            tee_tcb_svn: r.tee_tcb_svn.to_vec(),
            mr_seam: r.mr_seam.to_vec(),
            mr_signer_seam: r.mr_signer_seam.to_vec(),
            seam_attributes: r.seam_attributes.to_vec(),
            td_attributes: r.td_attributes.to_vec(),
            xfam: r.xfam.to_vec(),
            mr_td: r.mr_td.to_vec(),
            mr_config_id: r.mr_config_id.to_vec(),
            mr_owner: r.mr_owner.to_vec(),
            mr_owner_config: r.mr_owner_config.to_vec(),
            rtmrs: [r.rt_mr0, r.rt_mr1, r.rt_mr2, r.rt_mr3]
                .iter()
                .map(|m| m.to_vec())
                .collect(),
            report_data: r.report_data.to_vec(),
        }
    }
}

impl TdQuoteBody {
    /// Body with every field at its wire size and zeroed.
    pub fn zeroed() -> Self {
        TdQuoteBody::from(&TdQuoteBody::default().to_report())
    }

    /// Fields are truncated or zero-padded to their wire size.
    fn to_report(&self) -> TDReport10 {
        let rtmr = |i: usize| fit(self.rtmrs.get(i).map_or(&[][..], Vec::as_slice));
        TDReport10 {
            tee_tcb_svn: fit(&self.tee_tcb_svn),
            mr_seam: fit(&self.mr_seam),
            mr_signer_seam: fit(&self.mr_signer_seam),
            seam_attributes: fit(&self.seam_attributes),
            td_attributes: fit(&self.td_attributes),
            xfam: fit(&self.xfam),
            mr_td: fit(&self.mr_td),
            mr_config_id: fit(&self.mr_config_id),
            mr_owner: fit(&self.mr_owner),
            mr_owner_config: fit(&self.mr_owner_config),
            rt_mr0: rtmr(0),
            rt_mr1: rtmr(1),
            rt_mr2: rtmr(2),
            rt_mr3: rtmr(3),
            report_data: fit(&self.report_data),
        }
    }
}

fn fit<const N: usize>(v: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let n = v.len().min(N);
    out[..n].copy_from_slice(&v[..n]);
    out
}

fn unsigned_auth_data() -> AuthData {
    AuthData::V4(AuthDataV4 {
        ecdsa_signature: [0u8; 64],
        ecdsa_attestation_key: [0u8; 64],
        certification_data: CertificationData {
            cert_type: CERT_QE_REPORT,
            body: Data::new(Vec::new()),
        },
        qe_report_data: QEReportCertificationData {
            qe_report: [0u8; 384],
            qe_report_signature: [0u8; 64],
            qe_auth_data: Data::new(Vec::new()),
            certification_data: CertificationData {
                cert_type: CERT_PCK_CHAIN,
                body: Data::new(Vec::new()),
            },
        },
    })
}
