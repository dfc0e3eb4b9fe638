//! TPM 2.0 structure decoding: TPMT_PUBLIC, TPMS_ATTEST and TPMT_SIGNATURE.
//!
//! Unmarshalling goes through `tss-esapi`; this module only picks out the
//! parts the verifier relies on and checks signatures with `ring` and `p256`.

use p256::ecdsa::signature::Verifier;
use ring::signature::{RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA256, RSA_PSS_2048_8192_SHA256};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::structures::{Attest, AttestInfo, Public, Signature};
use tss_esapi::traits::UnMarshall;

use crate::attestation::errors::AttnError;

pub(crate) const TPM_GENERATED_VALUE: u32 = 0xff54_4347;
pub(crate) const TPM_ALG_SHA256: u16 = 0x000b;

const P256_SCALAR_SIZE: usize = 32;
const RSA_DEFAULT_EXPONENT: u32 = (1 << 16) + 1;

/// Public part of an attestation key.
pub(crate) enum AkPublic {
    Rsa { n: Vec<u8>, e: Vec<u8> },
    Ecc(p256::ecdsa::VerifyingKey),
}

impl AkPublic {
    /// Decodes a marshalled TPMT_PUBLIC holding an RSA or NIST P-256 key.
    pub(crate) fn from_tpmt_public(raw: &[u8]) -> Result<Self, AttnError> {
        parse_tpmt_public(raw).map_err(AttnError::AttestationKey)
    }

    /// Checks `sig`, a marshalled TPMT_SIGNATURE, over `msg`.
    pub(crate) fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<(), String> {
        let sig = Signature::unmarshall(sig)
            .map_err(|e| format!("failed to unmarshal TPMT_SIGNATURE: {e}"))?;
        match (self, sig) {
            (AkPublic::Rsa { n, e }, Signature::RsaSsa(s)) => {
                sha256_only(s.hashing_algorithm())?;
                RsaPublicKeyComponents { n, e }
                    .verify(&RSA_PKCS1_2048_8192_SHA256, msg, s.signature().value())
                    .map_err(|_| "bad rsassa signature".to_string())
            }
            (AkPublic::Rsa { n, e }, Signature::RsaPss(s)) => {
                sha256_only(s.hashing_algorithm())?;
                RsaPublicKeyComponents { n, e }
                    .verify(&RSA_PSS_2048_8192_SHA256, msg, s.signature().value())
                    .map_err(|_| "bad rsapss signature".to_string())
            }
            (AkPublic::Ecc(key), Signature::EcDsa(s)) => {
                sha256_only(s.hashing_algorithm())?;
                let r = left_pad(s.signature_r().value())?;
                let s = left_pad(s.signature_s().value())?;
                let sig = p256::ecdsa::Signature::from_scalars(r, s)
                    .map_err(|e| format!("invalid ecdsa signature: {e}"))?;
                key.verify(msg, &sig)
                    .map_err(|_| "bad ecdsa signature".to_string())
            }
            (AkPublic::Rsa { .. }, _) => Err("rsa key with a non-rsa signature".into()),
            (AkPublic::Ecc(_), _) => Err("ecc key with a non-ecdsa signature".into()),
        }
    }
}

fn sha256_only(alg: HashingAlgorithm) -> Result<(), String> {
    match alg {
        HashingAlgorithm::Sha256 => Ok(()),
        other => Err(format!("unsupported signature hash {other:?}")),
    }
}

fn parse_tpmt_public(raw: &[u8]) -> Result<AkPublic, String> {
    let public =
        Public::unmarshall(raw).map_err(|e| format!("failed to unmarshal TPMT_PUBLIC: {e}"))?;
    match public {
        Public::Rsa {
            parameters, unique, ..
        } => {
            let exponent = match parameters.exponent().value() {
                0 => RSA_DEFAULT_EXPONENT,
                e => e,
            };
            Ok(AkPublic::Rsa {
                n: strip_leading_zeros(unique.value()).to_vec(),
                e: strip_leading_zeros(&exponent.to_be_bytes()).to_vec(),
            })
        }
        Public::Ecc {
            parameters, unique, ..
        } => {
            if parameters.ecc_curve() != EccCurve::NistP256 {
                return Err(format!("unsupported ecc curve {:?}", parameters.ecc_curve()));
            }
            let x = left_pad(unique.x().value())?;
            let y = left_pad(unique.y().value())?;
            let point = p256::EncodedPoint::from_affine_coordinates(&x.into(), &y.into(), false);
            let key = p256::ecdsa::VerifyingKey::from_encoded_point(&point)
                .map_err(|e| format!("invalid p256 point: {e}"))?;
            Ok(AkPublic::Ecc(key))
        }
        _ => Err("unsupported key type".into()),
    }
}

fn strip_leading_zeros(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|x| *x != 0).unwrap_or(b.len());
    &b[start..]
}

fn left_pad(b: &[u8]) -> Result<[u8; P256_SCALAR_SIZE], String> {
    if b.len() > P256_SCALAR_SIZE {
        return Err(format!("p256 scalar is {} bytes", b.len()));
    }
    let mut out = [0u8; P256_SCALAR_SIZE];
    out[P256_SCALAR_SIZE - b.len()..].copy_from_slice(b);
    Ok(out)
}

/// PCRs of one bank covered by a quote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PcrSelection {
    /// TPM_ALG_ID of the bank.
    pub hash: u16,
    /// Ascending PCR indices.
    pub pcrs: Vec<u32>,
}

/// The parts of a TPMS_ATTEST quote the verifier relies on.
#[derive(Debug, Clone)]
pub(crate) struct QuoteInfo {
    pub extra_data: Vec<u8>,
    pub selections: Vec<PcrSelection>,
    pub pcr_digest: Vec<u8>,
}

impl QuoteInfo {
    pub(crate) fn parse(raw: &[u8]) -> Result<Self, String> {
        // unmarshalling drops the magic, so it is checked on the raw bytes
        if raw.get(..4) != Some(&TPM_GENERATED_VALUE.to_be_bytes()[..]) {
            return Err("not generated by a tpm".into());
        }
        let attest =
            Attest::unmarshall(raw).map_err(|e| format!("failed to unmarshal TPMS_ATTEST: {e}"))?;
        let AttestInfo::Quote { info } = attest.attested() else {
            return Err("attestation is not a quote".into());
        };

        let selections = info
            .pcr_selection()
            .get_selections()
            .iter()
            .map(|sel| {
                let mut pcrs: Vec<u32> = sel
                    .selected()
                    .into_iter()
                    .map(|slot| u32::from(slot).trailing_zeros())
                    .collect();
                pcrs.sort_unstable();
                PcrSelection {
                    hash: u16::from(sel.hashing_algorithm()),
                    pcrs,
                }
            })
            .collect();

        Ok(QuoteInfo {
            extra_data: attest.extra_data().value().to_vec(),
            selections,
            pcr_digest: info.pcr_digest().value().to_vec(),
        })
    }
}

/// Encoders for building synthetic quotes in tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use p256::ecdsa::{signature::Signer, SigningKey};

    pub(crate) const TPM_ST_ATTEST_QUOTE: u16 = 0x8018;
    pub(crate) const TPM_ALG_SHA1: u16 = 0x0004;
    const TPM_ALG_NULL: u16 = 0x0010;
    const TPM_ALG_RSASSA: u16 = 0x0014;
    const TPM_ALG_ECDSA: u16 = 0x0018;
    const TPM_ALG_ECC: u16 = 0x0023;
    const TPM_ECC_NIST_P256: u16 = 0x0003;

    fn tpm2b(out: &mut Vec<u8>, b: &[u8]) {
        out.extend_from_slice(&(b.len() as u16).to_be_bytes());
        out.extend_from_slice(b);
    }

    pub(crate) fn ecc_tpmt_public(key: &SigningKey) -> Vec<u8> {
        let point = key.verifying_key().to_encoded_point(false);
        let mut out = Vec::new();
        out.extend_from_slice(&TPM_ALG_ECC.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
        out.extend_from_slice(&0x0004_0472u32.to_be_bytes());
        tpm2b(&mut out, &[]);
        out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_ECDSA.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
        out.extend_from_slice(&TPM_ECC_NIST_P256.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_NULL.to_be_bytes());
        tpm2b(&mut out, point.x().map(|x| x.as_slice()).unwrap_or_default());
        tpm2b(&mut out, point.y().map(|y| y.as_slice()).unwrap_or_default());
        out
    }

    pub(crate) fn quote_info(extra_data: &[u8], hash: u16, pcrs: &[u32], digest: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TPM_GENERATED_VALUE.to_be_bytes());
        out.extend_from_slice(&TPM_ST_ATTEST_QUOTE.to_be_bytes());
        tpm2b(&mut out, b"signer");
        tpm2b(&mut out, extra_data);
        out.extend_from_slice(&[0u8; 17]);
        out.extend_from_slice(&0u64.to_be_bytes());
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&hash.to_be_bytes());
        let mut bitmap = [0u8; 3];
        for idx in pcrs {
            bitmap[(*idx / 8) as usize] |= 1 << (idx % 8);
        }
        out.push(bitmap.len() as u8);
        out.extend_from_slice(&bitmap);
        tpm2b(&mut out, digest);
        out
    }

    pub(crate) fn ecdsa_signature(key: &SigningKey, msg: &[u8]) -> Vec<u8> {
        ecdsa_signature_over(key, msg, TPM_ALG_SHA256)
    }

    /// Signs with SHA-256 whatever `hash` claims.
    pub(crate) fn ecdsa_signature_over(key: &SigningKey, msg: &[u8], hash: u16) -> Vec<u8> {
        let sig: p256::ecdsa::Signature = key.sign(msg);
        let (r, s) = sig.split_bytes();
        let mut out = Vec::new();
        out.extend_from_slice(&TPM_ALG_ECDSA.to_be_bytes());
        out.extend_from_slice(&hash.to_be_bytes());
        tpm2b(&mut out, &r);
        tpm2b(&mut out, &s);
        out
    }

    pub(crate) fn rsassa_signature(sig: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TPM_ALG_RSASSA.to_be_bytes());
        out.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
        tpm2b(&mut out, sig);
        out
    }
}
