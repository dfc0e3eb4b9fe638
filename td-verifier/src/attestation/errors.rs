use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Verification failures consumers can match on.
///
/// Structural variants abort verification on their own. Mismatch variants are
/// collected into [`Findings`] so that every field gets checked.
pub enum AttnError {
    #[error("quote is nil")]
    QuoteIsNil,
    #[error("quote has no header")]
    QuoteMissingHeader,
    #[error("quote has no body")]
    QuoteMissingBody,
    #[error("quote is not a tdx one")]
    QuoteIsNotTdx,
    #[error("unexpected rtmrs count: {0} != 4")]
    UnexpectedRtmrsCount(usize),
    #[error("unexpected size of td attributes: {0} != 8")]
    UnexpectedTdAttributesSize(usize),
    #[error("unknown tdx quote format: {0}")]
    UnknownQuoteFormat(String),
    #[error("{0} mismatch")]
    FieldMismatch(TdxField),
    #[error("td under debug detected")]
    UnderDebug,
    #[error("td sept_ve_disabled is unset")]
    SeptVeDisableUnset,

    #[error("tpm2 attestation is nil")]
    Tpm2AttestationIsNil,
    #[error("unexpected tpm version detected: {0} != 2")]
    UnexpectedTpmVersion(u8),
    #[error("duplicate pcr index in tpm2 attestation: {0}")]
    DuplicatePcrIndex(i64),
    #[error("pcr index out of bounds in tpm2 attestation: {0}")]
    PcrIndexOutOfBounds(i64),
    #[error("tpm2 pcr digest mismatch: {0}")]
    PcrMismatch(usize),
    #[error("unexpected tpm2 attestation key")]
    UnexpectedAttestationKey,

    #[error("unexpected nonce")]
    UnexpectedNonce,
    #[error("failed to validate tdx quote: {0}")]
    QuoteSignature(String),
    #[error("failed to parse public tpm2 attestation key: {0}")]
    AttestationKey(String),
    #[error("failed to verify tpm2 attestation: {0}")]
    Tpm2Quote(String),
    #[error("failed to parse tpm2 event log: {0}")]
    EventLogParse(String),
    #[error("failed to verify tpm2 event log: {0}")]
    EventLogReplay(String),

    #[error("unknown attestation type: {0}")]
    UnknownAttestationType(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// Measurement fields of a TDX quote body that a baseline can pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdxField {
    MrOwner,
    MrOwnerConfig,
    MrConfigId,
    MrTd,
    Rtmr(u8),
}

impl fmt::Display for TdxField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TdxField::MrOwner => f.write_str("mr_owner"),
            TdxField::MrOwnerConfig => f.write_str("mr_owner_config"),
            TdxField::MrConfigId => f.write_str("mr_config_id"),
            TdxField::MrTd => f.write_str("mr_td"),
            TdxField::Rtmr(idx) => write!(f, "rtmr[{idx}]"),
        }
    }
}

/// Outcome of a field-by-field comparison.
///
/// Every comparison lands in exactly one of the two lists: `reported` for
/// fields the baseline pins, `suppressed` for the dummy comparisons made on
/// fields it leaves open. A match is recorded as `Ok(())`.
#[derive(Debug, Default)]
pub struct Findings {
    pub reported: Vec<Result<(), AttnError>>,
    pub suppressed: Vec<Result<(), AttnError>>,
}

impl Findings {
    pub(crate) fn with_capacity(n: usize) -> Self {
        Self {
            reported: Vec::with_capacity(n),
            suppressed: Vec::with_capacity(n),
        }
    }

    /// Single fatal error; nothing else was compared.
    pub fn fatal(err: AttnError) -> Self {
        Self {
            reported: vec![Err(err)],
            suppressed: Vec::new(),
        }
    }

    /// Record `result` under `reported` when `configured`, else under `suppressed`.
    pub(crate) fn push(&mut self, configured: bool, result: Result<(), AttnError>) {
        if configured {
            self.reported.push(result);
        } else {
            self.suppressed.push(result);
        }
    }

    /// Failures that must fail the login.
    pub fn errors(&self) -> impl Iterator<Item = &AttnError> {
        self.reported.iter().filter_map(|r| r.as_ref().err())
    }

    /// Failures on fields nobody asked to check, for debug logging only.
    pub fn ignored(&self) -> impl Iterator<Item = &AttnError> {
        self.suppressed.iter().filter_map(|r| r.as_ref().err())
    }

    pub fn is_ok(&self) -> bool {
        self.errors().next().is_none()
    }

    /// Total number of comparisons performed.
    pub fn checks(&self) -> usize {
        self.reported.len() + self.suppressed.len()
    }
}

/// Several errors rendered as one, `"N errors occurred: a; b"`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MultiError(pub Vec<AttnError>);

impl MultiError {
    pub fn push(&mut self, err: AttnError) {
        self.0.push(err);
    }

    pub fn extend_from(&mut self, findings: &Findings) {
        self.0.extend(findings.errors().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), MultiError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => f.write_str("no errors"),
            [only] => write!(f, "{only}"),
            many => {
                write!(f, "{} errors occurred: ", many.len())?;
                for (idx, err) in many.iter().enumerate() {
                    if idx > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

impl From<Findings> for MultiError {
    fn from(findings: Findings) -> Self {
        MultiError(findings.errors().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_error_formats_single_and_many() {
        let one = MultiError(vec![AttnError::FieldMismatch(TdxField::MrTd)]);
        assert_eq!(one.to_string(), "mr_td mismatch");

        let two = MultiError(vec![
            AttnError::FieldMismatch(TdxField::Rtmr(2)),
            AttnError::UnexpectedNonce,
        ]);
        assert_eq!(
            two.to_string(),
            "2 errors occurred: rtmr[2] mismatch; unexpected nonce"
        );
    }

    #[test]
    fn findings_split_reported_from_suppressed() {
        let mut f = Findings::with_capacity(3);
        f.push(true, Ok(()));
        f.push(false, Err(AttnError::UnderDebug));
        f.push(true, Err(AttnError::PcrMismatch(7)));

        assert!(!f.is_ok());
        assert_eq!(f.checks(), 3);
        assert_eq!(f.errors().cloned().collect::<Vec<_>>(), vec![AttnError::PcrMismatch(7)]);
        assert_eq!(f.ignored().cloned().collect::<Vec<_>>(), vec![AttnError::UnderDebug]);
    }
}
