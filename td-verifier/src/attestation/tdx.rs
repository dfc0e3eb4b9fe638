use serde::{Deserialize, Serialize};

use crate::attestation::errors::{AttnError, Findings, TdxField};
use crate::attestation::quote::{QuoteV4, RTMR_COUNT, TD_ATTRIBUTES_SIZE, TEE_TYPE_TDX};
use crate::attestation::types::Byte48;
use crate::attestation::util::{constant_time_eq, constant_time_mask};

/// TUD.DEBUG, bit 0 of TDATTRIBUTES.
pub const MASK_DEBUG: [u8; TD_ATTRIBUTES_SIZE] = [0x01, 0, 0, 0, 0, 0, 0, 0];
/// SEC.SEPT_VE_DISABLE, bit 28 of TDATTRIBUTES.
pub const MASK_SEPT_VE_DISABLE: [u8; TD_ATTRIBUTES_SIZE] = [0, 0, 0, 0x10, 0, 0, 0, 0];

/// Number of comparisons every quote goes through: 8 measurements, 2 attributes.
pub const TDX_CHECKS: usize = 10;

/// Expected state of a TDX trusted domain. `None` fields are not enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TdxBaseline {
    /// Software-defined ID of the TD owner.
    #[serde(rename = "tdx_mr_owner", default, skip_serializing_if = "Option::is_none")]
    pub mr_owner: Option<Byte48>,
    /// Owner-defined configuration, e.g. specific to the workload.
    #[serde(rename = "tdx_mr_owner_config", default, skip_serializing_if = "Option::is_none")]
    pub mr_owner_config: Option<Byte48>,
    /// Non-owner-defined configuration, e.g. runtime or OS.
    #[serde(rename = "tdx_mr_config_id", default, skip_serializing_if = "Option::is_none")]
    pub mr_config_id: Option<Byte48>,
    /// Measurement of the initial contents of the TD.
    #[serde(rename = "tdx_mr_td", default, skip_serializing_if = "Option::is_none")]
    pub mr_td: Option<Byte48>,
    /// RTMR[0] and RTMR[1] are extended by the TD virtual firmware, RTMR[2] by
    /// the OS, RTMR[3] by the workload.
    #[serde(rename = "tdx_rtmr0", default, skip_serializing_if = "Option::is_none")]
    pub rtmr0: Option<Byte48>,
    #[serde(rename = "tdx_rtmr1", default, skip_serializing_if = "Option::is_none")]
    pub rtmr1: Option<Byte48>,
    #[serde(rename = "tdx_rtmr2", default, skip_serializing_if = "Option::is_none")]
    pub rtmr2: Option<Byte48>,
    #[serde(rename = "tdx_rtmr3", default, skip_serializing_if = "Option::is_none")]
    pub rtmr3: Option<Byte48>,
    /// Require TUD.DEBUG == 0.
    #[serde(rename = "tdx_check_debug", default)]
    pub check_debug: bool,
    /// Require SEC.SEPT_VE_DISABLE == 1.
    #[serde(rename = "tdx_check_sept_ve_disable", default)]
    pub check_sept_ve_disable: bool,
}

impl TdxBaseline {
    /// Compares `quote` against the baseline.
    ///
    /// Structural problems yield a single fatal finding. Otherwise exactly
    /// [`TDX_CHECKS`] comparisons are made no matter which fields are set:
    /// unset fields are compared against zeroes and filed as suppressed.
    pub fn match_quote(&self, quote: Option<&QuoteV4>) -> Findings {
        let Some(quote) = quote else {
            return Findings::fatal(AttnError::QuoteIsNil);
        };
        let Some(header) = &quote.header else {
            return Findings::fatal(AttnError::QuoteMissingHeader);
        };
        if header.tee_type != TEE_TYPE_TDX {
            return Findings::fatal(AttnError::QuoteIsNotTdx);
        }
        let Some(body) = &quote.td_quote_body else {
            return Findings::fatal(AttnError::QuoteMissingBody);
        };
        if body.rtmrs.len() != RTMR_COUNT {
            return Findings::fatal(AttnError::UnexpectedRtmrsCount(body.rtmrs.len()));
        }
        if body.td_attributes.len() != TD_ATTRIBUTES_SIZE {
            return Findings::fatal(AttnError::UnexpectedTdAttributesSize(
                body.td_attributes.len(),
            ));
        }

        let tests: [(Option<&Byte48>, &[u8], TdxField); 8] = [
            (self.mr_owner.as_ref(), &body.mr_owner, TdxField::MrOwner),
            (self.mr_owner_config.as_ref(), &body.mr_owner_config, TdxField::MrOwnerConfig),
            (self.mr_config_id.as_ref(), &body.mr_config_id, TdxField::MrConfigId),
            (self.mr_td.as_ref(), &body.mr_td, TdxField::MrTd),
            (self.rtmr0.as_ref(), &body.rtmrs[0], TdxField::Rtmr(0)),
            (self.rtmr1.as_ref(), &body.rtmrs[1], TdxField::Rtmr(1)),
            (self.rtmr2.as_ref(), &body.rtmrs[2], TdxField::Rtmr(2)),
            (self.rtmr3.as_ref(), &body.rtmrs[3], TdxField::Rtmr(3)),
        ];

        let mut findings = Findings::with_capacity(TDX_CHECKS);
        let dummy = Byte48::zero();

        for (expect, actual, field) in tests {
            let configured = expect.is_some();
            let expect = expect.unwrap_or(&dummy);
            let result = if constant_time_eq(expect.as_slice(), actual) {
                Ok(())
            } else {
                Err(AttnError::FieldMismatch(field))
            };
            findings.push(configured, result);
        }

        let debug = constant_time_mask(&MASK_DEBUG, &body.td_attributes);
        findings.push(
            self.check_debug,
            if debug == 1 {
                Err(AttnError::UnderDebug)
            } else {
                Ok(())
            },
        );

        let sept_ve_disable = constant_time_mask(&MASK_SEPT_VE_DISABLE, &body.td_attributes);
        findings.push(
            self.check_sept_ve_disable,
            if sept_ve_disable == 0 {
                Err(AttnError::SeptVeDisableUnset)
            } else {
                Ok(())
            },
        );

        findings
    }

    /// Baseline that `quote` itself satisfies, pinning every measurement.
    ///
    /// Attribute checks are enabled only where the quote already complies.
    pub fn from_quote(quote: &QuoteV4) -> Result<Self, AttnError> {
        let body = quote.td_quote_body.as_ref().ok_or(AttnError::QuoteMissingBody)?;
        if body.rtmrs.len() != RTMR_COUNT {
            return Err(AttnError::UnexpectedRtmrsCount(body.rtmrs.len()));
        }
        let m = |label: &str, v: &[u8]| Byte48::from_slice_padded(label, v).map(Some);
        Ok(TdxBaseline {
            mr_owner: m("mr_owner", &body.mr_owner)?,
            mr_owner_config: m("mr_owner_config", &body.mr_owner_config)?,
            mr_config_id: m("mr_config_id", &body.mr_config_id)?,
            mr_td: m("mr_td", &body.mr_td)?,
            rtmr0: m("rtmr0", &body.rtmrs[0])?,
            rtmr1: m("rtmr1", &body.rtmrs[1])?,
            rtmr2: m("rtmr2", &body.rtmrs[2])?,
            rtmr3: m("rtmr3", &body.rtmrs[3])?,
            check_debug: constant_time_mask(&MASK_DEBUG, &body.td_attributes) == 0,
            check_sept_ve_disable: constant_time_mask(&MASK_SEPT_VE_DISABLE, &body.td_attributes)
                == 1,
        })
    }
}
