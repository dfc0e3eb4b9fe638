use std::{collections::HashSet, time::Duration};

/// Intel's Provisioning Certification Service, used when no PCCS is configured.
pub const INTEL_PCS_URL: &str = "https://api.trustedservices.intel.com";

#[derive(Debug, Clone)]
/// Parameters of the TDX chain-of-trust check.
pub struct VerifierConfig {
    /// PCCS (or Intel PCS) base URL collateral is fetched from.
    pub pccs_url: String,
    /// Upper bound on the collateral fetch.
    pub collateral_timeout: Duration,
    /// TCB statuses a verified quote may report, e.g. `UpToDate`.
    pub allowed_tcb_statuses: HashSet<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            pccs_url: INTEL_PCS_URL.to_string(),
            collateral_timeout: Duration::from_secs(10),
            allowed_tcb_statuses: ["UpToDate".to_string()].into_iter().collect(),
        }
    }
}

impl VerifierConfig {
    /// Parses a comma-separated status list, ignoring blanks.
    pub fn parse_statuses(list: &str) -> HashSet<String> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
