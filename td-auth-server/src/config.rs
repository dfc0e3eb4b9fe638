use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use td_verifier::attestation::config::INTEL_PCS_URL;
use td_verifier::attestation::VerifierConfig;

/// Slack between the login deadline and the request timeout.
const DEADLINE_MARGIN: Duration = Duration::from_millis(500);

#[derive(Clone, Deserialize)]
/// Runtime configuration loaded from `ATTEST_*` environment variables.
///
/// Not `Debug`: it carries the admin token.
pub struct Config {
    pub log_level: Option<String>,

    #[serde(default = "def_listen_addr")]
    pub listen_addr: SocketAddr,

    /// PEM certificate chain; HTTPS is served when both paths are set.
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,

    /// Bearer token of the record management API. Unset disables it.
    pub admin_token: Option<String>,

    /// Directory of the file storage. In-memory storage when unset.
    pub storage_path: Option<PathBuf>,

    #[serde(default = "def_pccs_url")]
    pub pccs_url: String,
    #[serde(default = "def_collateral_timeout_secs")]
    pub collateral_timeout_secs: u64,
    #[serde(default = "def_allowed_tcb_statuses")]
    pub allowed_tcb_statuses: String,

    #[serde(default = "def_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "def_min_response_ms")]
    pub min_response_ms: u64,
    #[serde(default = "def_cache_sweep_secs")]
    pub cache_sweep_secs: u64,
    #[serde(default = "def_token_default_ttl_secs")]
    pub token_default_ttl_secs: u64,
}

impl Config {
    /// Populates the configuration from environment variables, honoring `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        tracing::debug!("fetching config");
        let _ = dotenvy::dotenv();
        let cfg: Self = envy::prefixed("ATTEST_").from_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects settings under which a login could outlive the request
    /// timeout and be answered by the timeout layer instead of the backend.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            anyhow::bail!("ATTEST_TLS_CERT_PATH and ATTEST_TLS_KEY_PATH must be set together");
        }
        if self.min_response() + DEADLINE_MARGIN > self.request_timeout() {
            anyhow::bail!(
                "ATTEST_MIN_RESPONSE_MS ({}ms) must be at least {}ms below ATTEST_REQUEST_TIMEOUT_SECS ({}s)",
                self.min_response_ms,
                DEADLINE_MARGIN.as_millis(),
                self.request_timeout_secs
            );
        }
        if self.verifier().collateral_timeout >= self.login_deadline() {
            anyhow::bail!(
                "ATTEST_COLLATERAL_TIMEOUT_SECS ({}s) must be shorter than the login deadline ({:?})",
                self.collateral_timeout_secs,
                self.login_deadline()
            );
        }
        Ok(())
    }

    /// Emit the effective configuration via tracing.
    pub fn info(&self) {
        tracing::info!(
            listen_addr = %self.listen_addr,
            tls = self.tls_cert_path.is_some(),
            admin_api = self.admin_token.is_some(),
            storage = %self.storage_path.as_ref().map_or("memory".into(), |p| p.display().to_string()),
            pccs_url = %self.pccs_url,
            allowed_tcb_statuses = %self.allowed_tcb_statuses,
            request_timeout_secs = self.request_timeout_secs,
            min_response_ms = self.min_response_ms,
            "effective config"
        );
        if self.listen_addr.ip().is_unspecified() {
            tracing::warn!("binding to 0.0.0.0, make sure this is intentional");
        }
        if self.tls_cert_path.is_none() {
            tracing::warn!("serving plain http; terminate tls in front of this service");
        }
    }

    pub fn verifier(&self) -> VerifierConfig {
        VerifierConfig {
            pccs_url: self.pccs_url.clone(),
            collateral_timeout: Duration::from_secs(self.collateral_timeout_secs),
            allowed_tcb_statuses: VerifierConfig::parse_statuses(&self.allowed_tcb_statuses),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn min_response(&self) -> Duration {
        Duration::from_millis(self.min_response_ms)
    }

    /// How long a login or nonce request may work before it is failed.
    pub fn login_deadline(&self) -> Duration {
        self.request_timeout().saturating_sub(DEADLINE_MARGIN)
    }

    pub fn cache_sweep(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_secs.max(1))
    }

    pub fn token_default_ttl(&self) -> Duration {
        Duration::from_secs(self.token_default_ttl_secs)
    }
}

fn def_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8200))
}

fn def_pccs_url() -> String {
    INTEL_PCS_URL.to_string()
}

fn def_collateral_timeout_secs() -> u64 {
    10
}

fn def_allowed_tcb_statuses() -> String {
    "UpToDate".to_string()
}

fn def_request_timeout_secs() -> u64 {
    15
}

fn def_min_response_ms() -> u64 {
    1000
}

fn def_cache_sweep_secs() -> u64 {
    30
}

fn def_token_default_ttl_secs() -> u64 {
    3600
}
