//! Login protocol: TOTP-gated nonce issuance and attestation-backed login for
//! both attestation kinds, plus administration of the identity records.

use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use td_verifier::attestation::{
    decode_b64, AttnError, MultiError, PlatformParameters, PlatformVerifier, QuoteV4,
    QuoteVerifier,
};
use td_verifier::challenge::{nonce_size, totp, Challenges};
use td_verifier::AttestationKind;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::AuthError;
use crate::records::{self, validate_name, Fields, TdxRecord, Tpm2Record, TrustedDomain};
use crate::storage::{Storage, StorageError};
use crate::token::{Credential, TokenIssuer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceResponse {
    pub nonce: String,
    /// Echo of the registered attestation key, TPM 2.0 only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ak_public: Option<String>,
}

/// Collaborators of the [`Backend`].
pub struct BackendParts {
    pub storage: Arc<dyn Storage>,
    pub challenges: Challenges,
    pub quote_verifier: Arc<dyn QuoteVerifier>,
    pub platform_verifier: Arc<dyn PlatformVerifier>,
    pub default_token_ttl: Duration,
    /// Floor on the latency of the unauthenticated endpoints.
    pub min_response: Duration,
    /// Ceiling on the work behind them; must end before the HTTP timeout.
    pub deadline: Duration,
}

pub struct Backend {
    storage: Arc<dyn Storage>,
    challenges: Challenges,
    quote_verifier: Arc<dyn QuoteVerifier>,
    platform_verifier: Arc<dyn PlatformVerifier>,
    tokens: TokenIssuer,
    min_response: Duration,
    deadline: Duration,
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), AuthError> {
    if cancel.is_cancelled() {
        Err(AuthError::Cancelled)
    } else {
        Ok(())
    }
}

impl Backend {
    pub fn new(parts: BackendParts) -> Self {
        Self {
            tokens: TokenIssuer::new(parts.storage.clone(), parts.default_token_ttl),
            storage: parts.storage,
            challenges: parts.challenges,
            quote_verifier: parts.quote_verifier,
            platform_verifier: parts.platform_verifier,
            min_response: parts.min_response,
            deadline: parts.deadline,
        }
    }

    pub fn challenges(&self) -> &Challenges {
        &self.challenges
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    /// Runs `fut` for at most `deadline` and holds the answer until
    /// `min_response` has passed since the call. Failures, running out of
    /// time included, are logged and replaced by the generic error.
    pub async fn sanitise<T, F>(&self, fut: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, AuthError>>,
    {
        let floor = Instant::now() + self.min_response;
        let res = match timeout(self.deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(AuthError::DeadlineExceeded(self.deadline)),
        };
        sleep_until(floor).await;
        res.map_err(AuthError::opaque)
    }

    async fn try_load<T: TrustedDomain>(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Option<T>, AuthError> {
        checkpoint(cancel)?;
        validate_name(name)?;
        debug!(attestation_type = %T::KIND, domain = name, "fetching domain from storage");

        let Some(raw) = self.storage.get(&T::storage_key(name)).await.inspect_err(|err| {
            error!(attestation_type = %T::KIND, domain = name, error = %err, "failed to fetch domain from storage");
        })?
        else {
            return Ok(None);
        };
        let mut td: T =
            serde_json::from_slice(&raw).map_err(|e| StorageError::Encoding(e.to_string()))?;
        td.set_name(name);
        Ok(Some(td))
    }

    async fn load<T: TrustedDomain>(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<T, AuthError> {
        self.try_load(cancel, name)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("{}/{name}", T::KIND)))
    }

    async fn save<T: TrustedDomain>(&self, td: &T) -> Result<(), AuthError> {
        debug!(attestation_type = %T::KIND, domain = td.name(), "pushing domain into storage");
        let raw = serde_json::to_vec(td).map_err(|e| StorageError::Encoding(e.to_string()))?;
        self.storage
            .put(&T::storage_key(td.name()), raw)
            .await
            .inspect_err(|err| {
                error!(attestation_type = %T::KIND, domain = td.name(), error = %err, "failed to push domain into storage");
            })?;
        Ok(())
    }

    fn validate_totp<T: TrustedDomain>(
        &self,
        cancel: &CancellationToken,
        td: &T,
        code: &str,
    ) -> Result<(), AuthError> {
        checkpoint(cancel)?;
        self.challenges
            .validate_totp(T::KIND, td.name(), td.totp_secret(), code)?;
        Ok(())
    }

    async fn issue_nonce<T: TrustedDomain>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        code: &str,
    ) -> Result<(T, String), AuthError> {
        let td: T = self.load(cancel, name).await?;
        self.validate_totp(cancel, &td, code)?;
        checkpoint(cancel)?;
        let nonce = self
            .challenges
            .issue_nonce(T::KIND, name, nonce_size(T::KIND))?;
        Ok((td, nonce))
    }

    async fn login<T: TrustedDomain>(&self, td: &T, errs: MultiError) -> Result<Credential, AuthError> {
        if !errs.is_empty() {
            error!(attestation_type = %T::KIND, domain = td.name(), error = %errs, "failed to login trusted domain");
            return Err(AuthError::Verification(errs));
        }
        let credential = self.tokens.issue(td).await?;
        info!(attestation_type = %T::KIND, domain = td.name(), "trusted domain logged in");
        Ok(credential)
    }

    pub async fn tdx_nonce(
        &self,
        cancel: &CancellationToken,
        name: &str,
        code: &str,
    ) -> Result<NonceResponse, AuthError> {
        self.sanitise(async {
            let (_, nonce) = self.issue_nonce::<TdxRecord>(cancel, name, code).await?;
            Ok(NonceResponse {
                nonce,
                ak_public: None,
            })
        })
        .await
    }

    pub async fn tpm2_nonce(
        &self,
        cancel: &CancellationToken,
        name: &str,
        code: &str,
    ) -> Result<NonceResponse, AuthError> {
        self.sanitise(async {
            let (td, nonce) = self.issue_nonce::<Tpm2Record>(cancel, name, code).await?;
            Ok(NonceResponse {
                nonce,
                ak_public: Some(td.baseline.ak_public.to_string()),
            })
        })
        .await
    }

    pub async fn tdx_login(
        &self,
        cancel: &CancellationToken,
        name: &str,
        code: &str,
        quote: &str,
    ) -> Result<Credential, AuthError> {
        self.sanitise(self.login_tdx(cancel, name, code, quote)).await
    }

    pub async fn tpm2_login(
        &self,
        cancel: &CancellationToken,
        name: &str,
        code: &str,
        attestation: &str,
        nonce: &str,
    ) -> Result<Credential, AuthError> {
        self.sanitise(self.login_tpm2(cancel, name, code, attestation, nonce))
            .await
    }

    async fn login_tdx(
        &self,
        cancel: &CancellationToken,
        name: &str,
        code: &str,
        quote_b64: &str,
    ) -> Result<Credential, AuthError> {
        const KIND: AttestationKind = AttestationKind::Tdx;

        let td: TdxRecord = self.load(cancel, name).await?;
        self.validate_totp(cancel, &td, code)?;

        checkpoint(cancel)?;
        debug!(attestation_type = %KIND, domain = name, "parsing tdx quote");
        if quote_b64.is_empty() {
            return Err(AuthError::InvalidRequest("`quote` field is required".into()));
        }
        let raw = decode_b64("failed to base64-decode tdx quote", quote_b64)?;
        let quote = QuoteV4::from_bytes(&raw).inspect_err(|err| {
            error!(attestation_type = %KIND, domain = name, error = %err, "failed to abi-parse tdx quote");
        })?;

        let mut errs = MultiError::default();

        checkpoint(cancel)?;
        let report_data = b64.encode(quote.report_data().unwrap_or_default());
        if self.challenges.check_nonce(KIND, name, &report_data).is_err() {
            errs.push(AttnError::UnexpectedNonce);
        }

        checkpoint(cancel)?;
        debug!(attestation_type = %KIND, domain = name, "validating tdx quote");
        if let Err(err) = self.quote_verifier.verify_quote(&raw).await {
            error!(attestation_type = %KIND, domain = name, error = %err, "failed to validate tdx quote");
            errs.push(err);
        }

        checkpoint(cancel)?;
        debug!(attestation_type = %KIND, domain = name, "verifying tdx quote");
        let findings = td.baseline.match_quote(Some(&quote));
        errs.extend_from(&findings);
        let ignored = findings.ignored().count();
        if ignored > 0 {
            debug!(attestation_type = %KIND, domain = name, ignored, "finished verifying tdx quote");
        }

        checkpoint(cancel)?;
        self.login(&td, errs).await
    }

    async fn login_tpm2(
        &self,
        cancel: &CancellationToken,
        name: &str,
        code: &str,
        attestation_b64: &str,
        nonce: &str,
    ) -> Result<Credential, AuthError> {
        const KIND: AttestationKind = AttestationKind::Tpm2;

        let td: Tpm2Record = self.load(cancel, name).await?;
        self.validate_totp(cancel, &td, code)?;

        checkpoint(cancel)?;
        if attestation_b64.is_empty() {
            return Err(AuthError::InvalidRequest(
                "`attestation` field is required".into(),
            ));
        }
        let raw = decode_b64("failed to base64-decode tpm2 attestation report", attestation_b64)?;
        let attestation: PlatformParameters = serde_json::from_slice(&raw).map_err(|e| {
            AuthError::InvalidRequest(format!(
                "failed to json-unmarshal tpm2 attestation report: {e}"
            ))
        })?;
        td.baseline.check_ak_echo(&attestation).inspect_err(|err| {
            error!(attestation_type = %KIND, domain = name, error = %err, "unexpected tpm2 attestation key");
        })?;

        checkpoint(cancel)?;
        if nonce.is_empty() {
            return Err(AuthError::InvalidRequest("`nonce` field is required".into()));
        }
        self.challenges.check_nonce(KIND, name, nonce)?;
        let nonce_raw = decode_b64("failed to base64-decode tpm2 nonce", nonce)?;

        let mut errs = MultiError::default();

        checkpoint(cancel)?;
        debug!(attestation_type = %KIND, domain = name, "validating tpm2 attestation");
        if let Err(err) = self.platform_verifier.verify_quotes(
            td.baseline.ak_public.as_slice(),
            &attestation,
            &nonce_raw,
        ) {
            error!(attestation_type = %KIND, domain = name, error = %err, "failed to verify tpm2 attestation");
            errs.push(err);
        }

        checkpoint(cancel)?;
        if let Err(err) = self.platform_verifier.verify_event_log(&attestation) {
            error!(attestation_type = %KIND, domain = name, error = %err, "failed to verify tpm2 event log");
            errs.push(err);
        }

        checkpoint(cancel)?;
        debug!(attestation_type = %KIND, domain = name, "verifying tpm2 attestation");
        let findings = td.baseline.match_attestation(Some(&attestation));
        errs.extend_from(&findings);
        let ignored = findings.ignored().count();
        if ignored > 0 {
            debug!(attestation_type = %KIND, domain = name, ignored, "finished verifying tpm2 attestation");
        }

        checkpoint(cancel)?;
        self.login(&td, errs).await
    }

    /// Alias a login for `name` would produce, without authenticating.
    pub fn alias(&self, kind: AttestationKind, name: &str) -> Result<String, AuthError> {
        validate_name(name)?;
        Ok(format!("{kind}/{name}"))
    }

    async fn upsert_record<T: TrustedDomain>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        fields: &Fields,
    ) -> Result<Fields, AuthError> {
        let existing: Option<T> = self.try_load(cancel, name).await?;
        if existing.is_some() {
            debug!(attestation_type = %T::KIND, domain = name, "updating domain");
        } else {
            debug!(attestation_type = %T::KIND, domain = name, "creating domain");
        }
        let (mut td, created) = records::upsert(existing, name, fields)?;

        checkpoint(cancel)?;
        if td.totp_secret().is_empty() {
            debug!(attestation_type = %T::KIND, domain = name, "generating totp secret");
            td.set_totp_secret(totp::generate_os_secret()?);
        } else {
            totp::decode_secret(td.totp_secret())?;
        }
        self.save(&td).await?;

        let mut out = td.describe();
        // the secret is only ever shown on creation
        if created {
            out.insert("totp_secret".into(), td.totp_secret().into());
        }
        Ok(out)
    }

    async fn read_record<T: TrustedDomain>(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Fields, AuthError> {
        let td: T = self.load(cancel, name).await?;
        Ok(td.describe())
    }

    async fn delete_record<T: TrustedDomain>(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<(), AuthError> {
        checkpoint(cancel)?;
        validate_name(name)?;
        debug!(attestation_type = %T::KIND, domain = name, "deleting domain");
        self.storage
            .delete(&T::storage_key(name))
            .await
            .inspect_err(|err| {
                error!(attestation_type = %T::KIND, domain = name, error = %err, "failed to delete domain");
            })?;
        Ok(())
    }

    pub async fn upsert(
        &self,
        cancel: &CancellationToken,
        kind: AttestationKind,
        name: &str,
        fields: &Fields,
    ) -> Result<Fields, AuthError> {
        match kind {
            AttestationKind::Tdx => self.upsert_record::<TdxRecord>(cancel, name, fields).await,
            AttestationKind::Tpm2 => self.upsert_record::<Tpm2Record>(cancel, name, fields).await,
        }
    }

    pub async fn read(
        &self,
        cancel: &CancellationToken,
        kind: AttestationKind,
        name: &str,
    ) -> Result<Fields, AuthError> {
        match kind {
            AttestationKind::Tdx => self.read_record::<TdxRecord>(cancel, name).await,
            AttestationKind::Tpm2 => self.read_record::<Tpm2Record>(cancel, name).await,
        }
    }

    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        kind: AttestationKind,
        name: &str,
    ) -> Result<(), AuthError> {
        match kind {
            AttestationKind::Tdx => self.delete_record::<TdxRecord>(cancel, name).await,
            AttestationKind::Tpm2 => self.delete_record::<Tpm2Record>(cancel, name).await,
        }
    }

    pub async fn list(
        &self,
        cancel: &CancellationToken,
        kind: AttestationKind,
    ) -> Result<Vec<String>, AuthError> {
        checkpoint(cancel)?;
        let names = self.storage.list(kind.as_str()).await.inspect_err(|err| {
            error!(attestation_type = %kind, error = %err, "failed to list domains");
        })?;
        Ok(names)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;
    use td_verifier::attestation::{Bytes, HashAlg, Pcr};
    use td_verifier::challenge::{ChallengeError, ManualClock};

    use crate::storage::MemoryStorage;

    /// 32 bytes of 0x01, zero-padded to a 48-byte measurement.
    const MR_TD: [u8; 48] = {
        let mut m = [0u8; 48];
        let mut i = 0;
        while i < 32 {
            m[i] = 0x01;
            i += 1;
        }
        m
    };

    fn fields(v: serde_json::Value) -> Fields {
        v.as_object().cloned().unwrap_or_default()
    }

    async fn register_alice(backend: &Backend) -> String {
        let out = backend
            .upsert(
                &CancellationToken::new(),
                AttestationKind::Tdx,
                "alice",
                &fields(json!({ "tdx_mr_td": b64.encode(&MR_TD[..32]), "tdx_check_debug": true })),
            )
            .await
            .unwrap();
        out["totp_secret"].as_str().unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn tdx_alice_end_to_end() {
        let (clock, backend) = backend_with(Ok(()));
        let cancel = CancellationToken::new();
        let secret = register_alice(&backend).await;
        let stored = backend.read(&cancel, AttestationKind::Tdx, "alice").await.unwrap();
        assert_eq!(stored["tdx_mr_td"], json!(b64.encode(MR_TD)));

        let started = Instant::now();
        let nonce = backend
            .tdx_nonce(&cancel, "alice", &code(&clock, &secret))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(nonce.ak_public.is_none());
        let report_data = b64.decode(&nonce.nonce).unwrap();
        assert_eq!(report_data.len(), 64);

        // the first code is spent; the client moves on to the next period
        clock.advance(totp::TOTP_PERIOD);
        let cred = backend
            .tdx_login(
                &cancel,
                "alice",
                &code(&clock, &secret),
                &tdx_quote(MR_TD, &report_data),
            )
            .await
            .unwrap();
        assert_eq!(cred.alias, "tdx/alice");
        assert_eq!(cred.metadata.get("tdx").map(String::as_str), Some("alice"));
        assert_eq!(cred.lease_duration, 3600);
        assert!(backend.tokens().lookup(&cred.client_token).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn totp_replay_is_rejected_until_a_fresh_code() {
        let (clock, backend) = backend_with(Ok(()));
        let cancel = CancellationToken::new();
        let secret = register_alice(&backend).await;
        let first = code(&clock, &secret);

        backend.issue_nonce::<TdxRecord>(&cancel, "alice", &first).await.unwrap();
        let replay = backend.issue_nonce::<TdxRecord>(&cancel, "alice", &first).await;
        assert!(matches!(
            replay,
            Err(AuthError::Challenge(ChallengeError::TotpReplay))
        ));

        // what the client sees
        let opaque = backend.tdx_nonce(&cancel, "alice", &first).await.unwrap_err();
        assert_eq!(opaque.to_string(), "invalid request");

        clock.advance(totp::TOTP_USED_TTL);
        backend
            .tdx_nonce(&cancel, "alice", &code(&clock, &secret))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn login_requires_a_nonce_issued_to_the_same_domain() {
        let (clock, backend) = backend_with(Ok(()));
        let cancel = CancellationToken::new();
        let secret = register_alice(&backend).await;
        let bob_secret = backend
            .upsert(&cancel, AttestationKind::Tdx, "bob", &Fields::new())
            .await
            .unwrap()["totp_secret"]
            .as_str()
            .unwrap()
            .to_string();

        let bobs = backend
            .issue_nonce::<TdxRecord>(&cancel, "bob", &code(&clock, &bob_secret))
            .await
            .unwrap()
            .1;

        for report_data in [b64.decode(bobs).unwrap(), vec![0x11; 64]] {
            clock.advance(totp::TOTP_PERIOD);
            let err = backend
                .login_tdx(&cancel, "alice", &code(&clock, &secret), &tdx_quote(MR_TD, &report_data))
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), "failed to login trusted domain: unexpected nonce");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_nonce_is_rejected() {
        let (clock, backend) = backend_with(Ok(()));
        let cancel = CancellationToken::new();
        let secret = register_alice(&backend).await;
        let (_, nonce) = backend
            .issue_nonce::<TdxRecord>(&cancel, "alice", &code(&clock, &secret))
            .await
            .unwrap();

        clock.advance(td_verifier::challenge::NONCE_TTL);
        let err = backend
            .login_tdx(
                &cancel,
                "alice",
                &code(&clock, &secret),
                &tdx_quote(MR_TD, &b64.decode(nonce).unwrap()),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unexpected nonce"));
    }

    #[tokio::test(start_paused = true)]
    async fn verifier_and_baseline_failures_are_aggregated() {
        let (clock, backend) = backend_with(Err(AttnError::QuoteSignature("bad qe signature".into())));
        let cancel = CancellationToken::new();
        let secret = register_alice(&backend).await;
        let (_, nonce) = backend
            .issue_nonce::<TdxRecord>(&cancel, "alice", &code(&clock, &secret))
            .await
            .unwrap();

        clock.advance(totp::TOTP_PERIOD);
        let err = backend
            .login_tdx(
                &cancel,
                "alice",
                &code(&clock, &secret),
                &tdx_quote([0; 48], &b64.decode(nonce).unwrap()),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to login trusted domain: 2 errors occurred: \
             failed to validate tdx quote: bad qe signature; mr_td mismatch"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_consumes_nothing() {
        let (clock, backend) = backend_with(Ok(()));
        let secret = register_alice(&backend).await;
        let first = code(&clock, &secret);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            backend.issue_nonce::<TdxRecord>(&cancelled, "alice", &first).await,
            Err(AuthError::Cancelled)
        ));
        assert!(backend.challenges().cache().is_empty());

        backend
            .issue_nonce::<TdxRecord>(&CancellationToken::new(), "alice", &first)
            .await
            .unwrap();
    }

    async fn tdx_attempt(backend: &Backend, clock: &ManualClock) -> (String, String, String) {
        let secret = register_alice(backend).await;
        let (_, nonce) = backend
            .issue_nonce::<TdxRecord>(&CancellationToken::new(), "alice", &code(clock, &secret))
            .await
            .unwrap();
        clock.advance(totp::TOTP_PERIOD);
        let quote = tdx_quote(MR_TD, &b64.decode(&nonce).unwrap());
        (code(clock, &secret), quote, nonce)
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_during_tdx_verification_issues_nothing() {
        let cancel = CancellationToken::new();
        let storage = Arc::new(MemoryStorage::new());
        let interrupt = Arc::new(Interrupting {
            step: Step::Quote,
            token: cancel.clone(),
        });
        let (clock, backend) = assemble(storage.clone(), interrupt.clone(), interrupt);
        let (totp_code, quote, nonce) = tdx_attempt(&backend, &clock).await;

        let res = backend.login_tdx(&cancel, "alice", &totp_code, &quote).await;
        assert!(matches!(res, Err(AuthError::Cancelled)));
        assert!(storage.list("token").await.unwrap().is_empty());
        assert!(backend
            .challenges()
            .check_nonce(AttestationKind::Tdx, "alice", &nonce)
            .is_ok());
    }

    #[rstest::rstest]
    #[case::quotes(Step::Quotes)]
    #[case::event_log(Step::EventLog)]
    #[tokio::test(start_paused = true)]
    async fn cancelled_during_tpm2_verification_issues_nothing(#[case] step: Step) {
        let cancel = CancellationToken::new();
        let storage = Arc::new(MemoryStorage::new());
        let interrupt = Arc::new(Interrupting {
            step,
            token: cancel.clone(),
        });
        let (clock, backend) = assemble(storage.clone(), interrupt.clone(), interrupt);
        let ak = [1u8, 2, 3, 4];
        let secret = backend
            .upsert(
                &CancellationToken::new(),
                AttestationKind::Tpm2,
                "bob",
                &fields(json!({ "tpm2_ak_public": b64.encode(ak) })),
            )
            .await
            .unwrap()["totp_secret"]
            .as_str()
            .unwrap()
            .to_string();
        let (_, nonce) = backend
            .issue_nonce::<Tpm2Record>(&CancellationToken::new(), "bob", &code(&clock, &secret))
            .await
            .unwrap();

        clock.advance(totp::TOTP_PERIOD);
        let res = backend
            .login_tpm2(
                &cancel,
                "bob",
                &code(&clock, &secret),
                &tpm2_attestation(&ak, [0; 32]),
                &nonce,
            )
            .await;
        assert!(matches!(res, Err(AuthError::Cancelled)));
        assert!(storage.list("token").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_chain_of_trust_hits_the_deadline() {
        let (clock, backend) = backend_using(
            Arc::new(MemoryStorage::new()),
            Arc::new(SlowQuoteVerifier(Duration::from_secs(20))),
        );
        let (totp_code, quote, _) = tdx_attempt(&backend, &clock).await;

        let started = Instant::now();
        let err = backend
            .tdx_login(&CancellationToken::new(), "alice", &totp_code, &quote)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid request");
        let took = started.elapsed();
        assert!(took >= Duration::from_millis(14_500) && took < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn sanitise_delays_success_and_failure_alike() {
        let (_, backend) = backend_with(Ok(()));
        for outcome in [Ok(()), Err(AuthError::Internal("boom".into()))] {
            let started = Instant::now();
            let res = backend.sanitise(async { outcome }).await;
            assert!(started.elapsed() >= Duration::from_secs(1));
            if let Err(err) = res {
                assert_eq!(err.to_string(), "invalid request");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_domain_is_not_found() {
        let (_, backend) = backend_with(Ok(()));
        let err = backend
            .issue_nonce::<Tpm2Record>(&CancellationToken::new(), "ghost", "12345678")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "domain is not configured: tpm2/ghost");
    }

    fn tpm2_attestation(ak: &[u8], pcr7: [u8; 32]) -> String {
        let att = PlatformParameters {
            tpm_version: 2,
            public: Bytes(ak.to_vec()),
            pcrs: vec![Pcr {
                index: 7,
                digest: Bytes(pcr7.to_vec()),
                digest_alg: HashAlg::SHA256,
            }],
            quotes: Vec::new(),
            event_log: Bytes::default(),
        };
        b64.encode(serde_json::to_vec(&att).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn tpm2_flow_checks_key_echo_and_pcrs() {
        let (clock, backend) = backend_with(Ok(()));
        let cancel = CancellationToken::new();
        let ak = [1u8, 2, 3, 4];
        let created = backend
            .upsert(
                &cancel,
                AttestationKind::Tpm2,
                "bob",
                &fields(json!({
                    "tpm2_ak_public": b64.encode(ak),
                    "tpm2_pcr07": b64.encode([0xA7u8; 32]),
                })),
            )
            .await
            .unwrap();
        let secret = created["totp_secret"].as_str().unwrap().to_string();

        let issued = backend
            .tpm2_nonce(&cancel, "bob", &code(&clock, &secret))
            .await
            .unwrap();
        assert_eq!(issued.ak_public.as_deref(), Some(b64.encode(ak).as_str()));
        assert_eq!(b64.decode(&issued.nonce).unwrap().len(), 20);

        clock.advance(totp::TOTP_PERIOD);
        let err = backend
            .login_tpm2(&cancel, "bob", &code(&clock, &secret), &tpm2_attestation(&[9, 9], [0xA7; 32]), &issued.nonce)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unexpected tpm2 attestation key");

        clock.advance(totp::TOTP_PERIOD);
        let err = backend
            .login_tpm2(&cancel, "bob", &code(&clock, &secret), &tpm2_attestation(&ak, [0xFF; 32]), &issued.nonce)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to login trusted domain: tpm2 pcr digest mismatch: 7"
        );

        clock.advance(totp::TOTP_PERIOD);
        let cred = backend
            .login_tpm2(&cancel, "bob", &code(&clock, &secret), &tpm2_attestation(&ak, [0xA7; 32]), &issued.nonce)
            .await
            .unwrap();
        assert_eq!(cred.alias, "tpm2/bob");
    }

    #[tokio::test]
    async fn crud_shows_secret_only_on_create() {
        let (_, backend) = backend_with(Ok(()));
        let cancel = CancellationToken::new();

        let created = backend
            .upsert(&cancel, AttestationKind::Tdx, "alice", &Fields::new())
            .await
            .unwrap();
        assert_eq!(created["totp_secret"].as_str().map(str::len), Some(32));

        let updated = backend
            .upsert(
                &cancel,
                AttestationKind::Tdx,
                "alice",
                &fields(json!({ "tdx_rtmr0": b64.encode([1u8; 48]) })),
            )
            .await
            .unwrap();
        assert!(!updated.contains_key("totp_secret"));
        assert!(updated.contains_key("tdx_rtmr0"));

        let read = backend.read(&cancel, AttestationKind::Tdx, "alice").await.unwrap();
        assert_eq!(read, updated);

        assert_eq!(
            backend.list(&cancel, AttestationKind::Tdx).await.unwrap(),
            vec!["alice"]
        );
        assert!(backend.list(&cancel, AttestationKind::Tpm2).await.unwrap().is_empty());

        backend.delete(&cancel, AttestationKind::Tdx, "alice").await.unwrap();
        assert!(matches!(
            backend.read(&cancel, AttestationKind::Tdx, "alice").await,
            Err(AuthError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_invalid_totp_secret_on_upsert() {
        let (_, backend) = backend_with(Ok(()));
        let err = backend
            .upsert(
                &CancellationToken::new(),
                AttestationKind::Tdx,
                "alice",
                &fields(json!({ "totp_secret": "not base32!" })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Challenge(ChallengeError::TotpSecret(_))));
    }

    #[test]
    fn alias_lookahead() {
        let (_, backend) = backend_with(Ok(()));
        assert_eq!(backend.alias(AttestationKind::Tpm2, "bob").unwrap(), "tpm2/bob");
        assert!(backend.alias(AttestationKind::Tdx, "../x").is_err());
    }
}
