//! Credentials handed out after a successful login.
//!
//! The client token itself is never persisted; only its SHA-256 is stored,
//! under `token/{hex}`, next to the lease it was issued with.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use td_verifier::attestation::now_secs;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::errors::AuthError;
use crate::records::TrustedDomain;
use crate::storage::{Storage, StorageError};

const TOKEN_BYTES: usize = 32;
const TOKEN_PREFIX: &str = "tda.";
const TOKEN_NAMESPACE: &str = "token";

/// What the login endpoints return under `auth`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub client_token: String,
    /// Stable handle of the token that is safe to log.
    pub accessor: String,
    pub policies: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub alias: String,
    /// Seconds.
    pub lease_duration: u64,
    pub renewable: bool,
}

/// Persisted view of an issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub alias: String,
    pub policies: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub issued_at: u64,
    pub expires_at: u64,
}

pub fn token_key(client_token: &str) -> String {
    format!(
        "{TOKEN_NAMESPACE}/{}",
        hex::encode(Sha256::digest(client_token.as_bytes()))
    )
}

pub struct TokenIssuer {
    storage: Arc<dyn Storage>,
    default_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(storage: Arc<dyn Storage>, default_ttl: Duration) -> Self {
        Self {
            storage,
            default_ttl,
        }
    }

    /// Issues a token for `td` using its token parameters.
    pub async fn issue<T: TrustedDomain>(&self, td: &T) -> Result<Credential, AuthError> {
        let params = td.token();
        let mut lease = if params.token_ttl > 0 {
            params.token_ttl
        } else {
            self.default_ttl.as_secs()
        };
        if params.token_max_ttl > 0 {
            lease = lease.min(params.token_max_ttl);
        }

        let mut raw = Zeroizing::new([0u8; TOKEN_BYTES]);
        OsRng
            .try_fill_bytes(&mut raw[..])
            .map_err(|e| AuthError::Internal(format!("failed to generate token: {e}")))?;
        let client_token = format!("{TOKEN_PREFIX}{}", hex::encode(&raw[..]));
        let key = token_key(&client_token);

        let metadata: BTreeMap<String, String> =
            [(T::KIND.to_string(), td.name().to_string())].into();
        let issued_at = now_secs();
        let entry = TokenEntry {
            alias: td.alias(),
            policies: params.token_policies.clone(),
            metadata: metadata.clone(),
            issued_at,
            expires_at: issued_at.saturating_add(lease),
        };
        let encoded =
            serde_json::to_vec(&entry).map_err(|e| StorageError::Encoding(e.to_string()))?;
        self.storage.put(&key, encoded).await?;

        let accessor = key.trim_start_matches("token/")[..16].to_string();
        debug!(
            attestation_type = %T::KIND,
            domain = td.name(),
            accessor = %accessor,
            lease_secs = lease,
            "issued token"
        );

        Ok(Credential {
            client_token,
            accessor,
            policies: entry.policies,
            metadata,
            alias: entry.alias,
            lease_duration: lease,
            renewable: false,
        })
    }

    /// The entry behind `client_token`, if it exists and has not expired.
    /// An expired entry is removed on the way.
    pub async fn lookup(&self, client_token: &str) -> Result<Option<TokenEntry>, AuthError> {
        let key = token_key(client_token);
        let Some(entry) = self.load(&key).await? else {
            return Ok(None);
        };
        if entry.expires_at <= now_secs() {
            self.storage.delete(&key).await?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Deletes every stored entry whose lease has run out. Returns how many
    /// were removed.
    pub async fn purge_expired(&self) -> Result<usize, AuthError> {
        let now = now_secs();
        let mut purged = 0;
        for hash in self.storage.list(TOKEN_NAMESPACE).await? {
            let key = format!("{TOKEN_NAMESPACE}/{hash}");
            match self.load(&key).await {
                Ok(Some(entry)) if entry.expires_at > now => continue,
                Ok(None) => continue,
                Ok(Some(_)) => {}
                Err(err) => warn!(key = %key, error = %err, "dropping unreadable token entry"),
            }
            self.storage.delete(&key).await?;
            purged += 1;
        }
        Ok(purged)
    }

    async fn load(&self, key: &str) -> Result<Option<TokenEntry>, AuthError> {
        let Some(raw) = self.storage.get(key).await? else {
            return Ok(None);
        };
        let entry =
            serde_json::from_slice(&raw).map_err(|e| StorageError::Encoding(e.to_string()))?;
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{TdxRecord, Tpm2Record};
    use crate::storage::MemoryStorage;

    fn issuer() -> (Arc<MemoryStorage>, TokenIssuer) {
        let storage = Arc::new(MemoryStorage::new());
        let issuer = TokenIssuer::new(storage.clone(), Duration::from_secs(600));
        (storage, issuer)
    }

    #[tokio::test]
    async fn only_the_hash_is_stored() {
        let (storage, issuer) = issuer();
        let mut td = TdxRecord::blank("alice");
        td.token.token_policies = vec!["deploy".into()];

        let cred = issuer.issue(&td).await.unwrap();
        assert!(cred.client_token.starts_with("tda."));
        assert_eq!(cred.alias, "tdx/alice");
        assert_eq!(cred.metadata.get("tdx").map(String::as_str), Some("alice"));
        assert_eq!(cred.lease_duration, 600);

        let keys = storage.list("token").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(!keys[0].contains(&cred.client_token[4..]));
        assert_eq!(format!("token/{}", keys[0]), token_key(&cred.client_token));

        let entry = issuer.lookup(&cred.client_token).await.unwrap().unwrap();
        assert_eq!(entry.policies, vec!["deploy"]);
        assert!(issuer.lookup("tda.nope").await.unwrap().is_none());
    }

    async fn plant(storage: &MemoryStorage, client_token: &str, expires_at: u64) {
        let entry = TokenEntry {
            alias: "tdx/alice".into(),
            policies: Vec::new(),
            metadata: BTreeMap::new(),
            issued_at: 1,
            expires_at,
        };
        storage
            .put(&token_key(client_token), serde_json::to_vec(&entry).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_entries_are_removed_on_lookup() {
        let (storage, issuer) = issuer();
        plant(&storage, "tda.old", 2).await;

        assert!(issuer.lookup("tda.old").await.unwrap().is_none());
        assert!(storage.get(&token_key("tda.old")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_keeps_live_tokens_only() {
        let (storage, issuer) = issuer();
        let live = issuer.issue(&TdxRecord::blank("alice")).await.unwrap();
        plant(&storage, "tda.old", 2).await;
        plant(&storage, "tda.older", 1).await;
        storage.put("token/garbage", b"{".to_vec()).await.unwrap();

        assert_eq!(issuer.purge_expired().await.unwrap(), 3);
        assert_eq!(storage.list("token").await.unwrap().len(), 1);
        assert!(issuer.lookup(&live.client_token).await.unwrap().is_some());
        assert_eq!(issuer.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lease_honours_ttl_and_max() {
        let (_, issuer) = issuer();
        let mut td = Tpm2Record::blank("bob");
        td.token.token_ttl = 7200;
        td.token.token_max_ttl = 3600;
        let cred = issuer.issue(&td).await.unwrap();
        assert_eq!(cred.lease_duration, 3600);
        assert_eq!(cred.alias, "tpm2/bob");
    }
}
