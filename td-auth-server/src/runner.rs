use anyhow::{anyhow, Context, Result};
use axum::Router;
use rustls::crypto::{self, CryptoProvider};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use td_verifier::attestation::{DcapQuoteVerifier, NativePlatformVerifier};
use td_verifier::challenge::{Challenges, OsEntropy, SingleUseCache};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendParts};
use crate::config::Config;
use crate::handlers::shutdown_signal;
use crate::router::build_router;
use crate::server::serve_https;
use crate::state::AppState;
use crate::storage::{FileStorage, MemoryStorage, Storage};

/// Top-level orchestrator of the credential issuer.
pub struct Runner {
    listener: TcpListener,
    tls: Option<Arc<ServerConfig>>,
    app: Router,
    backend: Arc<Backend>,
    sweep_every: Duration,
    shutdown: CancellationToken,
}

impl Runner {
    pub fn builder(cfg: Config) -> RunnerBuilder {
        RunnerBuilder::from(cfg)
    }

    /// Bind a TCP listener, annotating errors with context.
    async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        info!(%addr, "binding listener");
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind listener addr {addr}"))
    }

    /// Serves until a shutdown signal is received.
    pub async fn run(self) -> Result<()> {
        debug!("starting runner");

        let Runner {
            listener,
            tls,
            app,
            backend,
            sweep_every,
            shutdown,
        } = self;

        let sweeper = spawn_sweeper(backend, sweep_every, shutdown.clone());

        let server = match tls {
            Some(tls) => tokio::spawn(serve_https(listener, app, tls, shutdown.clone())),
            None => {
                let cancel = shutdown.clone();
                tokio::spawn(async move {
                    info!("http server listening");
                    let graceful = async move { cancel.cancelled().await };
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(graceful)
                        .await
                    {
                        error!(error = ?e, "http server failed");
                    }
                })
            }
        };

        shutdown_signal().await;
        info!("shutdown signal received, exiting");
        shutdown.cancel();

        if let Err(e) = sweeper.await {
            error!(error = ?e, "cache sweeper task panicked");
        }
        if let Err(e) = server.await {
            error!(error = ?e, "server task panicked");
        }

        Ok(())
    }
}

pub struct RunnerBuilder {
    cfg: Config,
    listener: Option<TcpListener>,
    tls: Option<Arc<ServerConfig>>,
    shutdown: CancellationToken,
}

impl RunnerBuilder {
    pub fn from(cfg: Config) -> Self {
        if CryptoProvider::install_default(crypto::ring::default_provider()).is_err() {
            debug!("rustls crypto provider already installed");
        }

        Self {
            cfg,
            listener: None,
            tls: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn bind(mut self) -> Result<Self> {
        self.listener = Some(Runner::bind(self.cfg.listen_addr).await?);
        Ok(self)
    }

    pub async fn load_tls(mut self) -> Result<Self> {
        if let (Some(cert), Some(key)) = (&self.cfg.tls_cert_path, &self.cfg.tls_key_path) {
            let tls = crate::tls::load_server_config(cert, key)
                .await
                .context("initial TLS load")?;
            self.tls = Some(tls);
        }
        Ok(self)
    }

    pub async fn build(self) -> Result<Runner> {
        let listener = self
            .listener
            .ok_or_else(|| anyhow!("listener not bound"))?;

        let storage: Arc<dyn Storage> = match &self.cfg.storage_path {
            Some(path) => Arc::new(
                FileStorage::open(path)
                    .await
                    .with_context(|| format!("open storage {}", path.display()))?,
            ),
            None => {
                warn!("using in-memory storage; records are lost on restart");
                Arc::new(MemoryStorage::new())
            }
        };

        let backend = Backend::new(BackendParts {
            storage,
            challenges: Challenges::new(Arc::new(SingleUseCache::new()), Arc::new(OsEntropy)),
            quote_verifier: Arc::new(DcapQuoteVerifier::new(self.cfg.verifier())),
            platform_verifier: Arc::new(NativePlatformVerifier),
            default_token_ttl: self.cfg.token_default_ttl(),
            min_response: self.cfg.min_response(),
            deadline: self.cfg.login_deadline(),
        });
        let state = AppState::new(backend, self.cfg.admin_token.clone(), self.shutdown.clone());
        let backend = state.backend.clone();
        let app = build_router(state, self.cfg.request_timeout());

        Ok(Runner {
            listener,
            tls: self.tls,
            app,
            backend,
            sweep_every: self.cfg.cache_sweep(),
            shutdown: self.shutdown,
        })
    }
}

/// Evicts expired challenge entries and expired tokens. Lookups ignore
/// expired entries anyway, so this only bounds memory and storage.
fn spawn_sweeper(backend: Arc<Backend>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let cache = backend.challenges().cache();
                    let purged = cache.purge_expired();
                    if purged > 0 {
                        debug!(purged, remaining = cache.len(), "swept challenge cache");
                    }
                    match backend.tokens().purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "swept expired tokens"),
                        Err(e) => warn!(error = %e, "token sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{backend_using, StubQuoteVerifier};
    use crate::records::{TdxRecord, TrustedDomain};
    use crate::token::{token_key, TokenEntry};

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_expired_entries_until_cancelled() {
        let storage = Arc::new(MemoryStorage::new());
        let (clock, backend) = backend_using(storage.clone(), Arc::new(StubQuoteVerifier(Ok(()))));
        let backend = Arc::new(backend);
        let cache = backend.challenges().cache().clone();
        cache.add("tdx/alice/nonce/a", Duration::from_secs(15)).unwrap();
        cache.add("tdx/alice/totp/1", Duration::from_secs(3)).unwrap();

        let live = backend.tokens().issue(&TdxRecord::blank("alice")).await.unwrap();
        let stale = TokenEntry {
            alias: "tdx/alice".into(),
            policies: Vec::new(),
            metadata: Default::default(),
            issued_at: 1,
            expires_at: 2,
        };
        storage
            .put(&token_key("tda.stale"), serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(backend.clone(), Duration::from_secs(30), cancel.clone());

        clock.advance(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cache.len(), 1);
        assert!(cache.get("tdx/alice/nonce/a"));
        assert!(storage.get(&token_key("tda.stale")).await.unwrap().is_none());
        assert!(storage.get(&token_key(&live.client_token)).await.unwrap().is_some());

        cancel.cancel();
        handle.await.unwrap();
    }
}
