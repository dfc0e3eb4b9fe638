use anyhow::{anyhow, Context, Result};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Listener TLS from PEM files: no client auth, HTTP/1.1 only.
pub async fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    info!(cert = %cert_path.display(), "configuring TLS listener");

    let cert_pem = tokio::fs::read(cert_path)
        .await
        .with_context(|| format!("read certificate {}", cert_path.display()))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .context("parse certificate PEM")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }
    debug!(chain_len = certs.len(), "parsed server certificate chain");

    let key_pem = Zeroizing::new(
        tokio::fs::read(key_path)
            .await
            .with_context(|| format!("read private key {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("parse private key PEM")?
        .ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

    let mut cfg = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to configure rustls with certificate and key")?;

    cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_pem_without_material() {
        let dir = std::env::temp_dir().join(format!("td-auth-tls-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        tokio::fs::write(&cert, "not a pem\n").await.unwrap();
        tokio::fs::write(&key, "").await.unwrap();

        let err = load_server_config(&cert, &key).await.unwrap_err();
        assert!(err.to_string().starts_with("no certificates found"));

        let err = load_server_config(&dir.join("missing.pem"), &key)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("read certificate"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
