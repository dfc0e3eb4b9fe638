use axum::Router;
use hyper::server::conn::http1;
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use rustls::ServerConfig;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepts TCP connections, upgrades them to TLS, and serves the Axum app over HTTP/1.1.
///
/// On shutdown the accept loop stops and open connections finish their
/// in-flight request before closing.
pub async fn serve_https(
    listener: TcpListener,
    app: Router,
    tls: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    info!("https server listening");
    let acceptor = TlsAcceptor::from(tls);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown: stop accepting connections");
                break;
            }
            res = listener.accept() => {
                match res {
                    Ok((io, peer)) => {
                        debug!(%peer, "tcp accept");

                        let acceptor = acceptor.clone();
                        let app = app.clone();
                        let cancel = shutdown.child_token();

                        tokio::spawn(async move {
                            let tls_io = match acceptor.accept(io).await {
                                Ok(tls_io) => tls_io,
                                Err(e) => {
                                    warn!(%peer, error = ?e, "tls accept failed");
                                    return;
                                }
                            };
                            let conn = http1::Builder::new()
                                .serve_connection(TokioIo::new(tls_io), TowerToHyperService::new(app));
                            tokio::pin!(conn);
                            let mut draining = false;
                            let res = loop {
                                tokio::select! {
                                    res = conn.as_mut() => break res,
                                    _ = cancel.cancelled(), if !draining => {
                                        conn.as_mut().graceful_shutdown();
                                        draining = true;
                                    }
                                }
                            };
                            if let Err(e) = res {
                                warn!(%peer, error = ?e, "http1 connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = ?e, "listener.accept error; continuing"),
                }
            }
        }
    }
    info!("https listener loop exited");
}
