//! HTTPS server for the admission webhook.
//!
//! Serves `POST /mutate` and `GET /health` over TLS. Certificates are loaded
//! once at startup; an unreadable certificate or a failed bind is fatal.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use apss_lib::config::WebhookConfig;

use crate::admission;

/// Fatal webhook server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to load TLS material: {0}")]
    Io(#[from] std::io::Error),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
}

/// Build the webhook router.
pub fn router(cfg: Arc<WebhookConfig>) -> Router {
    Router::new()
        .route("/mutate", post(handle_mutate))
        .route("/health", get(handle_health))
        .with_state(cfg)
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_mutate(State(cfg): State<Arc<WebhookConfig>>, body: Bytes) -> Response {
    match admission::process_admission_review(&body, &cfg) {
        Ok(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            response,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to process admission review");
            (StatusCode::BAD_REQUEST, "Failed to decode request").into_response()
        }
    }
}

/// Load the server certificate chain and private key from PEM files.
fn load_tls_config(cert_file: &str, key_file: &str) -> Result<RustlsServerConfig, ServerError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
            .collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
            .ok_or_else(|| ServerError::NoPrivateKey(key_file.to_string()))?;

    Ok(RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?)
}

/// Serve the webhook over TLS until cancellation.
pub async fn serve_tls(
    addr: String,
    cfg: Arc<WebhookConfig>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let tls_config = load_tls_config(&cfg.tls_cert_file, &cfg.tls_key_file)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(&addr).await?;
    let app = router(cfg);

    info!(%addr, "webhook listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("webhook server stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        debug!(error = %err, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let service = TowerToHyperService::new(app.clone());
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            debug!(%peer, error = %err, "TLS handshake failed");
                            return;
                        }
                    };
                    if let Err(err) = ConnectionBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await
                    {
                        debug!(%peer, error = %err, "connection error");
                    }
                });
            }
        }
    }
}
