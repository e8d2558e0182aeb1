//! Admission webhook server.
//!
//! Serves the two lakom admission endpoints over TLS. The API server
//! authenticates to the webhook with a client certificate when a client CA
//! bundle is configured (mutual TLS); without one, plain server-side TLS is
//! used.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::AdmissionReview;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tracing::info;

use crate::config::Config;
use crate::error::Error;
use crate::webhooks::handlers::{
    WebhookState, handle_resolve_tag_to_digest, handle_verify_cosign_signature,
};

/// Path of the mutating (tag rewrite) endpoint
pub const RESOLVE_TAG_PATH: &str = "/lakom/resolve-tag-to-digest";
/// Path of the validating (signature check) endpoint
pub const VERIFY_SIGNATURE_PATH: &str = "/lakom/verify-cosign-signature";

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(RESOLVE_TAG_PATH, post(resolve_tag_to_digest))
        .route(VERIFY_SIGNATURE_PATH, post(verify_cosign_signature))
        .with_state(state)
}

/// Mutating admission endpoint
async fn resolve_tag_to_digest(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(handle_resolve_tag_to_digest(&state, review).await),
    )
}

/// Validating admission endpoint
async fn verify_cosign_signature(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(handle_verify_cosign_signature(&state, review).await),
    )
}

/// Run the webhook server with TLS on the configured port.
pub async fn run_webhook_server(state: Arc<WebhookState>, config: &Config) -> Result<(), Error> {
    let app = create_webhook_router(state);

    let tls = server_tls_config(
        &config.tls_cert_path,
        &config.tls_key_path,
        config.tls_client_ca_path.as_deref(),
    )?;
    let rustls_config = RustlsConfig::from_config(Arc::new(tls));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.webhook_port));
    info!(
        port = config.webhook_port,
        mutual_tls = config.tls_client_ca_path.is_some(),
        "Webhook server listening with TLS"
    );

    axum_server::bind_rustls(addr, rustls_config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::Tls(format!("webhook server error: {e}")))?;

    Ok(())
}

/// Assemble the rustls server configuration.
///
/// With a client CA bundle, peers must present a certificate signed by it.
fn server_tls_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca_path: Option<&Path>,
) -> Result<rustls::ServerConfig, Error> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let config = match client_ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("invalid client CA certificate: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::Tls(format!("client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| Error::Tls(format!("invalid server certificate: {e}")))?;

    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot open {}: {e}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| Error::Tls(format!("cannot parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}
