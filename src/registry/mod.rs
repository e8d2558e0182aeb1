//! Image registry client.
//!
//! Resolves references to content digests via the standard manifest API and
//! pulls cosign signature images. Stateless and safe for concurrent use; all
//! registry failures are classified into the error taxonomy so the admission
//! handlers can tell "image is bad" from "infrastructure is down".

use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::errors::OciDistributionError;
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use tracing::debug;

use crate::error::{Error, Result};

/// Media type cosign uses for simple-signing payload layers.
pub const SIMPLE_SIGNING_MEDIA_TYPE: &str = "application/vnd.dev.cosign.simplesigning.v1+json";

/// Layer annotation carrying the base64 signature over the layer payload.
pub const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";

/// Manifest media types accepted when resolving a reference to a digest.
const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

/// A resolved manifest: the canonical digest plus the raw payload bytes.
///
/// The bytes are kept so the verifier never has to re-fetch what resolution
/// already pulled.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    /// Canonical content digest (`sha256:...`)
    pub digest: String,
    /// Raw manifest payload as served by the registry
    pub manifest: Vec<u8>,
}

/// One layer of a cosign signature image: the simple-signing payload and the
/// base64 signature annotation (absent on malformed signature images).
#[derive(Debug, Clone)]
pub struct SignatureLayer {
    pub payload: Vec<u8>,
    pub signature: Option<String>,
}

/// Client for manifest resolution and signature-image retrieval.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    /// Create a client.
    ///
    /// `allow_insecure` switches to plain HTTP and is meant for local
    /// development registries only. Credentials are static basic auth;
    /// anonymous access is used when none are supplied.
    pub fn new(allow_insecure: bool, credentials: Option<(String, String)>) -> Self {
        let protocol = if allow_insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        let auth = match credentials {
            Some((username, password)) => RegistryAuth::Basic(username, password),
            None => RegistryAuth::Anonymous,
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Resolve a reference to its canonical digest, returning the raw
    /// manifest bytes alongside.
    pub async fn resolve_digest(&self, reference: &Reference) -> Result<ResolvedManifest> {
        let (manifest, digest) = self
            .client
            .pull_manifest_raw(reference, &self.auth, MANIFEST_MEDIA_TYPES)
            .await
            .map_err(|e| classify(reference, e))?;
        debug!(reference = %reference, digest = %digest, "Resolved manifest digest");
        Ok(ResolvedManifest { digest, manifest })
    }

    /// Pull the layers of a cosign signature image.
    ///
    /// Returns one entry per layer; a missing signature image surfaces as
    /// [`Error::NotFound`], which the verifier maps to an "unsigned" verdict.
    pub async fn pull_signature_layers(
        &self,
        signature_ref: &Reference,
    ) -> Result<Vec<SignatureLayer>> {
        let data = self
            .client
            .pull(signature_ref, &self.auth, vec![SIMPLE_SIGNING_MEDIA_TYPE])
            .await
            .map_err(|e| classify(signature_ref, e))?;
        debug!(
            reference = %signature_ref,
            layers = data.layers.len(),
            "Pulled signature image"
        );
        Ok(data
            .layers
            .into_iter()
            .map(|layer| SignatureLayer {
                signature: layer
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(SIGNATURE_ANNOTATION).cloned()),
                payload: layer.data,
            })
            .collect())
    }
}

/// Map registry transport errors onto the taxonomy.
fn classify(reference: &Reference, err: OciDistributionError) -> Error {
    let reference = reference.whole();
    match err {
        OciDistributionError::ImageManifestNotFoundError(_) => Error::NotFound { reference },
        OciDistributionError::UnauthorizedError { .. } => Error::Unauthorized { reference },
        OciDistributionError::ManifestParsingError(reason) => Error::MalformedManifest {
            reference,
            reason,
        },
        other => Error::Unavailable {
            reference,
            reason: other.to_string(),
        },
    }
}
