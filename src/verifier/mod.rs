//! Cosign signature verification.
//!
//! A cosign signature lives in the same repository as the signed image, under
//! a tag derived from the image digest. Each layer of that signature image
//! carries a simple-signing JSON payload naming the digest it covers, and a
//! base64 ECDSA signature over the raw payload bytes in a layer annotation.
//! Verification succeeds when any layer's payload names our digest and its
//! signature validates against any trusted key.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use oci_client::Reference;
use serde::Deserialize;
use tracing::debug;

use crate::cache::{ImageResolver, ResolvedImage};
use crate::error::{Error, Result};
use crate::health::Metrics;
use crate::image;
use crate::keys::TrustedKeys;
use crate::registry::{RegistryClient, SignatureLayer};

/// Signature verification verdict for one image digest.
///
/// `Unsigned` and `NoMatchingKey` are policy failures and always deny;
/// `Undetermined` means the signature could not be looked up at all and is
/// subject to the failure policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// At least one signature validated against a trusted key
    Verified { key: String },
    /// No signature object exists for the digest
    Unsigned,
    /// Signatures exist but none validates against a configured key
    NoMatchingKey,
    /// Digest resolution succeeded but the signature lookup hit an
    /// infrastructure error
    Undetermined { reason: String },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Verified { .. })
    }

    /// Stable label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Verified { .. } => "verified",
            Verdict::Unsigned => "unsigned",
            Verdict::NoMatchingKey => "no-matching-key",
            Verdict::Undetermined { .. } => "undetermined",
        }
    }
}

/// Simple-signing payload, reduced to the fields verification needs.
#[derive(Debug, Deserialize)]
struct SimpleSigning {
    critical: Critical,
}

#[derive(Debug, Deserialize)]
struct Critical {
    image: CriticalImage,
}

#[derive(Debug, Deserialize)]
struct CriticalImage {
    #[serde(rename = "docker-manifest-digest")]
    docker_manifest_digest: String,
}

/// Verifies cosign signatures for resolved digests.
pub struct CosignVerifier {
    registry: Arc<RegistryClient>,
    keys: Arc<TrustedKeys>,
}

impl CosignVerifier {
    pub fn new(registry: Arc<RegistryClient>, keys: Arc<TrustedKeys>) -> Self {
        Self { registry, keys }
    }

    /// Verify the signature for `digest` of the image at `reference`.
    ///
    /// A missing signature image is a definitive `Unsigned` verdict, not an
    /// error; errors are reserved for lookups that could not complete.
    pub async fn verify(&self, reference: &Reference, digest: &str) -> Result<Verdict> {
        let signature_ref = image::signature_reference(reference, digest);
        let layers = match self.registry.pull_signature_layers(&signature_ref).await {
            Ok(layers) => layers,
            Err(Error::NotFound { .. }) => {
                debug!(reference = %reference, digest = %digest, "No signature image found");
                return Ok(Verdict::Unsigned);
            }
            Err(e) => return Err(e),
        };
        Ok(verify_layers(&layers, digest, &self.keys))
    }
}

/// Check fetched signature layers against the trusted keys.
///
/// Logical OR across both layers and keys: the first layer whose payload
/// names `digest` and whose signature validates against any key wins.
pub fn verify_layers(layers: &[SignatureLayer], digest: &str, keys: &TrustedKeys) -> Verdict {
    let mut saw_signature = false;
    for layer in layers {
        let Some(signature_b64) = &layer.signature else {
            continue;
        };
        saw_signature = true;

        let payload: SimpleSigning = match serde_json::from_slice(&layer.payload) {
            Ok(payload) => payload,
            Err(_) => continue,
        };
        if payload.critical.image.docker_manifest_digest != digest {
            continue;
        }
        let Ok(signature) = BASE64.decode(signature_b64) else {
            continue;
        };
        if let Some(key) = keys.verify(&layer.payload, &signature) {
            return Verdict::Verified {
                key: key.to_string(),
            };
        }
    }
    if saw_signature {
        Verdict::NoMatchingKey
    } else {
        Verdict::Unsigned
    }
}

/// Production resolver: registry digest resolution followed by cosign
/// verification, combined into one cacheable result.
pub struct LakomResolver {
    registry: Arc<RegistryClient>,
    verifier: CosignVerifier,
    metrics: Option<Arc<Metrics>>,
}

impl LakomResolver {
    pub fn new(registry: Arc<RegistryClient>, keys: Arc<TrustedKeys>) -> Self {
        let verifier = CosignVerifier::new(Arc::clone(&registry), keys);
        Self {
            registry,
            verifier,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl ImageResolver for LakomResolver {
    async fn resolve(&self, image: &str) -> Result<ResolvedImage> {
        let reference = image::parse(image)?;
        let resolved = self.registry.resolve_digest(&reference).await?;

        // The digest is known even if the signature lookup fails below, so a
        // lookup error becomes an Undetermined verdict rather than discarding
        // the resolution; the validating handler routes it through the
        // failure policy.
        let verdict = match self.verifier.verify(&reference, &resolved.digest).await {
            Ok(verdict) => verdict,
            Err(e) if e.is_client_error() => return Err(e),
            Err(e) => Verdict::Undetermined {
                reason: e.user_message(),
            },
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_verification(verdict.label());
        }
        debug!(image = %image, digest = %resolved.digest, verdict = verdict.label(), "Resolved image");

        Ok(ResolvedImage {
            digest_ref: image::with_digest(&reference, &resolved.digest),
            verdict,
        })
    }
}
