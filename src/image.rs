//! Image reference handling.
//!
//! Thin helpers around [`oci_client::Reference`]: parsing pod image strings,
//! detecting digest pinning, producing the canonical digest form used by the
//! mutating webhook, and triangulating the cosign signature tag.

use oci_client::Reference;

use crate::error::Error;

/// Parse a pod container image string into a registry reference.
pub fn parse(image: &str) -> Result<Reference, Error> {
    image.parse().map_err(|e| Error::InvalidReference {
        reference: image.to_string(),
        reason: format!("{e}"),
    })
}

/// Whether the reference is already pinned to a content digest.
///
/// A digest-pinned reference is immutable; the mutating webhook leaves it
/// untouched so re-mutation is a no-op.
pub fn is_digest_pinned(reference: &Reference) -> bool {
    reference.digest().is_some()
}

/// Canonical digest form of a reference: `registry/repository@sha256:...`.
///
/// The tag, if any, is dropped; registry and repository are preserved.
pub fn with_digest(reference: &Reference, digest: &str) -> String {
    Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        digest.to_string(),
    )
    .whole()
}

/// The well-known tag under which cosign stores the signature image for a
/// digest: the digest with `:` replaced by `-`, suffixed with `.sig`, in the
/// same repository.
pub fn signature_tag(digest: &str) -> String {
    format!("{}.sig", digest.replace(':', "-"))
}

/// Reference to the cosign signature image for a resolved digest.
pub fn signature_reference(reference: &Reference, digest: &str) -> Reference {
    Reference::with_tag(
        reference.registry().to_string(),
        reference.repository().to_string(),
        signature_tag(digest),
    )
}
