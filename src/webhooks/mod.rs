//! Admission webhooks for image-integrity policy.
//!
//! Two endpoints implement the Kubernetes admission protocol:
//! - mutating: rewrite tag references to immutable digest references
//! - validating: verify cosign signatures over those digests
//!
//! The mutating webhook runs first in admission ordering, so the validating
//! webhook normally only sees digest-pinned references.

pub mod handlers;
pub mod pod_images;
mod server;

pub use handlers::{WebhookState, handle_resolve_tag_to_digest, handle_verify_cosign_signature};
pub use server::{
    RESOLVE_TAG_PATH, VERIFY_SIGNATURE_PATH, create_webhook_router, run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
