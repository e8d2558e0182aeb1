//! Admission handlers: tag-to-digest mutation and signature validation.
//!
//! Handlers are pure functions of (request, cache state): they extract the
//! pod's image references, consult the resolution cache and build an
//! admission response. They are the only layer that interprets the failure
//! policy — the cache and its resolver propagate typed errors unchanged.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, info, warn};

use crate::cache::ResolutionCache;
use crate::config::FailurePolicy;
use crate::error::Error;
use crate::health::Metrics;
use crate::image;
use crate::verifier::Verdict;
use crate::webhooks::pod_images::pod_images;

/// Default budget for one whole admission request. Below the API server's
/// 10s default webhook timeout, so the failure policy decides the outcome
/// before the outer caller gives up.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Shared state for the admission handlers.
pub struct WebhookState {
    pub cache: Arc<ResolutionCache>,
    pub failure_policy: FailurePolicy,
    pub request_timeout: Duration,
    pub metrics: Option<Arc<Metrics>>,
}

impl WebhookState {
    pub fn new(cache: Arc<ResolutionCache>, failure_policy: FailurePolicy) -> Self {
        Self {
            cache,
            failure_policy,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            metrics: None,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, handler: &str, allowed: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_admission(handler, allowed);
        }
    }
}

/// Mutating handler: rewrite every tag-form container image to its resolved
/// digest form via an RFC 6902 replace patch.
///
/// Digest-pinned references pass through untouched, so mutation is
/// idempotent. Resolution errors go through the failure policy; malformed
/// references always deny.
pub async fn handle_resolve_tag_to_digest(
    state: &WebhookState,
    review: AdmissionReview<Pod>,
) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Failed to extract mutating admission request");
            return AdmissionResponse::invalid(format!("invalid AdmissionReview: {e}"))
                .into_review();
        }
    };

    if request.operation == Operation::Delete {
        return AdmissionResponse::from(&request).into_review();
    }
    let Some(pod) = request.object.as_ref() else {
        state.record("mutate", false);
        return AdmissionResponse::from(&request)
            .deny("missing pod object in admission request")
            .into_review();
    };

    // The whole request runs under one budget; exhausting it is an
    // infrastructure failure subject to the failure policy, never an outer
    // webhook timeout.
    match tokio::time::timeout(state.request_timeout, mutate_pod(state, &request, pod)).await {
        Ok(review) => review,
        Err(_) => {
            warn!(uid = %request.uid, "Mutating admission request exceeded its budget");
            apply_failure_policy(
                state,
                &request,
                "mutate",
                &request.name,
                Error::Timeout {
                    reference: format!("pod {}", request.name),
                },
            )
        }
    }
}

async fn mutate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<Pod>,
    pod: &Pod,
) -> AdmissionReview<DynamicObject> {
    let mut operations = Vec::new();
    for pod_image in pod_images(pod) {
        let reference = match image::parse(&pod_image.image) {
            Ok(reference) => reference,
            Err(e) => {
                // Malformed reference is a client error, never subject to the
                // failure policy
                state.record("mutate", false);
                return AdmissionResponse::from(request)
                    .deny(format!(
                        "container {:?}: {}",
                        pod_image.container,
                        e.user_message()
                    ))
                    .into_review();
            }
        };
        if image::is_digest_pinned(&reference) {
            continue;
        }

        match state.cache.get_or_resolve(&pod_image.image).await {
            Ok(entry) => {
                debug!(
                    uid = %request.uid,
                    container = %pod_image.container,
                    image = %pod_image.image,
                    digest_ref = %entry.digest_ref,
                    "Rewriting tag reference to digest"
                );
                operations.push(serde_json::json!({
                    "op": "replace",
                    "path": pod_image.json_pointer,
                    "value": entry.digest_ref,
                }));
            }
            Err(e) => {
                return apply_failure_policy(state, request, "mutate", &pod_image.image, e);
            }
        }
    }

    if operations.is_empty() {
        state.record("mutate", true);
        return AdmissionResponse::from(request).into_review();
    }

    let patch: json_patch::Patch =
        match serde_json::from_value(serde_json::Value::Array(operations)) {
            Ok(patch) => patch,
            Err(e) => {
                warn!(uid = %request.uid, error = %e, "Failed to assemble image patch");
                return AdmissionResponse::invalid("failed to assemble image patch").into_review();
            }
        };
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => {
            info!(uid = %request.uid, "Admission request mutated");
            state.record("mutate", true);
            response.into_review()
        }
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "Failed to serialize image patch");
            AdmissionResponse::invalid("failed to serialize image patch").into_review()
        }
    }
}

/// Validating handler: deny the pod if any container image fails signature
/// verification.
///
/// References are expected to be digest-pinned already (the mutating webhook
/// runs first), so the verdict is normally a cache read. Undetermined
/// verdicts and resolution errors go through the failure policy; unsigned or
/// key-mismatched images always deny.
pub async fn handle_verify_cosign_signature(
    state: &WebhookState,
    review: AdmissionReview<Pod>,
) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Failed to extract validating admission request");
            return AdmissionResponse::invalid(format!("invalid AdmissionReview: {e}"))
                .into_review();
        }
    };

    if request.operation == Operation::Delete {
        return AdmissionResponse::from(&request).into_review();
    }
    let Some(pod) = request.object.as_ref() else {
        state.record("validate", false);
        return AdmissionResponse::from(&request)
            .deny("missing pod object in admission request")
            .into_review();
    };

    match tokio::time::timeout(state.request_timeout, validate_pod(state, &request, pod)).await {
        Ok(review) => review,
        Err(_) => {
            warn!(uid = %request.uid, "Validating admission request exceeded its budget");
            apply_failure_policy(
                state,
                &request,
                "validate",
                &request.name,
                Error::Timeout {
                    reference: format!("pod {}", request.name),
                },
            )
        }
    }
}

async fn validate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<Pod>,
    pod: &Pod,
) -> AdmissionReview<DynamicObject> {
    for pod_image in pod_images(pod) {
        if let Err(e) = image::parse(&pod_image.image) {
            state.record("validate", false);
            return AdmissionResponse::from(request)
                .deny(format!(
                    "container {:?}: {}",
                    pod_image.container,
                    e.user_message()
                ))
                .into_review();
        }

        let entry = match state.cache.get_or_resolve(&pod_image.image).await {
            Ok(entry) => entry,
            Err(e) => {
                return apply_failure_policy(state, request, "validate", &pod_image.image, e);
            }
        };
        match entry.verdict {
            Verdict::Verified { ref key } => {
                debug!(
                    uid = %request.uid,
                    image = %pod_image.image,
                    key = %key,
                    "Image signature verified"
                );
            }
            Verdict::Unsigned => {
                info!(uid = %request.uid, image = %pod_image.image, "Denying unsigned image");
                state.record("validate", false);
                return AdmissionResponse::from(request)
                    .deny(format!("image {} is unsigned", pod_image.image))
                    .into_review();
            }
            Verdict::NoMatchingKey => {
                info!(uid = %request.uid, image = %pod_image.image, "Denying key mismatch");
                state.record("validate", false);
                return AdmissionResponse::from(request)
                    .deny(format!(
                        "image {} is signed, but no configured public key matches",
                        pod_image.image
                    ))
                    .into_review();
            }
            Verdict::Undetermined { reason } => {
                return apply_failure_policy(
                    state,
                    request,
                    "validate",
                    &pod_image.image,
                    Error::Unavailable {
                        reference: pod_image.image.clone(),
                        reason,
                    },
                );
            }
        }
    }

    info!(uid = %request.uid, "Admission request allowed");
    state.record("validate", true);
    AdmissionResponse::from(request).into_review()
}

/// Turn an infrastructure error into an admission verdict according to the
/// configured failure policy.
fn apply_failure_policy(
    state: &WebhookState,
    request: &AdmissionRequest<Pod>,
    handler: &str,
    image: &str,
    error: Error,
) -> AdmissionReview<DynamicObject> {
    if error.is_client_error() {
        state.record(handler, false);
        return AdmissionResponse::from(request)
            .deny(error.user_message())
            .into_review();
    }
    match state.failure_policy {
        FailurePolicy::Ignore => {
            warn!(
                uid = %request.uid,
                image = %image,
                error = %error,
                "Resolution failed, admitting unmodified per failure policy"
            );
            state.record(handler, true);
            AdmissionResponse::from(request).into_review()
        }
        FailurePolicy::Fail => {
            warn!(
                uid = %request.uid,
                image = %image,
                error = %error,
                "Resolution failed, denying per failure policy"
            );
            state.record(handler, false);
            AdmissionResponse::from(request)
                .deny(error.user_message())
                .into_review()
        }
    }
}
