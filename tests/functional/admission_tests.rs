//! Admission handler tests: mutation, validation and failure policy.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionResponse, AdmissionReview};
use lakom_webhook::cache::{CacheConfig, ResolutionCache, SystemClock};
use lakom_webhook::config::FailurePolicy;
use lakom_webhook::verifier::Verdict;
use lakom_webhook::webhooks::{
    WebhookState, handle_resolve_tag_to_digest, handle_verify_cosign_signature,
};

use crate::fake_resolver::{FakeResolver, Outcome};

const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn pod_with_images(images: &[&str]) -> Pod {
    Pod {
        spec: Some(PodSpec {
            containers: images
                .iter()
                .enumerate()
                .map(|(i, image)| Container {
                    name: format!("container-{i}"),
                    image: Some(image.to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn admission_review(pod: &Pod, operation: &str) -> AdmissionReview<Pod> {
    let object = if operation == "DELETE" {
        serde_json::Value::Null
    } else {
        serde_json::to_value(pod).unwrap()
    };
    let old_object = if operation == "DELETE" {
        serde_json::to_value(pod).unwrap()
    } else {
        serde_json::Value::Null
    };
    serde_json::from_value(serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "name": "test-pod",
            "namespace": "default",
            "operation": operation,
            "userInfo": {"username": "kubelet"},
            "object": object,
            "oldObject": old_object,
            "dryRun": false
        }
    }))
    .unwrap()
}

fn webhook_state(resolver: FakeResolver, policy: FailurePolicy) -> WebhookState {
    let cache = Arc::new(ResolutionCache::new(
        Box::new(resolver),
        Box::new(SystemClock),
        CacheConfig {
            ttl: Duration::from_secs(600),
            refresh_ahead: Duration::from_secs(60),
            idle_eviction: Duration::from_secs(1800),
            resolve_timeout: Duration::from_secs(5),
        },
    ));
    WebhookState::new(cache, policy)
}

fn response(review: &AdmissionReview<DynamicObject>) -> &AdmissionResponse {
    review.response.as_ref().unwrap()
}

fn patch_ops(response: &AdmissionResponse) -> Vec<serde_json::Value> {
    let patch = response.patch.as_ref().unwrap();
    serde_json::from_slice::<serde_json::Value>(patch)
        .unwrap()
        .as_array()
        .unwrap()
        .clone()
}

#[tokio::test]
async fn test_tag_is_rewritten_to_digest() {
    let resolver = FakeResolver::new().verified(
        "registry.example/app:v1",
        &format!("registry.example/app@{DIGEST}"),
    );
    let state = webhook_state(resolver, FailurePolicy::Fail);

    let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "CREATE");
    let result = handle_resolve_tag_to_digest(&state, review).await;

    let resp = response(&result);
    assert!(resp.allowed);
    let ops = patch_ops(resp);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["op"], "replace");
    assert_eq!(ops[0]["path"], "/spec/containers/0/image");
    assert_eq!(
        ops[0]["value"],
        format!("registry.example/app@{DIGEST}").as_str()
    );
}

#[tokio::test]
async fn test_digest_pinned_image_is_left_untouched() {
    let resolver = FakeResolver::new();
    let calls = Arc::clone(&resolver.calls);
    let state = webhook_state(resolver, FailurePolicy::Fail);

    let pinned = format!("registry.example/app@{DIGEST}");
    let review = admission_review(&pod_with_images(&[&pinned]), "CREATE");
    let result = handle_resolve_tag_to_digest(&state, review).await;

    let resp = response(&result);
    assert!(resp.allowed);
    assert!(resp.patch.is_none());
    // No resolution was needed at all
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_delete_operations_are_always_allowed() {
    let state = webhook_state(FakeResolver::new(), FailurePolicy::Fail);

    let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "DELETE");
    let result = handle_resolve_tag_to_digest(&state, review).await;
    assert!(response(&result).allowed);

    let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "DELETE");
    let result = handle_verify_cosign_signature(&state, review).await;
    assert!(response(&result).allowed);
}

#[tokio::test]
async fn test_malformed_reference_denies_even_under_ignore_policy() {
    let state = webhook_state(FakeResolver::new(), FailurePolicy::Ignore);

    let review = admission_review(
        &pod_with_images(&["registry.example/app:v1:v2:v3"]),
        "CREATE",
    );
    let result = handle_resolve_tag_to_digest(&state, review).await;

    let resp = response(&result);
    assert!(!resp.allowed);
    assert!(resp.result.message.contains("invalid image reference"));
}

#[tokio::test]
async fn test_registry_outage_with_ignore_policy_allows_unmodified() {
    let resolver = FakeResolver::new().with("registry.example/app:v1", Outcome::Outage);
    let state = webhook_state(resolver, FailurePolicy::Ignore);

    let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "CREATE");
    let result = handle_resolve_tag_to_digest(&state, review).await;

    let resp = response(&result);
    assert!(resp.allowed);
    assert!(resp.patch.is_none());
}

#[tokio::test]
async fn test_registry_outage_with_fail_policy_denies() {
    let resolver = FakeResolver::new().with("registry.example/app:v1", Outcome::Outage);
    let state = webhook_state(resolver, FailurePolicy::Fail);

    let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "CREATE");
    let result = handle_resolve_tag_to_digest(&state, review).await;

    let resp = response(&result);
    assert!(!resp.allowed);
    assert!(resp.result.message.contains("registry unreachable"));
    // The raw transport error never leaks into the admission message
    assert!(!resp.result.message.contains("simulated"));
}

#[tokio::test]
async fn test_unsigned_image_is_denied_regardless_of_failure_policy() {
    for policy in [FailurePolicy::Fail, FailurePolicy::Ignore] {
        let resolver = FakeResolver::new().with(
            "registry.example/app:v1",
            Outcome::Resolves {
                digest_ref: format!("registry.example/app@{DIGEST}"),
                verdict: Verdict::Unsigned,
            },
        );
        let state = webhook_state(resolver, policy);

        let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "CREATE");
        let result = handle_verify_cosign_signature(&state, review).await;

        let resp = response(&result);
        assert!(!resp.allowed, "policy {policy:?} must still deny unsigned");
        assert!(resp.result.message.contains("unsigned"));
        assert!(resp.result.message.contains("registry.example/app:v1"));
    }
}

#[tokio::test]
async fn test_key_mismatch_is_denied_naming_the_image() {
    let resolver = FakeResolver::new().with(
        "registry.example/app:v1",
        Outcome::Resolves {
            digest_ref: format!("registry.example/app@{DIGEST}"),
            verdict: Verdict::NoMatchingKey,
        },
    );
    let state = webhook_state(resolver, FailurePolicy::Fail);

    let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "CREATE");
    let result = handle_verify_cosign_signature(&state, review).await;

    let resp = response(&result);
    assert!(!resp.allowed);
    assert!(resp.result.message.contains("no configured public key"));
    assert!(resp.result.message.contains("registry.example/app:v1"));
}

#[tokio::test]
async fn test_verified_pod_is_allowed() {
    let resolver = FakeResolver::new().verified(
        "registry.example/app:v1",
        &format!("registry.example/app@{DIGEST}"),
    );
    let state = webhook_state(resolver, FailurePolicy::Fail);

    let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "CREATE");
    let result = handle_verify_cosign_signature(&state, review).await;
    assert!(response(&result).allowed);
}

#[tokio::test]
async fn test_one_bad_container_denies_the_whole_pod() {
    let resolver = FakeResolver::new()
        .verified(
            "registry.example/app:v1",
            &format!("registry.example/app@{DIGEST}"),
        )
        .with(
            "registry.example/sidecar:v2",
            Outcome::Resolves {
                digest_ref: format!("registry.example/sidecar@{DIGEST}"),
                verdict: Verdict::Unsigned,
            },
        );
    let state = webhook_state(resolver, FailurePolicy::Fail);

    let review = admission_review(
        &pod_with_images(&["registry.example/app:v1", "registry.example/sidecar:v2"]),
        "CREATE",
    );
    let result = handle_verify_cosign_signature(&state, review).await;

    let resp = response(&result);
    assert!(!resp.allowed);
    assert!(resp.result.message.contains("registry.example/sidecar:v2"));
}

#[tokio::test]
async fn test_undetermined_verdict_follows_failure_policy() {
    for (policy, expect_allowed) in [(FailurePolicy::Ignore, true), (FailurePolicy::Fail, false)] {
        let resolver = FakeResolver::new().with(
            "registry.example/app:v1",
            Outcome::Resolves {
                digest_ref: format!("registry.example/app@{DIGEST}"),
                verdict: Verdict::Undetermined {
                    reason: "registry unreachable while resolving signature".to_string(),
                },
            },
        );
        let state = webhook_state(resolver, policy);

        let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "CREATE");
        let result = handle_verify_cosign_signature(&state, review).await;
        assert_eq!(response(&result).allowed, expect_allowed);
    }
}

#[tokio::test]
async fn test_request_budget_exhaustion_follows_failure_policy() {
    for (policy, expect_allowed) in [(FailurePolicy::Ignore, true), (FailurePolicy::Fail, false)] {
        let resolver = FakeResolver::new().with("registry.example/app:v1", Outcome::Stall);
        let state = webhook_state(resolver, policy)
            .with_request_timeout(Duration::from_millis(50));

        let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "CREATE");
        let result = handle_resolve_tag_to_digest(&state, review).await;
        let resp = response(&result);
        assert_eq!(resp.allowed, expect_allowed);
        if !expect_allowed {
            assert!(resp.result.message.contains("timed out"));
        }

        let review = admission_review(&pod_with_images(&["registry.example/app:v1"]), "CREATE");
        let result = handle_verify_cosign_signature(&state, review).await;
        assert_eq!(response(&result).allowed, expect_allowed);
    }
}

#[tokio::test]
async fn test_missing_pod_object_is_denied() {
    let state = webhook_state(FakeResolver::new(), FailurePolicy::Ignore);

    let review: AdmissionReview<Pod> = serde_json::from_value(serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "operation": "CREATE",
            "userInfo": {"username": "kubelet"},
            "object": null,
            "dryRun": false
        }
    }))
    .unwrap();
    let result = handle_resolve_tag_to_digest(&state, review).await;
    assert!(!response(&result).allowed);
}

/// End-to-end scenario: the mutating webhook rewrites the tag to a digest,
/// and the subsequent validating call on the same pod is served from the
/// cache entry the mutation populated.
#[tokio::test]
async fn test_mutate_then_validate_shares_one_resolution() {
    let resolver = FakeResolver::new().verified(
        "registry.example/app:v1",
        &format!("registry.example/app@{DIGEST}"),
    );
    let calls = Arc::clone(&resolver.calls);
    let state = webhook_state(resolver, FailurePolicy::Fail);

    let pod = pod_with_images(&["registry.example/app:v1"]);

    let result = handle_resolve_tag_to_digest(&state, admission_review(&pod, "CREATE")).await;
    let resp = response(&result);
    assert!(resp.allowed);
    assert_eq!(
        patch_ops(resp)[0]["value"],
        format!("registry.example/app@{DIGEST}").as_str()
    );

    let result = handle_verify_cosign_signature(&state, admission_review(&pod, "CREATE")).await;
    assert!(response(&result).allowed);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
