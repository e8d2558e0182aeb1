//! Fake image resolver for functional tests.
//!
//! Stands in for the registry client + cosign verifier pair: each known image
//! maps to a canned outcome, and every resolution increments a shared counter
//! so tests can assert on the number of simulated registry round-trips.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use lakom_webhook::cache::{ImageResolver, ResolvedImage};
use lakom_webhook::error::{Error, Result};
use lakom_webhook::verifier::Verdict;

/// Canned outcome for one image reference.
#[derive(Clone)]
pub enum Outcome {
    /// Resolution succeeds with this digest reference and verdict
    Resolves { digest_ref: String, verdict: Verdict },
    /// The registry is unreachable for this image
    Outage,
    /// Resolution never completes; only a timeout ends it
    Stall,
}

/// Counting fake resolver with per-image outcomes.
pub struct FakeResolver {
    pub calls: Arc<AtomicUsize>,
    outcomes: HashMap<String, Outcome>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            outcomes: HashMap::new(),
        }
    }

    /// Register an outcome for an image reference.
    pub fn with(mut self, image: &str, outcome: Outcome) -> Self {
        self.outcomes.insert(image.to_string(), outcome);
        self
    }

    /// Shorthand: image resolves to `digest` and verifies against `key-0`.
    pub fn verified(self, image: &str, digest_ref: &str) -> Self {
        self.with(
            image,
            Outcome::Resolves {
                digest_ref: digest_ref.to_string(),
                verdict: Verdict::Verified {
                    key: "key-0".to_string(),
                },
            },
        )
    }

}

#[async_trait]
impl ImageResolver for FakeResolver {
    async fn resolve(&self, image: &str) -> Result<ResolvedImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.outcomes.get(image) {
            Some(Outcome::Resolves {
                digest_ref,
                verdict,
            }) => Ok(ResolvedImage {
                digest_ref: digest_ref.clone(),
                verdict: verdict.clone(),
            }),
            Some(Outcome::Outage) => Err(Error::Unavailable {
                reference: image.to_string(),
                reason: "simulated registry outage".to_string(),
            }),
            Some(Outcome::Stall) => {
                std::future::pending::<()>().await;
                unreachable!("stalled resolution was polled to completion")
            }
            None => Err(Error::NotFound {
                reference: image.to_string(),
            }),
        }
    }
}
