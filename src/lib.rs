//! lakom-webhook library crate
//!
//! Admission decision engine for image-integrity policy: tag-to-digest
//! mutation, cosign signature validation and the resolution cache that keeps
//! both inside the admission latency budget.

pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod image;
pub mod keys;
pub mod registry;
pub mod verifier;
pub mod webhooks;

pub use cache::{CacheConfig, CachedImage, ImageResolver, ResolutionCache, ResolvedImage, SystemClock};
pub use config::{Config, FailurePolicy};
pub use error::{Error, Result};
pub use health::HealthState;
pub use keys::TrustedKeys;
pub use registry::RegistryClient;
pub use verifier::{CosignVerifier, LakomResolver, Verdict};
pub use webhooks::{WebhookState, run_webhook_server};
