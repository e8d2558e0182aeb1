// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for the admission decision engine.
//!
//! These tests exercise the mutating and validating handlers, the resolution
//! cache and the failure policy WITHOUT a live Kubernetes cluster or a real
//! registry: a fake resolver stands in for the registry client and cosign
//! verifier, while the handlers, cache and response construction are the
//! production implementations.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run a specific test
//! cargo test --test functional test_tag_is_rewritten_to_digest
//! ```

mod admission_tests;
mod fake_resolver;
