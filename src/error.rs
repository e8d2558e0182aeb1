//! Error types for image resolution and signature verification.
//!
//! The taxonomy distinguishes "the image is bad" from "the infrastructure is
//! down": admission handlers consult the configured failure policy only for
//! the latter, while client errors (malformed references) always deny.

use thiserror::Error;

/// Error type for resolution and verification operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The image reference string could not be parsed
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// The referenced manifest does not exist in the registry
    #[error("image {reference} not found in registry")]
    NotFound { reference: String },

    /// The registry rejected our credentials for this reference
    #[error("unauthorized to access {reference}")]
    Unauthorized { reference: String },

    /// The registry could not be reached (network error, 5xx, timeout on the wire)
    #[error("registry unavailable for {reference}: {reason}")]
    Unavailable { reference: String, reason: String },

    /// The registry returned a manifest we could not make sense of
    #[error("malformed manifest for {reference}: {reason}")]
    MalformedManifest { reference: String, reason: String },

    /// The per-request resolution deadline elapsed
    #[error("timed out resolving {reference}")]
    Timeout { reference: String },

    /// Trusted public keys could not be loaded at startup
    #[error("failed to load public keys from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Invalid process configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS material could not be loaded or assembled
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl Error {
    /// Client errors are caused by the request itself and always deny,
    /// regardless of the failure policy.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidReference { .. })
    }

    /// Short, category-level text suitable for an admission status message.
    ///
    /// Never leaks raw transport errors to the API server response.
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidReference { reference, .. } => {
                format!("invalid image reference {reference:?}")
            }
            Error::NotFound { reference } => format!("image {reference} not found"),
            Error::Unauthorized { reference } => {
                format!("not authorized to resolve {reference}")
            }
            Error::Unavailable { reference, .. } => {
                format!("registry unreachable while resolving {reference}")
            }
            Error::MalformedManifest { reference, .. } => {
                format!("manifest for {reference} is malformed")
            }
            Error::Timeout { reference } => {
                format!("timed out while resolving {reference}")
            }
            Error::KeyLoad { .. } | Error::Config(_) | Error::Tls(_) => {
                "internal configuration error".to_string()
            }
        }
    }
}

/// Result type alias for resolution and verification operations.
pub type Result<T> = std::result::Result<T, Error>;
