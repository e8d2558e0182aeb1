//! Trusted cosign public keys.
//!
//! Keys are loaded once at startup from a single PEM bundle (which may hold
//! several `PUBLIC KEY` blocks), kept immutable for the process lifetime and
//! shared read-only by all verification calls. Cosign's default signing key
//! type is ECDSA P-256 over SHA-256, which is the only type accepted here.

use std::path::Path;

use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;

use crate::error::{Error, Result};

const PEM_BEGIN: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_END: &str = "-----END PUBLIC KEY-----";

/// A single trusted public key with a stable name used in log lines and
/// admission messages.
struct TrustedKey {
    name: String,
    key: VerifyingKey,
}

/// Ordered, immutable set of trusted cosign public keys.
pub struct TrustedKeys {
    keys: Vec<TrustedKey>,
}

impl TrustedKeys {
    /// Load keys from a PEM bundle on disk.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::KeyLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_pem(&contents, &path.display().to_string())
    }

    /// Parse keys from PEM text that may contain multiple public key blocks.
    pub fn from_pem(pem: &str, source: &str) -> Result<Self> {
        let mut keys = Vec::new();
        for block in pem_blocks(pem) {
            let key = VerifyingKey::from_public_key_pem(&block).map_err(|e| Error::KeyLoad {
                path: source.to_string(),
                reason: format!("public key {} is not a valid P-256 key: {e}", keys.len()),
            })?;
            keys.push(TrustedKey {
                name: format!("key-{}", keys.len()),
                key,
            });
        }
        if keys.is_empty() {
            return Err(Error::KeyLoad {
                path: source.to_string(),
                reason: "no PUBLIC KEY blocks found".to_string(),
            });
        }
        Ok(Self { keys })
    }

    /// Number of configured keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify a signature over `payload` against every configured key.
    ///
    /// A single matching key suffices; returns the name of the first match.
    /// Accepts both ASN.1 DER signatures (what cosign emits) and raw 64-byte
    /// fixed-size encodings.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> Option<&str> {
        let signature = Signature::from_der(signature)
            .or_else(|_| Signature::from_slice(signature))
            .ok()?;
        self.keys
            .iter()
            .find(|k| k.key.verify(payload, &signature).is_ok())
            .map(|k| k.name.as_str())
    }
}

/// Split PEM text into individual `PUBLIC KEY` blocks, preserving each
/// block's armor so it can be fed back to the PEM parser.
fn pem_blocks(pem: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in pem.lines() {
        let line = line.trim();
        if line == PEM_BEGIN {
            current = Some(vec![line]);
        } else if line == PEM_END {
            if let Some(mut block) = current.take() {
                block.push(line);
                blocks.push(block.join("\n"));
            }
        } else if let Some(block) = current.as_mut() {
            if !line.is_empty() {
                block.push(line);
            }
        }
    }
    blocks
}
