//! Process configuration loaded from the environment.
//!
//! The webhook is deployed as a container with its knobs supplied through
//! environment variables; all values are fixed for the process lifetime.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Default time-to-live for cache entries.
const DEFAULT_CACHE_TTL_SECS: u64 = 600;
/// Default interval between background refresh cycles.
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;
/// Default window after which unread cache entries are evicted.
const DEFAULT_IDLE_EVICTION_SECS: u64 = 1800;
/// Default deadline for a single resolution. Must stay well below the
/// API server's webhook timeout so we always return a definitive verdict.
const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 5;
/// Default budget for one whole admission request, covering every image in
/// the pod. Below the API server's 10s default webhook timeout so the
/// failure policy, not the outer caller, decides the outcome.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 8;
/// Default webhook HTTPS port
const DEFAULT_WEBHOOK_PORT: u16 = 9443;
/// Default health/metrics HTTP port
const DEFAULT_HEALTH_PORT: u16 = 8080;
/// Default path to the cosign public key bundle
const DEFAULT_PUBLIC_KEYS_PATH: &str = "/etc/lakom/cosign/cosign.pub";
/// Default directory for the serving certificate
const DEFAULT_TLS_CERT_PATH: &str = "/etc/lakom/tls/tls.crt";
const DEFAULT_TLS_KEY_PATH: &str = "/etc/lakom/tls/tls.key";

/// What to do when an internal error (registry unreachable, malformed
/// manifest, timeout) prevents reaching a verdict.
///
/// This never applies to policy failures: an unsigned image is denied under
/// both settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Deny admission when resolution or verification errors out
    Fail,
    /// Admit the request unmodified when resolution or verification errors out
    Ignore,
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Fail" => Ok(FailurePolicy::Fail),
            "Ignore" => Ok(FailurePolicy::Ignore),
            other => Err(Error::Config(format!(
                "unknown failure policy {other:?}, expected \"Fail\" or \"Ignore\""
            ))),
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Fail => write!(f, "Fail"),
            FailurePolicy::Ignore => write!(f, "Ignore"),
        }
    }
}

/// Process-wide configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a cache entry stays fresh
    pub cache_ttl: Duration,
    /// Interval between background refresh cycles
    pub cache_refresh_interval: Duration,
    /// Entries unread for this long are evicted
    pub cache_idle_eviction: Duration,
    /// Deadline for a single image resolution (registry + verification)
    pub resolve_timeout: Duration,
    /// Budget for one whole admission request across all of its images
    pub request_timeout: Duration,
    /// Path to the PEM bundle of trusted cosign public keys
    pub public_keys_path: PathBuf,
    /// Serving certificate for the webhook endpoints
    pub tls_cert_path: PathBuf,
    /// Private key for the serving certificate
    pub tls_key_path: PathBuf,
    /// Optional CA bundle; when present, client certificates are required (mutual TLS)
    pub tls_client_ca_path: Option<PathBuf>,
    /// Port for the HTTPS admission endpoints
    pub webhook_port: u16,
    /// Port for the plaintext health/metrics endpoints
    pub health_port: u16,
    /// Verdict to apply when resolution itself errors
    pub failure_policy: FailurePolicy,
    /// Allow plain-HTTP registries (local development only)
    pub allow_insecure_registries: bool,
    /// Optional static registry credentials (username:password)
    pub registry_credentials: Option<(String, String)>,
}

impl Config {
    /// Load configuration from `LAKOM_*` environment variables, falling back
    /// to defaults where unset.
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self {
            cache_ttl: env_duration("LAKOM_CACHE_TTL_SECONDS", DEFAULT_CACHE_TTL_SECS)?,
            cache_refresh_interval: env_duration(
                "LAKOM_CACHE_REFRESH_INTERVAL_SECONDS",
                DEFAULT_REFRESH_INTERVAL_SECS,
            )?,
            cache_idle_eviction: env_duration(
                "LAKOM_CACHE_IDLE_EVICTION_SECONDS",
                DEFAULT_IDLE_EVICTION_SECS,
            )?,
            resolve_timeout: env_duration(
                "LAKOM_RESOLVE_TIMEOUT_SECONDS",
                DEFAULT_RESOLVE_TIMEOUT_SECS,
            )?,
            request_timeout: env_duration(
                "LAKOM_REQUEST_TIMEOUT_SECONDS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?,
            public_keys_path: env_path("LAKOM_COSIGN_PUBLIC_KEYS_PATH", DEFAULT_PUBLIC_KEYS_PATH),
            tls_cert_path: env_path("LAKOM_TLS_CERT_PATH", DEFAULT_TLS_CERT_PATH),
            tls_key_path: env_path("LAKOM_TLS_KEY_PATH", DEFAULT_TLS_KEY_PATH),
            tls_client_ca_path: std::env::var("LAKOM_TLS_CLIENT_CA_PATH")
                .ok()
                .map(PathBuf::from),
            webhook_port: env_port("LAKOM_WEBHOOK_PORT", DEFAULT_WEBHOOK_PORT)?,
            health_port: env_port("LAKOM_HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
            failure_policy: match std::env::var("LAKOM_FAILURE_POLICY") {
                Ok(value) => value.parse()?,
                Err(_) => FailurePolicy::Fail,
            },
            allow_insecure_registries: std::env::var("LAKOM_INSECURE_REGISTRIES")
                .map(|v| v == "true")
                .unwrap_or(false),
            registry_credentials: registry_credentials_from_env(),
        })
    }
}

fn env_duration(name: &str, default_secs: u64) -> Result<Duration, Error> {
    match std::env::var(name) {
        Ok(value) => {
            let secs: u64 = value
                .parse()
                .map_err(|_| Error::Config(format!("{name} must be a number of seconds")))?;
            if secs == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

fn env_port(name: &str, default: u16) -> Result<u16, Error> {
    match std::env::var(name) {
        Ok(value) => {
            let port: u16 = value
                .parse()
                .map_err(|_| Error::Config(format!("{name} must be a port number")))?;
            if port == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
            Ok(port)
        }
        Err(_) => Ok(default),
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn registry_credentials_from_env() -> Option<(String, String)> {
    let username = std::env::var("LAKOM_REGISTRY_USERNAME").ok()?;
    let password = std::env::var("LAKOM_REGISTRY_PASSWORD").ok()?;
    Some((username, password))
}
