//! lakom-webhook - image-integrity admission webhook for Kubernetes.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Loads configuration and the trusted cosign public keys
//! - Wires the registry client, verifier and resolution cache together
//! - Starts the health server, the cache refresh loop and the TLS webhook server

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use lakom_webhook::cache::{CacheConfig, ResolutionCache, SystemClock};
use lakom_webhook::config::Config;
use lakom_webhook::health::{HealthState, run_health_server};
use lakom_webhook::keys::TrustedKeys;
use lakom_webhook::registry::RegistryClient;
use lakom_webhook::verifier::LakomResolver;
use lakom_webhook::webhooks::{WebhookState, run_webhook_server};

/// Grace period for in-flight admission requests to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lakom_webhook=info".parse()?),
        )
        .json()
        .init();

    info!("Starting lakom-webhook");

    let config = Config::from_env()?;
    info!(
        failure_policy = %config.failure_policy,
        cache_ttl_secs = config.cache_ttl.as_secs(),
        refresh_interval_secs = config.cache_refresh_interval.as_secs(),
        "Loaded configuration"
    );

    let keys = Arc::new(TrustedKeys::load(&config.public_keys_path)?);
    info!(
        keys = keys.len(),
        path = %config.public_keys_path.display(),
        "Loaded trusted cosign public keys"
    );

    let health_state = Arc::new(HealthState::new());
    let metrics = Arc::clone(&health_state.metrics);

    let registry = Arc::new(RegistryClient::new(
        config.allow_insecure_registries,
        config.registry_credentials.clone(),
    ));
    let resolver = LakomResolver::new(registry, keys).with_metrics(Arc::clone(&metrics));
    let cache = Arc::new(
        ResolutionCache::new(
            Box::new(resolver),
            Box::new(SystemClock),
            CacheConfig {
                ttl: config.cache_ttl,
                // Refresh anything that would expire before the cycle after next
                refresh_ahead: config.cache_refresh_interval * 2,
                idle_eviction: config.cache_idle_eviction,
                resolve_timeout: config.resolve_timeout,
            },
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    // Start health server immediately (probes should work during startup)
    let health_handle = {
        let health_state = Arc::clone(&health_state);
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Background refresh loop, cancelled through the shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh_handle = tokio::spawn(Arc::clone(&cache).run_refresh_loop(
        config.cache_refresh_interval,
        shutdown_rx,
    ));

    let webhook_state = Arc::new(
        WebhookState::new(Arc::clone(&cache), config.failure_policy)
            .with_request_timeout(config.request_timeout)
            .with_metrics(Arc::clone(&metrics)),
    );
    let webhook_handle = {
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = run_webhook_server(webhook_state, &config).await {
                error!("Webhook server error: {}", e);
            }
        })
    };

    health_state.set_ready(true).await;
    info!("lakom-webhook ready");

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = webhook_handle => {
            if let Err(e) = result {
                error!("Webhook server task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Mark as not ready to stop receiving new admission requests
            health_state.set_ready(false).await;

            // Stop the refresh loop
            let _ = shutdown_tx.send(true);
            let _ = refresh_handle.await;

            // Give in-flight admission requests time to complete
            info!(
                "Waiting {}s for in-flight requests to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
    }

    info!("lakom-webhook stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the webhook cannot shut
/// down gracefully without them. Using expect() here is intentional.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
