//! Resolution cache with single-flight, TTL, read-ahead refresh and idle
//! eviction.
//!
//! The cache is the only mutable state shared between admission requests.
//! Each image reference owns a slot; resolving a slot holds only that slot's
//! lock, so a slow registry round-trip for one image never blocks lookups of
//! another. Concurrent callers for the same key coalesce onto a single
//! in-flight resolution and share its result.
//!
//! Correctness never depends on cache contents: a dropped or expired entry is
//! simply re-resolved. The cache exists to keep the admission path inside the
//! API server's webhook timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::health::Metrics;
use crate::verifier::Verdict;

/// Outcome of resolving one image reference: the digest-pinned form plus the
/// signature verdict computed over that digest.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// Canonical `repository@sha256:...` form
    pub digest_ref: String,
    /// Signature verification verdict for the digest
    pub verdict: Verdict,
}

/// Resolves an image reference to a digest and signature verdict.
///
/// Production wires this to the registry client and cosign verifier; tests
/// substitute fakes.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve(&self, image: &str) -> Result<ResolvedImage>;
}

/// Time source for TTL decisions, injected so tests can advance time
/// deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Production clock backed by the monotonic system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cache timing parameters.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an entry stays fresh after resolution
    pub ttl: Duration,
    /// Entries expiring within this window are refreshed proactively
    pub refresh_ahead: Duration,
    /// Entries unread for this long are evicted
    pub idle_eviction: Duration,
    /// Deadline for a single resolution
    pub resolve_timeout: Duration,
}

/// A cached resolution, handed to handlers as an owned snapshot.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub digest_ref: String,
    pub verdict: Verdict,
    fetched_at: Instant,
}

/// Per-key slot. The async mutex around the entry is the single-flight lock:
/// whoever holds it is the only resolver for this key.
struct Slot {
    state: tokio::sync::Mutex<Option<CachedImage>>,
    last_read: StdMutex<Instant>,
}

/// Concurrent image-resolution cache.
pub struct ResolutionCache {
    resolver: Box<dyn ImageResolver>,
    clock: Box<dyn Clock>,
    config: CacheConfig,
    entries: StdMutex<HashMap<String, Arc<Slot>>>,
    metrics: Option<Arc<Metrics>>,
}

impl ResolutionCache {
    pub fn new(
        resolver: Box<dyn ImageResolver>,
        clock: Box<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        Self {
            resolver,
            clock,
            config,
            entries: StdMutex::new(HashMap::new()),
            metrics: None,
        }
    }

    /// Attach a metrics handle recording hits, misses and resolution latency.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of keys currently tracked (including in-flight slots).
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached resolution for `image`, resolving it first if the
    /// cache has no fresh entry.
    ///
    /// At most one resolution per key is in flight at any time; concurrent
    /// callers for the same key wait on it and share its result. Resolver
    /// errors on the miss path are propagated unchanged, leaving any stale
    /// entry in place for the background refresher to retry.
    pub async fn get_or_resolve(&self, image: &str) -> Result<CachedImage> {
        let slot = self.slot(image);
        *slot.last_read.lock().unwrap_or_else(PoisonError::into_inner) = self.clock.now();

        let mut state = slot.state.lock().await;
        if let Some(entry) = state.as_ref() {
            if self.is_fresh(entry) {
                if let Some(metrics) = &self.metrics {
                    metrics.record_cache_hit();
                }
                return Ok(entry.clone());
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_cache_miss();
        }
        let entry = self.resolve_with_timeout(image).await?;
        *state = Some(entry.clone());
        Ok(entry)
    }

    /// One pass of the background maintenance: evict idle entries and
    /// proactively re-resolve entries nearing expiry, so the foreground
    /// admission path rarely sees a cold miss for frequently-used images.
    pub async fn refresh_cycle(&self) {
        let snapshot: Vec<(String, Arc<Slot>)> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };

        for (key, slot) in snapshot {
            let now = self.clock.now();
            let last_read = *slot.last_read.lock().unwrap_or_else(PoisonError::into_inner);
            if now.duration_since(last_read) >= self.config.idle_eviction {
                debug!(image = %key, "Evicting idle cache entry");
                self.entries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
                continue;
            }

            // Resolve outside the slot lock so fresh foreground reads are
            // never stuck behind a background round-trip. A concurrent
            // foreground resolution of the same key may race the swap; both
            // results are equally fresh.
            let due = {
                let state = slot.state.lock().await;
                state
                    .as_ref()
                    .map(|entry| {
                        now.duration_since(entry.fetched_at) + self.config.refresh_ahead
                            >= self.config.ttl
                    })
                    .unwrap_or(false)
            };
            if !due {
                continue;
            }

            match self.resolve_with_timeout(&key).await {
                Ok(entry) => {
                    debug!(image = %key, digest = %entry.digest_ref, "Refreshed cache entry");
                    *slot.state.lock().await = Some(entry);
                }
                Err(e) => {
                    // Keep serving the stale entry until it truly expires;
                    // the next cycle retries.
                    warn!(image = %key, error = %e, "Background refresh failed");
                }
            }
        }
    }

    /// Run the refresh loop until the shutdown signal fires.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_cycle().await;
                }
                _ = shutdown.changed() => {
                    info!("Cache refresh loop stopped");
                    break;
                }
            }
        }
    }

    fn slot(&self, image: &str) -> Arc<Slot> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(image.to_string()).or_insert_with(|| {
            Arc::new(Slot {
                state: tokio::sync::Mutex::new(None),
                last_read: StdMutex::new(self.clock.now()),
            })
        }))
    }

    fn is_fresh(&self, entry: &CachedImage) -> bool {
        self.clock.now().duration_since(entry.fetched_at) < self.config.ttl
    }

    async fn resolve_with_timeout(&self, image: &str) -> Result<CachedImage> {
        let started = Instant::now();
        let resolved = tokio::time::timeout(self.config.resolve_timeout, self.resolver.resolve(image))
            .await
            .map_err(|_| Error::Timeout {
                reference: image.to_string(),
            })??;
        if let Some(metrics) = &self.metrics {
            metrics.observe_resolution(started.elapsed().as_secs_f64());
        }
        Ok(CachedImage {
            digest_ref: resolved.digest_ref,
            verdict: resolved.verdict,
            fetched_at: self.clock.now(),
        })
    }
}
