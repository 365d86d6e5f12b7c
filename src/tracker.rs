//! Correlation tracker
//!
//! Pipeline-facing orchestrator: consumes trace batches, extracts identity
//! dimensions from their resources, consults the correlation cache and
//! submits the resulting add/remove requests to the correlation client.
//!
//! Correlation is best-effort enrichment: nothing here returns an error to
//! the span pipeline. Only [`Tracker::shutdown`] reports failure, and only
//! for not stopping cleanly.

use crate::cache::CorrelationCache;
use crate::client::http::HttpTransport;
use crate::client::{ClientStats, CorrelationClient, CorrelationTransport};
use crate::config::CorrelationConfig;
use crate::error::CorrelationResult;
use crate::extract::extract_identity;
use crate::types::{Association, CorrelationRequest, DimensionKey, TraceBatch};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Tracker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    /// No dimension-bearing batch seen yet; cache and client not created
    Uninitialized,
    /// Cache and client live, batches being processed
    Active,
    /// Shutdown in progress, new batches ignored
    ShuttingDown,
    /// Shutdown complete
    Stopped,
}

struct TrackerInner {
    cache: Arc<CorrelationCache>,
    client: Arc<CorrelationClient>,
    last_sweep: Mutex<Instant>,
}

struct TrackerCore {
    state: TrackerState,
    inner: Option<Arc<TrackerInner>>,
}

/// Correlates trace resources with infrastructure dimensions and keeps the
/// backend correlation API in sync.
///
/// Cache and client are instantiated lazily on the first batch that yields
/// a dimension, so pipelines that never carry host-identifying resources
/// pay almost nothing.
pub struct Tracker {
    config: CorrelationConfig,
    transport: Arc<dyn CorrelationTransport>,
    core: Mutex<TrackerCore>,
}

impl Tracker {
    /// Create a tracker that talks to the configured HTTP endpoint
    pub fn new(config: CorrelationConfig) -> CorrelationResult<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(
            &config.endpoint,
            config.access_token.clone(),
            config.http_timeout(),
        )?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create a tracker with a custom transport (used by tests)
    pub fn with_transport(
        config: CorrelationConfig,
        transport: Arc<dyn CorrelationTransport>,
    ) -> Self {
        Self {
            config,
            transport,
            core: Mutex::new(TrackerCore {
                state: TrackerState::Uninitialized,
                inner: None,
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TrackerState {
        self.core.lock().state
    }

    /// Dispatch statistics, once the tracker has gone active
    pub fn stats(&self) -> Option<ClientStats> {
        self.core.lock().inner.as_ref().map(|inner| inner.client.stats())
    }

    /// Process one trace batch.
    ///
    /// Extracts dimensions per resource, records observations in the cache
    /// and submits correlation requests for anything new or stale. Never
    /// blocks on the network and never returns an error to the caller;
    /// dropped updates are counted in [`stats`](Self::stats). Batches
    /// without dimension-bearing resources are a complete no-op. Ignored
    /// once shutdown has begun.
    pub async fn add_spans(&self, batch: &TraceBatch) {
        if batch.is_empty() {
            return;
        }

        let identities: Vec<_> = batch
            .resources
            .iter()
            .map(|resource| extract_identity(&resource.attributes, &self.config.sync_attributes))
            .filter(|identity| identity.has_dimensions())
            .collect();
        if identities.is_empty() {
            return;
        }

        let Some(inner) = self.activate() else {
            debug!("tracker shutting down, batch ignored");
            return;
        };

        for identity in identities {
            let service = Association::Service(identity.service_or_fallback().to_string());
            let environment = identity.environment.clone().map(Association::Environment);

            for key in identity.dimensions {
                self.observe_and_submit(&inner, &key, &service);
                if let Some(env) = &environment {
                    self.observe_and_submit(&inner, &key, env);
                }
            }
        }

        self.sweep(&inner);
    }

    /// Stop the tracker, flushing queued correlation requests until
    /// `deadline`.
    ///
    /// Idempotent: repeated calls return `Ok` without further work. Returns
    /// an error only when outstanding requests had to be cancelled.
    pub async fn shutdown(&self, deadline: Duration) -> CorrelationResult<()> {
        let inner = {
            let mut core = self.core.lock();
            match core.state {
                TrackerState::ShuttingDown | TrackerState::Stopped => return Ok(()),
                TrackerState::Uninitialized | TrackerState::Active => {}
            }
            core.state = TrackerState::ShuttingDown;
            core.inner.clone()
        };

        let result = match inner {
            Some(inner) => inner.client.shutdown(deadline).await,
            None => Ok(()),
        };

        self.core.lock().state = TrackerState::Stopped;
        info!("correlation tracker stopped");
        result
    }

    /// Get the live inner state, creating it on first use.
    /// Returns `None` once shutdown has begun.
    fn activate(&self) -> Option<Arc<TrackerInner>> {
        let mut core = self.core.lock();
        match core.state {
            TrackerState::ShuttingDown | TrackerState::Stopped => return None,
            TrackerState::Active => return core.inner.clone(),
            TrackerState::Uninitialized => {}
        }

        let cache = Arc::new(CorrelationCache::new(
            self.config.stale_timeout(),
            self.config.entry_ttl(),
            self.config.max_cache_entries,
        ));
        let client = CorrelationClient::start(&self.config, self.transport.clone(), cache.clone());
        let inner = Arc::new(TrackerInner {
            cache,
            client,
            last_sweep: Mutex::new(Instant::now()),
        });
        core.inner = Some(inner.clone());
        core.state = TrackerState::Active;
        info!("correlation tracker active");
        Some(inner)
    }

    fn observe_and_submit(
        &self,
        inner: &TrackerInner,
        key: &DimensionKey,
        association: &Association,
    ) {
        if !inner.cache.observe(key, association) {
            return;
        }
        let request = CorrelationRequest::associate(key.clone(), association.clone());
        if inner.client.submit(request).is_err() {
            // The update was dropped; release the dirty slot and forget the
            // association so the next observation retries it.
            inner.cache.confirm(key, false);
            inner.cache.forget(key, association);
        }
    }

    /// Opportunistic eviction sweep, at most once per cleanup interval.
    /// TTL-expired associations are retracted from the backend.
    fn sweep(&self, inner: &TrackerInner) {
        {
            let mut last_sweep = inner.last_sweep.lock();
            if last_sweep.elapsed() < self.config.cleanup_interval() {
                return;
            }
            *last_sweep = Instant::now();
        }

        for (key, association) in inner.cache.evict() {
            debug!(key = %key, association = %association, "retracting expired correlation");
            let request = CorrelationRequest::disassociate(key, association);
            // Best effort: a full queue just drops the retraction.
            let _ = inner.client.submit(request);
        }
    }
}
