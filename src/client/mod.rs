//! Asynchronous correlation client
//!
//! Accepts correlation requests from the tracker and relays them to the
//! backend API on a pool of dispatch workers. Queued requests for the same
//! (dimension, association) slot are coalesced so only the newest operation
//! is sent; dispatch is rate limited with a token bucket and retried with
//! bounded exponential backoff on transient failure.
//!
//! Submission never blocks on the network: a full queue drops the update
//! and reports backpressure instead.

pub mod http;

use crate::cache::CorrelationCache;
use crate::config::CorrelationConfig;
use crate::error::{CorrelationError, CorrelationResult};
use crate::types::{Association, CorrelationOp, CorrelationRequest, DimensionKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Grace period for workers to finish their in-flight request after the
/// shutdown signal before they are aborted
const WORKER_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Polling interval while waiting for the queue to drain during shutdown
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Network seam for the dispatch workers.
///
/// Tests substitute a fake; production uses [`http::HttpTransport`].
/// Retryability of a failure is decided by
/// [`CorrelationError::is_retryable`].
#[async_trait]
pub trait CorrelationTransport: Send + Sync {
    /// Deliver one correlation request to the backend
    async fn send(&self, request: &CorrelationRequest) -> CorrelationResult<()>;
}

/// Coalescing identity of a queued request: same dimension and association,
/// regardless of operation, occupy one queue slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestSlot {
    key: DimensionKey,
    association: Association,
}

impl RequestSlot {
    fn of(request: &CorrelationRequest) -> Self {
        Self {
            key: request.key.clone(),
            association: request.association.clone(),
        }
    }
}

struct QueueInner {
    order: VecDeque<RequestSlot>,
    pending: HashMap<RequestSlot, CorrelationRequest>,
    accepting: bool,
}

/// Bounded FIFO queue with per-slot coalescing.
///
/// A newer request for an occupied slot replaces the queued one in place, so
/// a remove submitted after a not-yet-dispatched add supersedes it without
/// consuming extra capacity and without reordering the slot.
struct DispatchQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl DispatchQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner {
                order: VecDeque::new(),
                pending: HashMap::new(),
                accepting: true,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a request. Returns whether it coalesced into an existing slot.
    fn push(&self, request: CorrelationRequest) -> CorrelationResult<bool> {
        let slot = RequestSlot::of(&request);
        let coalesced = {
            let mut inner = self.inner.lock();
            if !inner.accepting {
                return Err(CorrelationError::ShuttingDown);
            }
            if let Some(existing) = inner.pending.get_mut(&slot) {
                *existing = request;
                true
            } else {
                if inner.order.len() >= self.capacity {
                    return Err(CorrelationError::QueueFull);
                }
                inner.order.push_back(slot.clone());
                inner.pending.insert(slot, request);
                false
            }
        };
        self.notify.notify_one();
        Ok(coalesced)
    }

    fn pop(&self) -> Option<CorrelationRequest> {
        let mut inner = self.inner.lock();
        let slot = inner.order.pop_front()?;
        inner.pending.remove(&slot)
    }

    fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Stop accepting submissions; queued requests stay for draining
    fn close(&self) {
        self.inner.lock().accepting = false;
    }

    /// Remove and return everything still queued
    fn drain(&self) -> Vec<CorrelationRequest> {
        let mut inner = self.inner.lock();
        let slots: Vec<RequestSlot> = inner.order.drain(..).collect();
        slots
            .into_iter()
            .filter_map(|slot| inner.pending.remove(&slot))
            .collect()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }

    fn wake_one(&self) {
        self.notify.notify_one();
    }
}

/// Token-bucket rate limiter for outbound requests.
///
/// Burst capacity equals one second of tokens. Uses the tokio clock so it
/// cooperates with paused-time tests.
struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(requests_per_second: u32) -> Self {
        let burst = f64::from(requests_per_second.max(1));
        Self {
            rate: burst,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
                }
            };
            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    coalesced: AtomicU64,
    sent: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    in_flight: AtomicU64,
}

/// Client dispatch statistics
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    /// Requests accepted by `submit`
    pub submitted: u64,
    /// Requests that coalesced into an already-queued slot
    pub coalesced: u64,
    /// Requests delivered successfully
    pub sent: u64,
    /// Retry attempts made for transient failures
    pub retried: u64,
    /// Requests dropped because the queue was full
    pub dropped: u64,
    /// Requests rejected permanently or with retries exhausted
    pub rejected: u64,
    /// Requests cancelled during shutdown
    pub cancelled: u64,
    /// Requests currently being dispatched
    pub in_flight: u64,
    /// Requests currently queued
    pub queued: usize,
}

/// Asynchronous dispatcher for correlation requests
pub struct CorrelationClient {
    queue: Arc<DispatchQueue>,
    cache: Arc<CorrelationCache>,
    counters: Arc<Counters>,
    shutdown_tx: broadcast::Sender<()>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

impl CorrelationClient {
    /// Create the client and spawn its dispatch workers.
    ///
    /// Must be called from within a tokio runtime. Terminal request
    /// outcomes are fed back into `cache` to clear dirty flags.
    pub fn start(
        config: &CorrelationConfig,
        transport: Arc<dyn CorrelationTransport>,
        cache: Arc<CorrelationCache>,
    ) -> Arc<Self> {
        let queue = Arc::new(DispatchQueue::new(config.max_queue_size));
        let limiter = Arc::new(RateLimiter::new(config.requests_per_second));
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut workers = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let worker = Worker {
                id,
                queue: queue.clone(),
                transport: transport.clone(),
                cache: cache.clone(),
                limiter: limiter.clone(),
                counters: counters.clone(),
                max_retries: config.max_retries,
                backoff_base: config.retry_backoff(),
                backoff_max: config.retry_backoff_max(),
                shutdown_rx: shutdown_tx.subscribe(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        info!(workers = config.worker_count, "correlation client started");

        Arc::new(Self {
            queue,
            cache,
            counters,
            shutdown_tx,
            workers: tokio::sync::Mutex::new(workers),
            shutdown_started: AtomicBool::new(false),
        })
    }

    /// Enqueue a correlation request for asynchronous dispatch.
    ///
    /// Never blocks. A full queue drops the update and returns
    /// [`CorrelationError::QueueFull`]; after shutdown has begun submissions
    /// are rejected with [`CorrelationError::ShuttingDown`].
    pub fn submit(&self, request: CorrelationRequest) -> CorrelationResult<()> {
        match self.queue.push(request) {
            Ok(coalesced) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                if coalesced {
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(CorrelationError::QueueFull) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("correlation queue full, dropping update");
                Err(CorrelationError::QueueFull)
            }
            Err(e) => Err(e),
        }
    }

    /// Current dispatch statistics
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            queued: self.queue.len(),
        }
    }

    /// Stop accepting submissions, flush queued requests until `deadline`,
    /// cancel whatever is left, and wait for the workers to exit.
    ///
    /// Idempotent: a second call returns `Ok` without further work. Returns
    /// [`CorrelationError::ShutdownTimeout`] when requests had to be
    /// cancelled.
    pub async fn shutdown(&self, deadline: Duration) -> CorrelationResult<()> {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("correlation client shutting down");
        self.queue.close();

        let drained = tokio::time::timeout(deadline, self.wait_drained())
            .await
            .is_ok();

        // Signal the workers; anything they have in flight past this point
        // is cancelled, not confirmed.
        let _ = self.shutdown_tx.send(());

        for request in self.queue.drain() {
            self.cache.confirm(&request.key, false);
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }

        let mut workers = self.workers.lock().await;
        for mut handle in workers.drain(..) {
            if tokio::time::timeout(WORKER_JOIN_GRACE, &mut handle)
                .await
                .is_err()
            {
                warn!("dispatch worker did not stop in time, aborting");
                handle.abort();
            }
        }

        let cancelled = self.counters.cancelled.load(Ordering::Relaxed);
        if drained && cancelled == 0 {
            info!("correlation client stopped cleanly");
            Ok(())
        } else {
            warn!(cancelled, "correlation client stopped with cancelled requests");
            Err(CorrelationError::ShutdownTimeout { cancelled })
        }
    }

    async fn wait_drained(&self) {
        loop {
            if self.queue.len() == 0 && self.counters.in_flight.load(Ordering::Relaxed) == 0 {
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

/// One dispatch worker: pop → rate limit → send → retry → confirm
struct Worker {
    id: usize,
    queue: Arc<DispatchQueue>,
    transport: Arc<dyn CorrelationTransport>,
    cache: Arc<CorrelationCache>,
    limiter: Arc<RateLimiter>,
    counters: Arc<Counters>,
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker = self.id, "dispatch worker started");
        loop {
            let Some(request) = self.next_request().await else {
                break;
            };
            self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
            let interrupted = self.dispatch(&request).await;
            self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
            if interrupted {
                break;
            }
        }
        debug!(worker = self.id, "dispatch worker stopped");
    }

    async fn next_request(&mut self) -> Option<CorrelationRequest> {
        loop {
            if let Some(request) = self.queue.pop() {
                // Cascade the wakeup: one Notify permit may cover several
                // queued requests, so pass it on while work remains.
                if self.queue.len() > 0 {
                    self.queue.wake_one();
                }
                return Some(request);
            }
            tokio::select! {
                _ = self.queue.wait() => {}
                _ = self.shutdown_rx.recv() => return None,
            }
        }
    }

    /// Dispatch one request to terminal outcome. Returns `true` if the
    /// shutdown signal interrupted it.
    async fn dispatch(&mut self, request: &CorrelationRequest) -> bool {
        let mut attempts: u32 = 0;
        loop {
            tokio::select! {
                _ = self.limiter.acquire() => {}
                _ = self.shutdown_rx.recv() => return self.cancel(request),
            }

            let outcome = tokio::select! {
                outcome = self.transport.send(request) => outcome,
                _ = self.shutdown_rx.recv() => return self.cancel(request),
            };

            match outcome {
                Ok(()) => {
                    self.cache.confirm(&request.key, true);
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        key = %request.key,
                        association = %request.association,
                        op = ?request.op,
                        "correlation update sent"
                    );
                    return false;
                }
                Err(e) if e.is_retryable() && attempts < self.max_retries => {
                    attempts += 1;
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    let backoff = self
                        .backoff_base
                        .saturating_mul(1 << (attempts - 1).min(16))
                        .min(self.backoff_max);
                    warn!(
                        key = %request.key,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient correlation failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown_rx.recv() => return self.cancel(request),
                    }
                }
                Err(e) => {
                    self.cache.confirm(&request.key, false);
                    if request.op == CorrelationOp::Associate {
                        // Let the next observation submit it fresh instead of
                        // waiting out the staleness window.
                        self.cache.forget(&request.key, &request.association);
                    }
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    error!(
                        key = %request.key,
                        association = %request.association,
                        error = %e,
                        "correlation update failed"
                    );
                    return false;
                }
            }
        }
    }

    fn cancel(&self, request: &CorrelationRequest) -> bool {
        self.cache.confirm(&request.key, false);
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        warn!(key = %request.key, "correlation update cancelled by shutdown");
        true
    }
}
