//! Trace-to-infrastructure correlation for telemetry export pipelines
//!
//! Associates the infrastructure dimensions found in trace resource
//! attributes (host, and whatever else `sync_attributes` maps) with the
//! services and environments producing those traces, and keeps a backend
//! correlation API in sync:
//!
//! - **Extract**: pure derivation of dimension keys from resource attributes
//! - **Cache**: bounded, deduplicating record of what the backend already
//!   knows, with staleness-driven re-confirmation and TTL eviction
//! - **Client**: asynchronous dispatch with coalescing, rate limiting,
//!   retry with backoff and graceful shutdown
//! - **Tracker**: the pipeline-facing entry point owning the above
//!
//! Correlation is best-effort: no failure here propagates into the span
//! export path.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod extract;
pub mod tracker;
pub mod types;

// Re-export commonly used types
pub use cache::CorrelationCache;
pub use client::http::HttpTransport;
pub use client::{ClientStats, CorrelationClient, CorrelationTransport};
pub use config::CorrelationConfig;
pub use error::{CorrelationError, CorrelationResult};
pub use extract::{extract_identity, ResourceIdentity};
pub use tracker::{Tracker, TrackerState};
pub use types::{
    Association, AttributeValue, CorrelationOp, CorrelationRequest, DimensionKey, Resource,
    TraceBatch,
};
