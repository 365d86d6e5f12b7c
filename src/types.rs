//! Core types for trace-to-infrastructure correlation
//!
//! The tracker consumes [`TraceBatch`] values produced by the surrounding
//! export pipeline and turns them into [`CorrelationRequest`]s for the
//! backend correlation API. Only resource attributes are read from a batch;
//! span payloads are opaque to this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A batch of spans grouped by the resource that produced them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceBatch {
    /// Resource-scoped span groups; one entry per distinct resource
    pub resources: Vec<Resource>,
}

impl TraceBatch {
    /// Whether the batch carries no resources at all
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// One resource within a trace batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resource {
    /// Attribute mapping attached to the resource
    pub attributes: HashMap<String, AttributeValue>,
}

/// A resource attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// String value
    String(String),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Boolean value
    Bool(bool),
}

impl AttributeValue {
    /// Render the value as a dimension-usable string.
    ///
    /// Only strings and integers identify infrastructure; floats and
    /// booleans are not valid dimension values and yield `None`.
    pub fn as_dimension_value(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) if !s.is_empty() => Some(s.clone()),
            AttributeValue::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }
}

/// Identifies one correlation cache entry: a (dimension name, value) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionKey {
    /// Dimension name, e.g. `host`
    pub name: String,
    /// Dimension value, e.g. `localhost`
    pub value: String,
}

impl DimensionKey {
    /// Create a new dimension key
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// The APM entity a dimension is correlated with
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Association {
    /// A service name
    Service(String),
    /// An environment name
    Environment(String),
}

impl Association {
    /// Association kind as it appears in the backend API path
    pub fn kind(&self) -> &'static str {
        match self {
            Association::Service(_) => "service",
            Association::Environment(_) => "environment",
        }
    }

    /// The associated service or environment name
    pub fn value(&self) -> &str {
        match self {
            Association::Service(v) => v,
            Association::Environment(v) => v,
        }
    }
}

impl fmt::Display for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind(), self.value())
    }
}

/// Operation carried by a correlation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationOp {
    /// Assert the association
    Associate,
    /// Retract the association
    Disassociate,
}

/// A single correlation update bound for the backend API.
///
/// Transient: dropped after terminal success, permanent rejection, or
/// retry exhaustion. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRequest {
    /// Operation to perform
    pub op: CorrelationOp,
    /// Dimension the association applies to
    pub key: DimensionKey,
    /// Service or environment being (dis)associated
    pub association: Association,
    /// When the request was created
    pub created_at: DateTime<Utc>,
}

impl CorrelationRequest {
    /// Build an associate request for the given key and association
    pub fn associate(key: DimensionKey, association: Association) -> Self {
        Self {
            op: CorrelationOp::Associate,
            key,
            association,
            created_at: Utc::now(),
        }
    }

    /// Build a disassociate request for the given key and association
    pub fn disassociate(key: DimensionKey, association: Association) -> Self {
        Self {
            op: CorrelationOp::Disassociate,
            key,
            association,
            created_at: Utc::now(),
        }
    }
}
