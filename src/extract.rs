//! Dimension extraction from resource attributes
//!
//! Pure functions: given one resource's attribute map, derive the identity
//! signals the tracker correlates — infrastructure dimensions plus the
//! service and environment names the resource reports.

use crate::types::{AttributeValue, DimensionKey};
use std::collections::HashMap;

/// Attribute carrying the service name
pub const SERVICE_NAME_ATTR: &str = "service.name";

/// Attribute carrying the deployment environment name
pub const ENVIRONMENT_ATTR: &str = "deployment.environment";

/// Service name used when a resource reports none
pub const FALLBACK_SERVICE: &str = "unknown";

/// Identity signals extracted from one resource
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceIdentity {
    /// Dimensions found via the configured sync attributes
    pub dimensions: Vec<DimensionKey>,

    /// Service name, if the resource reported one
    pub service: Option<String>,

    /// Environment name, if the resource reported one
    pub environment: Option<String>,
}

impl ResourceIdentity {
    /// Whether any dimension was found
    pub fn has_dimensions(&self) -> bool {
        !self.dimensions.is_empty()
    }

    /// Service name to correlate, falling back to [`FALLBACK_SERVICE`].
    ///
    /// A host with no declared service is still worth correlating so the
    /// backend knows the host is active.
    pub fn service_or_fallback(&self) -> &str {
        self.service.as_deref().unwrap_or(FALLBACK_SERVICE)
    }
}

/// Extract identity signals from one resource attribute map.
///
/// `sync_attributes` maps attribute names to the dimension name they
/// populate (e.g. `host.name` → `host`). Attributes absent from the map or
/// carrying non-identity values (floats, booleans, empty strings) are
/// ignored. Dimensions are returned in a stable order sorted by name.
pub fn extract_identity(
    attributes: &HashMap<String, AttributeValue>,
    sync_attributes: &HashMap<String, String>,
) -> ResourceIdentity {
    let mut dimensions: Vec<DimensionKey> = sync_attributes
        .iter()
        .filter_map(|(attr, dimension)| {
            let value = attributes.get(attr)?.as_dimension_value()?;
            Some(DimensionKey::new(dimension.clone(), value))
        })
        .collect();
    dimensions.sort_by(|a, b| a.name.cmp(&b.name));

    ResourceIdentity {
        dimensions,
        service: string_attribute(attributes, SERVICE_NAME_ATTR),
        environment: string_attribute(attributes, ENVIRONMENT_ATTR),
    }
}

fn string_attribute(
    attributes: &HashMap<String, AttributeValue>,
    name: &str,
) -> Option<String> {
    match attributes.get(name) {
        Some(AttributeValue::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
