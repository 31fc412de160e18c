//! Registry of clinical bundles that passed validation.
//!
//! Claims may only reference bundles recorded here. Bundles are keyed by their
//! content-derived id, so registering the same content twice is a no-op.

use crate::clock::Clock;
use crate::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fhir::{normalize, BundleId, BundleValidator, CanonicalBundle};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegisteredBundle {
    pub canonical: CanonicalBundle,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct BundleRegistry {
    validator: Arc<BundleValidator>,
    bundles: DashMap<BundleId, RegisteredBundle>,
    clock: Arc<dyn Clock>,
}

impl BundleRegistry {
    pub fn new(validator: Arc<BundleValidator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            validator,
            bundles: DashMap::new(),
            clock,
        }
    }

    pub fn validator(&self) -> &Arc<BundleValidator> {
        &self.validator
    }

    /// Validates `bundle`, normalises it and records it as usable by claims.
    ///
    /// # Errors
    ///
    /// [`GatewayError::BundleValidationFailed`] with every violation found.
    pub fn validate_and_register(&self, bundle: &Value) -> GatewayResult<CanonicalBundle> {
        let validated = self
            .validator
            .validate(bundle)
            .map_err(GatewayError::BundleValidationFailed)?;
        let canonical = normalize(&validated);

        let entry = self
            .bundles
            .entry(canonical.bundle_id)
            .or_insert_with(|| RegisteredBundle {
                canonical: canonical.clone(),
                registered_at: self.clock.now(),
            });
        tracing::info!(
            bundle_id = %canonical.bundle_id,
            bundle_type = canonical.bundle_type.as_str(),
            sha256 = %canonical.sha256,
            registered_at = %entry.registered_at,
            "bundle registered"
        );
        Ok(canonical)
    }

    pub fn contains(&self, bundle_id: BundleId) -> bool {
        self.bundles.contains_key(&bundle_id)
    }

    pub fn get(&self, bundle_id: BundleId) -> Option<RegisteredBundle> {
        self.bundles.get(&bundle_id).map(|b| b.clone())
    }

    /// The ids in `bundle_ids` that are not registered, in input order.
    pub fn missing(&self, bundle_ids: &[BundleId]) -> Vec<BundleId> {
        bundle_ids
            .iter()
            .copied()
            .filter(|id| !self.contains(*id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}
