//! Change detection results and mapping state snapshots.

use crate::models::{BillingPeriod, ServiceClassMapping};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Persisted mapping state loaded for one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct MappingState {
    /// Every entity name the store knows about, active or not.
    pub known_entities: BTreeSet<String>,
    /// Entity names currently marked inactive.
    pub inactive_entities: BTreeSet<String>,
    /// Entity names with billable highwater marks in the preceding period.
    pub previous_billable_entities: BTreeSet<String>,
    /// Service class names with an active mapping.
    pub mapped_service_classes: BTreeSet<String>,
    /// All active service class mappings.
    pub active_mappings: Vec<ServiceClassMapping>,
}

/// Everything one reconciliation pass surfaced for the period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeReport {
    pub period: BillingPeriod,
    pub new_entities: Vec<String>,
    pub missing_entities: Vec<String>,
    pub reappearing_entities: Vec<String>,
    pub new_service_classes: Vec<String>,
    pub obsolete_service_class_mappings: Vec<String>,
    pub invalid_item_mappings: Vec<String>,
    /// True when any category above (except `missing_entities`) is
    /// non-empty; the sole signal gating invoice generation.
    pub needs_attention: bool,
}

/// Advisory data-quality issues surfaced by mapping validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingIssues {
    pub entities_with_inactive_customer: Vec<String>,
    pub mappings_with_nonpositive_price: Vec<String>,
}

impl MappingIssues {
    pub fn is_empty(&self) -> bool {
        self.entities_with_inactive_customer.is_empty()
            && self.mappings_with_nonpositive_price.is_empty()
    }
}
