//! Change detection for reconciliation.
//!
//! Pure set differences between the observed universe for one period and
//! the persisted mapping state. Exclusions are applied before results
//! surface so that deliberately ignored names never prompt anyone.

use crate::models::{BillingPeriod, ChangeReport, MappingState, PatternType};
use crate::services::exclusions::ExclusionFilter;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Entities observed this period that the store has never seen.
pub fn new_entities(
    observed: &BTreeSet<String>,
    state: &MappingState,
    filter: &ExclusionFilter,
) -> Vec<String> {
    observed
        .difference(&state.known_entities)
        .filter(|name| !filter.is_excluded(name, PatternType::Entity))
        .cloned()
        .collect()
}

/// Entities billable in the preceding period but absent from this one.
pub fn missing_entities(observed: &BTreeSet<String>, state: &MappingState) -> Vec<String> {
    state
        .previous_billable_entities
        .difference(observed)
        .cloned()
        .collect()
}

/// Inactive entities that showed up in this period's observations.
pub fn reappearing_entities(
    observed: &BTreeSet<String>,
    state: &MappingState,
    filter: &ExclusionFilter,
) -> Vec<String> {
    state
        .inactive_entities
        .intersection(observed)
        .filter(|name| !filter.is_excluded(name, PatternType::Entity))
        .cloned()
        .collect()
}

/// Observed service classes with no active mapping.
pub fn new_service_classes(
    observed: &BTreeSet<String>,
    state: &MappingState,
    filter: &ExclusionFilter,
) -> Vec<String> {
    observed
        .difference(&state.mapped_service_classes)
        .filter(|name| !filter.is_excluded(name, PatternType::ServiceClass))
        .cloned()
        .collect()
}

/// Active mappings whose service class no longer appears in observations -
/// candidates for deactivation.
pub fn obsolete_service_class_mappings(
    observed: &BTreeSet<String>,
    state: &MappingState,
) -> Vec<String> {
    state
        .active_mappings
        .iter()
        .filter(|mapping| !observed.contains(&mapping.service_class))
        .map(|mapping| mapping.service_class.clone())
        .collect()
}

/// Active mappings whose accounting item is gone or inactive upstream.
///
/// `known_items` maps item id to its upstream active flag; `None` skips
/// the check entirely (the accounting collaborator is optional here).
pub fn invalid_item_mappings(
    state: &MappingState,
    known_items: Option<&BTreeMap<String, bool>>,
) -> Vec<String> {
    let Some(items) = known_items else {
        return Vec::new();
    };

    state
        .active_mappings
        .iter()
        .filter(|mapping| !items.get(&mapping.item_id).copied().unwrap_or(false))
        .map(|mapping| mapping.service_class.clone())
        .collect()
}

/// Run every detection and compose the result bundle for the period.
///
/// `needs_attention` is the sole signal the surrounding workflow uses to
/// decide whether manual reconciliation must run before invoicing.
pub fn detect_all_changes(
    period: BillingPeriod,
    observed_entities: &BTreeSet<String>,
    observed_classes: &BTreeSet<String>,
    state: &MappingState,
    filter: &ExclusionFilter,
    known_items: Option<&BTreeMap<String, bool>>,
) -> ChangeReport {
    let new_entities = new_entities(observed_entities, state, filter);
    let missing_entities = missing_entities(observed_entities, state);
    let reappearing_entities = reappearing_entities(observed_entities, state, filter);
    let new_service_classes = new_service_classes(observed_classes, state, filter);
    let obsolete_service_class_mappings =
        obsolete_service_class_mappings(observed_classes, state);
    let invalid_item_mappings = invalid_item_mappings(state, known_items);

    let needs_attention = !new_entities.is_empty()
        || !new_service_classes.is_empty()
        || !reappearing_entities.is_empty()
        || !obsolete_service_class_mappings.is_empty()
        || !invalid_item_mappings.is_empty();

    info!(
        %period,
        new_entities = new_entities.len(),
        missing_entities = missing_entities.len(),
        reappearing_entities = reappearing_entities.len(),
        new_service_classes = new_service_classes.len(),
        obsolete_mappings = obsolete_service_class_mappings.len(),
        invalid_item_mappings = invalid_item_mappings.len(),
        needs_attention,
        "Change detection complete"
    );

    ChangeReport {
        period,
        new_entities,
        missing_entities,
        reappearing_entities,
        new_service_classes,
        obsolete_service_class_mappings,
        invalid_item_mappings,
        needs_attention,
    }
}
