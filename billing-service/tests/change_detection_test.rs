//! Change detection scenarios over aggregated usage.

mod common;

use billing_service::models::{
    BillingPeriod, ExclusionPattern, MappingState, PatternType, ServiceClassMapping,
};
use billing_service::services::{detector, highwater, ExclusionFilter};
use billing_service::models::UsageReport;
use chrono::{TimeZone, Utc};
use common::init_tracing;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use uuid::Uuid;

fn report(entity: &str, class: &str, count: i32, day: u32) -> UsageReport {
    UsageReport {
        entity_name: entity.to_string(),
        class_counts: BTreeMap::from([(class.to_string(), count)]),
        observed_at: Utc.with_ymd_and_hms(2025, 10, day, 6, 0, 0).unwrap(),
    }
}

fn mapping(service_class: &str, item_id: &str) -> ServiceClassMapping {
    ServiceClassMapping {
        mapping_id: Uuid::new_v4(),
        service_class: service_class.to_string(),
        item_id: item_id.to_string(),
        item_name: format!("Item {}", item_id),
        unit_price: Decimal::new(500, 2),
        quota_gb: None,
        description: None,
        is_active: true,
        created_utc: Utc::now(),
        updated_utc: Utc::now(),
    }
}

fn exclusion(pattern_type: PatternType, glob: &str) -> ExclusionPattern {
    ExclusionPattern {
        exclusion_id: Uuid::new_v4(),
        pattern_type: pattern_type.as_str().to_string(),
        pattern: glob.to_string(),
        reason: Some("deliberately ignored".to_string()),
        is_active: true,
        created_utc: Utc::now(),
    }
}

fn period() -> BillingPeriod {
    BillingPeriod::new(2025, 10).unwrap()
}

#[test]
fn test_new_service_class_surfaces_until_mapped() {
    init_tracing();

    let reports = vec![report("mail.acme.com", "foo-50gb", 12, 7)];
    let marks = highwater::aggregate(&reports);
    let (observed_entities, observed_classes) = highwater::observed_sets(&marks);

    let mut state = MappingState::default();
    state.known_entities.insert("mail.acme.com".to_string());

    let first_pass = detector::detect_all_changes(
        period(),
        &observed_entities,
        &observed_classes,
        &state,
        &ExclusionFilter::default(),
        None,
    );
    assert_eq!(first_pass.new_service_classes, vec!["foo-50gb".to_string()]);
    assert!(first_pass.needs_attention);

    // Mapping the class to an item resolves it on the next pass.
    let resolved = mapping("foo-50gb", "svc-foo");
    state
        .mapped_service_classes
        .insert(resolved.service_class.clone());
    state.active_mappings.push(resolved);

    let second_pass = detector::detect_all_changes(
        period(),
        &observed_entities,
        &observed_classes,
        &state,
        &ExclusionFilter::default(),
        None,
    );
    assert!(second_pass.new_service_classes.is_empty());
    assert!(!second_pass.needs_attention);
}

#[test]
fn test_excluded_entity_is_not_billable_and_never_prompts() {
    init_tracing();

    let reports = vec![
        report("keep.acme.com", "customer-50gb", 5, 7),
        report("scratch.test", "customer-50gb", 3, 7),
    ];
    let marks = highwater::aggregate(&reports);

    let filter = ExclusionFilter::from_patterns(&[exclusion(PatternType::Entity, "*.test")]);

    // Exclusions drop the pair before persistence-as-billable.
    let billable = highwater::retain_unexcluded(marks.clone(), &filter);
    assert!(billable.contains_key(&("keep.acme.com".to_string(), "customer-50gb".to_string())));
    assert!(!billable.contains_key(&("scratch.test".to_string(), "customer-50gb".to_string())));

    // And the excluded entity never surfaces in reconciliation.
    let (observed_entities, observed_classes) = highwater::observed_sets(&marks);
    let mut state = MappingState::default();
    let resolved = mapping("customer-50gb", "item-50");
    state
        .mapped_service_classes
        .insert(resolved.service_class.clone());
    state.active_mappings.push(resolved);

    let changes = detector::detect_all_changes(
        period(),
        &observed_entities,
        &observed_classes,
        &state,
        &filter,
        None,
    );
    assert_eq!(changes.new_entities, vec!["keep.acme.com".to_string()]);
}

#[test]
fn test_wildcard_entity_exclusion_suppresses_all_billing() {
    init_tracing();

    let reports = vec![
        report("a.example.com", "customer-50gb", 5, 7),
        report("a.example.com", "customer-20gb", 2, 7),
    ];
    let marks = highwater::aggregate(&reports);

    let filter = ExclusionFilter::from_patterns(&[exclusion(PatternType::Entity, "*")]);

    // Pattern `*` for type entity: nothing is billable regardless of
    // mapping state.
    for (entity, class) in marks.keys() {
        assert!(!filter.is_billable(entity, class));
    }
    assert!(highwater::retain_unexcluded(marks, &filter).is_empty());
}

#[test]
fn test_missing_entity_reported_from_previous_period_state() {
    init_tracing();

    let reports = vec![report("stays.acme.com", "customer-50gb", 5, 7)];
    let marks = highwater::aggregate(&reports);
    let (observed_entities, observed_classes) = highwater::observed_sets(&marks);

    let mut state = MappingState::default();
    state.known_entities.insert("stays.acme.com".to_string());
    state.known_entities.insert("gone.acme.com".to_string());
    state
        .previous_billable_entities
        .insert("stays.acme.com".to_string());
    state
        .previous_billable_entities
        .insert("gone.acme.com".to_string());
    let resolved = mapping("customer-50gb", "item-50");
    state
        .mapped_service_classes
        .insert(resolved.service_class.clone());
    state.active_mappings.push(resolved);

    let changes = detector::detect_all_changes(
        period(),
        &observed_entities,
        &observed_classes,
        &state,
        &ExclusionFilter::default(),
        None,
    );

    assert_eq!(changes.missing_entities, vec!["gone.acme.com".to_string()]);
    // Missing entities alone do not force manual reconciliation.
    assert!(!changes.needs_attention);
}
