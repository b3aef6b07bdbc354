//! Highwater aggregation properties over realistic report sets.

mod common;

use billing_service::models::UsageReport;
use billing_service::services::highwater;
use chrono::{TimeZone, Utc};
use common::init_tracing;

fn report(entity: &str, counts: &[(&str, i32)], day: u32) -> UsageReport {
    UsageReport {
        entity_name: entity.to_string(),
        class_counts: counts
            .iter()
            .map(|(class, count)| (class.to_string(), *count))
            .collect(),
        observed_at: Utc.with_ymd_and_hms(2025, 10, day, 6, 0, 0).unwrap(),
    }
}

#[test]
fn test_highwater_equals_true_maximum() {
    init_tracing();

    let reports = vec![
        report("a.example.com", &[("svc1", 10)], 1),
        report("a.example.com", &[("svc1", 7)], 8),
        report("a.example.com", &[("svc1", 15)], 15),
    ];

    let marks = highwater::aggregate(&reports);
    assert_eq!(
        marks[&("a.example.com".to_string(), "svc1".to_string())].count,
        15
    );
}

#[test]
fn test_rerun_with_identical_input_is_identical() {
    init_tracing();

    let reports = vec![
        report("a.example.com", &[("customer-50gb", 10), ("customer-20gb", 2)], 1),
        report("b.example.com", &[("customer-50gb", 4)], 8),
        report("a.example.com", &[("customer-50gb", 9)], 15),
        report("b.example.com", &[("customer-50gb", 6)], 22),
    ];

    let first = highwater::aggregate(&reports);
    let second = highwater::aggregate(&reports);
    assert_eq!(first, second);
}

#[test]
fn test_aggregation_order_invariance_across_permutations() {
    init_tracing();

    let reports = vec![
        report("a.example.com", &[("svc1", 3)], 1),
        report("a.example.com", &[("svc1", 11)], 8),
        report("b.example.com", &[("svc1", 7), ("svc2", 2)], 8),
        report("b.example.com", &[("svc2", 5)], 15),
    ];

    let reference = highwater::aggregate(&reports);

    let mut rotated = reports.clone();
    rotated.rotate_left(1);
    assert_eq!(highwater::aggregate(&rotated), reference);

    let mut reversed = reports;
    reversed.reverse();
    assert_eq!(highwater::aggregate(&reversed), reference);
}

#[test]
fn test_entity_and_class_views_are_consistent() {
    init_tracing();

    let reports = vec![
        report("a.example.com", &[("svc1", 10), ("svc2", 4)], 1),
        report("b.example.com", &[("svc1", 6)], 1),
    ];

    let marks = highwater::aggregate(&reports);
    let by_entity = highwater::aggregate_by_entity(&marks);
    let by_class = highwater::aggregate_by_class(&marks);

    let entity_total: i64 = by_entity
        .values()
        .flat_map(|classes| classes.values())
        .map(|count| i64::from(*count))
        .sum();
    let class_total: i64 = by_class.values().sum();

    assert_eq!(entity_total, class_total);
    assert_eq!(highwater::summary(&marks).total_accounts, class_total);
}

#[test]
fn test_month_over_month_diff_against_prior_period() {
    init_tracing();

    let september = highwater::aggregate(&[
        report("a.example.com", &[("svc1", 10)], 1),
        report("b.example.com", &[("svc1", 4)], 1),
    ]);
    let october = highwater::aggregate(&[
        report("a.example.com", &[("svc1", 13)], 1),
        report("c.example.com", &[("svc1", 2)], 1),
    ]);

    let diff = highwater::compare_periods(&october, &september);

    assert_eq!(diff.increased.len(), 1);
    assert_eq!(diff.new.len(), 1);
    assert_eq!(diff.removed.len(), 1);
    assert!(diff.decreased.is_empty());

    let empty = highwater::HighwaterMap::new();
    let against_empty = highwater::compare_periods(&october, &empty);
    assert_eq!(against_empty.new.len(), 2);
    assert!(against_empty.removed.is_empty());
}
