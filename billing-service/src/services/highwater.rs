//! Monthly highwater aggregation over usage reports.
//!
//! Pure functions over in-memory data; no I/O. Re-running with identical
//! input yields identical output regardless of report order.

use crate::models::UsageReport;
use crate::services::exclusions::ExclusionFilter;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Aggregated maximum for one (entity, service class) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HighwaterEntry {
    /// Maximum count observed in the period.
    pub count: i32,
    /// Earliest observation at which the maximum was reached.
    pub peak_at: DateTime<Utc>,
    /// Every observation timestamp that contributed to this pair.
    pub observed_at: Vec<DateTime<Utc>>,
}

/// Highwater entries keyed by (entity name, service class).
pub type HighwaterMap = BTreeMap<(String, String), HighwaterEntry>;

/// Reduce usage reports to the maximum count per (entity, service class).
///
/// Reports with an empty entity name are skipped with a warning. Ties keep
/// the earliest observation that reached the maximum.
pub fn aggregate(reports: &[UsageReport]) -> HighwaterMap {
    let mut marks = HighwaterMap::new();

    for report in reports {
        if report.entity_name.is_empty() {
            warn!("Usage report missing entity name, skipping");
            continue;
        }

        for (service_class, &count) in &report.class_counts {
            let key = (report.entity_name.clone(), service_class.clone());
            let entry = marks.entry(key).or_insert_with(|| HighwaterEntry {
                count,
                peak_at: report.observed_at,
                observed_at: Vec::new(),
            });

            entry.observed_at.push(report.observed_at);

            if count > entry.count || (count == entry.count && report.observed_at < entry.peak_at)
            {
                entry.count = count;
                entry.peak_at = report.observed_at;
            }
        }
    }

    for entry in marks.values_mut() {
        entry.observed_at.sort_unstable();
    }

    info!(pairs = marks.len(), "Calculated highwater marks");
    marks
}

/// Aggregate highwater data by entity: entity -> service class -> count.
pub fn aggregate_by_entity(marks: &HighwaterMap) -> BTreeMap<String, BTreeMap<String, i32>> {
    let mut result: BTreeMap<String, BTreeMap<String, i32>> = BTreeMap::new();

    for ((entity, service_class), entry) in marks {
        result
            .entry(entity.clone())
            .or_default()
            .insert(service_class.clone(), entry.count);
    }

    result
}

/// Aggregate highwater data by service class, summed across entities.
pub fn aggregate_by_class(marks: &HighwaterMap) -> BTreeMap<String, i64> {
    let mut result: BTreeMap<String, i64> = BTreeMap::new();

    for ((_, service_class), entry) in marks {
        *result.entry(service_class.clone()).or_default() += i64::from(entry.count);
    }

    result
}

/// Summary statistics over a highwater map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub entity_count: usize,
    pub class_count: usize,
    pub total_accounts: i64,
    pub pair_count: usize,
}

pub fn summary(marks: &HighwaterMap) -> UsageSummary {
    let mut entities = BTreeSet::new();
    let mut classes = BTreeSet::new();
    let mut total_accounts = 0i64;

    for ((entity, service_class), entry) in marks {
        entities.insert(entity);
        classes.insert(service_class);
        total_accounts += i64::from(entry.count);
    }

    UsageSummary {
        entity_count: entities.len(),
        class_count: classes.len(),
        total_accounts,
        pair_count: marks.len(),
    }
}

/// Month-over-month comparison of two highwater maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeriodDiff {
    pub new: Vec<(String, String, i32)>,
    pub removed: Vec<(String, String)>,
    pub increased: Vec<(String, String, i32, i32)>,
    pub decreased: Vec<(String, String, i32, i32)>,
    pub unchanged: Vec<(String, String, i32)>,
}

/// Compare the current period's aggregate against a prior period's,
/// surfacing new, removed, and changed (entity, service class) pairs.
pub fn compare_periods(current: &HighwaterMap, previous: &HighwaterMap) -> PeriodDiff {
    let mut diff = PeriodDiff::default();

    for ((entity, service_class), entry) in current {
        match previous.get(&(entity.clone(), service_class.clone())) {
            None => diff
                .new
                .push((entity.clone(), service_class.clone(), entry.count)),
            Some(prior) if entry.count > prior.count => diff.increased.push((
                entity.clone(),
                service_class.clone(),
                prior.count,
                entry.count,
            )),
            Some(prior) if entry.count < prior.count => diff.decreased.push((
                entity.clone(),
                service_class.clone(),
                prior.count,
                entry.count,
            )),
            Some(_) => diff
                .unchanged
                .push((entity.clone(), service_class.clone(), entry.count)),
        }
    }

    for key in previous.keys() {
        if !current.contains_key(key) {
            diff.removed.push(key.clone());
        }
    }

    diff
}

/// Distinct entity and service class names present in a highwater map.
pub fn observed_sets(marks: &HighwaterMap) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut entities = BTreeSet::new();
    let mut classes = BTreeSet::new();

    for (entity, service_class) in marks.keys() {
        entities.insert(entity.clone());
        classes.insert(service_class.clone());
    }

    (entities, classes)
}

/// Drop pairs whose entity or service class matches an active exclusion.
pub fn retain_unexcluded(marks: HighwaterMap, filter: &ExclusionFilter) -> HighwaterMap {
    let before = marks.len();
    let filtered: HighwaterMap = marks
        .into_iter()
        .filter(|((entity, service_class), _)| filter.is_billable(entity, service_class))
        .collect();

    if filtered.len() < before {
        info!(
            excluded = before - filtered.len(),
            "Filtered highwater entries by exclusion patterns"
        );
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

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

    fn key(entity: &str, class: &str) -> (String, String) {
        (entity.to_string(), class.to_string())
    }

    #[test]
    fn test_aggregate_takes_maximum() {
        let reports = vec![
            report("a.example.com", &[("svc1", 10)], 1),
            report("a.example.com", &[("svc1", 7)], 8),
            report("a.example.com", &[("svc1", 15)], 15),
        ];

        let marks = aggregate(&reports);
        let entry = &marks[&key("a.example.com", "svc1")];
        assert_eq!(entry.count, 15);
        assert_eq!(entry.observed_at.len(), 3);
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let mut reports = vec![
            report("a.example.com", &[("svc1", 10)], 1),
            report("a.example.com", &[("svc1", 7)], 8),
            report("a.example.com", &[("svc1", 15)], 15),
        ];

        let forward = aggregate(&reports);
        reports.reverse();
        let backward = aggregate(&reports);

        assert_eq!(forward, backward);
    }

    #[test]
    fn test_tie_keeps_earliest_peak() {
        let reports = vec![
            report("a.example.com", &[("svc1", 12)], 22),
            report("a.example.com", &[("svc1", 12)], 8),
        ];

        let marks = aggregate(&reports);
        let entry = &marks[&key("a.example.com", "svc1")];
        assert_eq!(entry.count, 12);
        assert_eq!(
            entry.peak_at,
            Utc.with_ymd_and_hms(2025, 10, 8, 6, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_skips_reports_without_entity_name() {
        let reports = vec![report("", &[("svc1", 10)], 1)];
        assert!(aggregate(&reports).is_empty());
    }

    #[test]
    fn test_aggregate_by_entity_and_class() {
        let reports = vec![
            report("a.example.com", &[("svc1", 10), ("svc2", 3)], 1),
            report("b.example.com", &[("svc1", 5)], 1),
        ];

        let marks = aggregate(&reports);

        let by_entity = aggregate_by_entity(&marks);
        assert_eq!(by_entity["a.example.com"]["svc1"], 10);
        assert_eq!(by_entity["a.example.com"]["svc2"], 3);
        assert_eq!(by_entity["b.example.com"]["svc1"], 5);

        let by_class = aggregate_by_class(&marks);
        assert_eq!(by_class["svc1"], 15);
        assert_eq!(by_class["svc2"], 3);
    }

    #[test]
    fn test_summary_counts() {
        let reports = vec![
            report("a.example.com", &[("svc1", 10), ("svc2", 3)], 1),
            report("b.example.com", &[("svc1", 5)], 1),
        ];

        let stats = summary(&aggregate(&reports));
        assert_eq!(stats.entity_count, 2);
        assert_eq!(stats.class_count, 2);
        assert_eq!(stats.total_accounts, 18);
        assert_eq!(stats.pair_count, 3);
    }

    #[test]
    fn test_compare_periods() {
        let previous = aggregate(&[
            report("a.example.com", &[("svc1", 10), ("svc2", 4)], 1),
            report("gone.example.com", &[("svc1", 2)], 1),
        ]);
        let current = aggregate(&[
            report("a.example.com", &[("svc1", 12), ("svc2", 4)], 1),
            report("fresh.example.com", &[("svc1", 1)], 1),
        ]);

        let diff = compare_periods(&current, &previous);
        assert_eq!(
            diff.new,
            vec![("fresh.example.com".to_string(), "svc1".to_string(), 1)]
        );
        assert_eq!(
            diff.removed,
            vec![("gone.example.com".to_string(), "svc1".to_string())]
        );
        assert_eq!(
            diff.increased,
            vec![("a.example.com".to_string(), "svc1".to_string(), 10, 12)]
        );
        assert!(diff.decreased.is_empty());
        assert_eq!(
            diff.unchanged,
            vec![("a.example.com".to_string(), "svc2".to_string(), 4)]
        );
    }

    #[test]
    fn test_observed_sets() {
        let marks = aggregate(&[
            report("a.example.com", &[("svc1", 10)], 1),
            report("b.example.com", &[("svc2", 5)], 1),
        ]);

        let (entities, classes) = observed_sets(&marks);
        assert!(entities.contains("a.example.com"));
        assert!(entities.contains("b.example.com"));
        assert!(classes.contains("svc1"));
        assert!(classes.contains("svc2"));
    }
}
