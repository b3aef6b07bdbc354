//! Usage snapshot and highwater mark models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One parsed usage report for a single entity at one observation time.
///
/// This is the shape a snapshot source yields; the pipeline does not care
/// whether it came from a network fetch, a file, or a test fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub entity_name: String,
    pub class_counts: BTreeMap<String, i32>,
    pub observed_at: DateTime<Utc>,
}

/// Persisted observation of one (entity, service class) count.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageSnapshot {
    pub snapshot_id: Uuid,
    pub observed_at: DateTime<Utc>,
    pub entity_id: Uuid,
    pub service_class: String,
    pub account_count: i32,
    pub created_utc: DateTime<Utc>,
}

/// Snapshot row joined with its entity name, as read back for aggregation.
#[derive(Debug, Clone, FromRow)]
pub struct ObservedUsage {
    pub entity_name: String,
    pub service_class: String,
    pub account_count: i32,
    pub observed_at: DateTime<Utc>,
}

/// Monthly maximum observed count for one (entity, service class) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HighwaterMark {
    pub highwater_id: Uuid,
    pub period_year: i32,
    pub period_month: i32,
    pub entity_id: Uuid,
    pub service_class: String,
    pub highwater_count: i32,
    pub is_billable: bool,
    pub computed_utc: DateTime<Utc>,
}

/// Billable highwater mark joined with its entity name, ready for invoicing.
#[derive(Debug, Clone, FromRow)]
pub struct BillableMark {
    pub entity_name: String,
    pub service_class: String,
    pub highwater_count: i32,
}

/// Input for persisting one recomputed highwater mark.
#[derive(Debug, Clone)]
pub struct NewHighwaterMark {
    pub entity_id: Uuid,
    pub service_class: String,
    pub highwater_count: i32,
    pub is_billable: bool,
}
