//! Service class mapping model.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Mapping of a service class to a billable item in the accounting system.
///
/// `unit_price` is a cached default only; invoicing always re-resolves the
/// current price from the accounting item at invoice-creation time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ServiceClassMapping {
    pub mapping_id: Uuid,
    pub service_class: String,
    pub item_id: String,
    pub item_name: String,
    pub unit_price: Decimal,
    pub quota_gb: Option<i32>,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating or updating a service class mapping.
#[derive(Debug, Clone)]
pub struct NewServiceClassMapping {
    pub service_class: String,
    pub item_id: String,
    pub item_name: String,
    pub unit_price: Decimal,
    pub quota_gb: Option<i32>,
    pub description: Option<String>,
}

static QUOTA_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*gb").expect("static pattern compiles"));

/// Extract a quota size in GB from a service class name.
///
/// Follows the `<digits>gb` suffix convention, e.g. `customer-50gb` -> 50.
pub fn parse_quota_gb(service_class: &str) -> Option<i32> {
    QUOTA_PATTERN
        .captures(service_class)
        .and_then(|captures| captures[1].parse().ok())
}
