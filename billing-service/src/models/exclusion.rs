//! Exclusion pattern model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What kind of name an exclusion pattern applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Entity,
    ServiceClass,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Entity => "entity",
            PatternType::ServiceClass => "service_class",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "service_class" => PatternType::ServiceClass,
            _ => PatternType::Entity,
        }
    }
}

/// Glob pattern excluding entities or service classes from billing.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExclusionPattern {
    pub exclusion_id: Uuid,
    pub pattern_type: String,
    pub pattern: String,
    pub reason: Option<String>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}
