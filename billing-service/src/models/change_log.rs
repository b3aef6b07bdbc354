//! Append-only change log model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One audited mapping decision or system-driven change.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChangeLogEntry {
    pub entry_id: Uuid,
    pub logged_utc: DateTime<Utc>,
    pub change_type: String,
    pub subject_type: Option<String>,
    pub subject_id: Option<Uuid>,
    pub description: String,
    pub is_user_decision: bool,
    pub metadata: Option<serde_json::Value>,
}

/// Input for appending a change log entry.
#[derive(Debug, Clone)]
pub struct NewChangeLogEntry {
    pub change_type: String,
    pub subject_type: Option<String>,
    pub subject_id: Option<Uuid>,
    pub description: String,
    pub is_user_decision: bool,
    pub metadata: Option<serde_json::Value>,
}
