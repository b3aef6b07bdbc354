//! Entity model and lifecycle history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A billed unit of service, e.g. a customer-operated domain.
///
/// `customer_id` stays NULL until an owner is assigned during
/// reconciliation; unowned entities never produce invoice lines.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Entity {
    pub entity_id: Uuid,
    pub name: String,
    pub customer_id: Option<Uuid>,
    pub is_active: bool,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Entity lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityEvent {
    Discovered,
    Assigned,
    Moved,
    Disappeared,
    Reappeared,
}

impl EntityEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityEvent::Discovered => "discovered",
            EntityEvent::Assigned => "assigned",
            EntityEvent::Moved => "moved",
            EntityEvent::Disappeared => "disappeared",
            EntityEvent::Reappeared => "reappeared",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "assigned" => EntityEvent::Assigned,
            "moved" => EntityEvent::Moved,
            "disappeared" => EntityEvent::Disappeared,
            "reappeared" => EntityEvent::Reappeared,
            _ => EntityEvent::Discovered,
        }
    }
}

/// One recorded lifecycle transition for an entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntityHistoryEvent {
    pub event_id: Uuid,
    pub entity_id: Uuid,
    pub event_type: String,
    pub old_customer_id: Option<Uuid>,
    pub new_customer_id: Option<Uuid>,
    pub event_utc: DateTime<Utc>,
    pub notes: Option<String>,
}
