//! Mapping maintenance: entity ownership, service class mappings, and
//! reconciliation helpers.

use crate::models::{
    Customer, Entity, MappingIssues, NewChangeLogEntry, NewServiceClassMapping, ServiceClassMapping,
    parse_quota_gb,
};
use crate::services::database::Database;
use service_core::error::AppError;
use std::collections::HashMap;
use tracing::{error, info, instrument};

/// Applies mapping decisions and records every one in the change log.
#[derive(Clone)]
pub struct MappingService {
    db: Database,
}

impl MappingService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Assign an entity to a customer, creating the entity if needed.
    ///
    /// Records an `assigned` history event when the entity was previously
    /// unowned, `moved` on reassignment, plus a user-decision change log
    /// entry.
    #[instrument(skip(self, notes))]
    pub async fn assign_entity(
        &self,
        entity_name: &str,
        customer_id: uuid::Uuid,
        notes: Option<String>,
    ) -> Result<Entity, AppError> {
        let customer = self
            .db
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Customer {} not found", customer_id))
            })?;

        let (entity, old_customer_id) = self
            .db
            .assign_entity_to_customer(entity_name, customer_id, notes)
            .await?;

        let verb = if old_customer_id.is_none() {
            "Assigned"
        } else {
            "Moved"
        };
        self.db
            .log_change(NewChangeLogEntry {
                change_type: "entity_assignment".to_string(),
                subject_type: Some("entity".to_string()),
                subject_id: Some(entity.entity_id),
                description: format!(
                    "{} entity '{}' to customer '{}'",
                    verb, entity_name, customer.display_name
                ),
                is_user_decision: true,
                metadata: None,
            })
            .await?;

        info!(entity = entity_name, customer = %customer.display_name, "Entity assigned");
        Ok(entity)
    }

    /// Assign several entities to one customer, continuing past failures.
    pub async fn assign_entities(
        &self,
        entity_names: &[String],
        customer_id: uuid::Uuid,
        notes: Option<String>,
    ) -> Vec<Entity> {
        let mut assigned = Vec::new();

        for name in entity_names {
            match self.assign_entity(name, customer_id, notes.clone()).await {
                Ok(entity) => assigned.push(entity),
                Err(e) => {
                    error!(entity = %name, error = %e, "Entity assignment failed");
                }
            }
        }

        info!(
            assigned = assigned.len(),
            requested = entity_names.len(),
            "Batch entity assignment complete"
        );
        assigned
    }

    /// Map a service class to an accounting item with pricing.
    ///
    /// When the caller passes no quota, one is parsed from the service
    /// class name if the name follows the `<digits>gb` convention.
    #[instrument(skip(self, input), fields(service_class = %input.service_class))]
    pub async fn map_service_class(
        &self,
        mut input: NewServiceClassMapping,
    ) -> Result<ServiceClassMapping, AppError> {
        if input.quota_gb.is_none() {
            input.quota_gb = parse_quota_gb(&input.service_class);
        }

        let mapping = self.db.upsert_service_class_mapping(&input).await?;

        self.db
            .log_change(NewChangeLogEntry {
                change_type: "service_class_mapping".to_string(),
                subject_type: Some("service_class".to_string()),
                subject_id: Some(mapping.mapping_id),
                description: format!(
                    "Mapped service class '{}' to item '{}' at {}",
                    mapping.service_class, mapping.item_name, mapping.unit_price
                ),
                is_user_decision: true,
                metadata: None,
            })
            .await?;

        info!(
            service_class = %mapping.service_class,
            item = %mapping.item_name,
            "Service class mapped"
        );
        Ok(mapping)
    }

    /// Reactivate an entity that reappeared in observations.
    pub async fn reactivate_entity(&self, entity_name: &str) -> Result<Entity, AppError> {
        let entity = self.db.set_entity_active(entity_name, true).await?;

        self.db
            .log_change(NewChangeLogEntry {
                change_type: "entity_reappeared".to_string(),
                subject_type: Some("entity".to_string()),
                subject_id: Some(entity.entity_id),
                description: format!("Entity '{}' reappeared and was reactivated", entity_name),
                is_user_decision: false,
                metadata: None,
            })
            .await?;

        Ok(entity)
    }

    /// Deactivate a mapping whose service class is no longer observed.
    pub async fn deactivate_service_class(&self, service_class: &str) -> Result<(), AppError> {
        let deactivated = self.db.deactivate_service_class_mapping(service_class).await?;
        if !deactivated {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "No active mapping for service class '{}'",
                service_class
            )));
        }

        self.db
            .log_change(NewChangeLogEntry {
                change_type: "service_class_deactivated".to_string(),
                subject_type: Some("service_class".to_string()),
                subject_id: None,
                description: format!("Deactivated mapping for service class '{}'", service_class),
                is_user_decision: true,
                metadata: None,
            })
            .await?;

        Ok(())
    }

    /// Suggest an owner for a new entity from entities sharing its root.
    ///
    /// Best-effort hint only, never auto-applied: returns the owner of the
    /// first active entity with the same last-two-label root.
    pub async fn suggest_customer_for_entity(
        &self,
        entity_name: &str,
    ) -> Result<Option<Customer>, AppError> {
        let Some(root) = entity_root(entity_name) else {
            return Ok(None);
        };

        for candidate in self.db.list_entities(true).await? {
            if candidate.name == entity_name {
                continue;
            }
            if entity_root(&candidate.name).as_deref() != Some(root.as_str()) {
                continue;
            }
            if let Some(owner) = candidate.customer_id {
                return self.db.get_customer(owner).await;
            }
        }

        Ok(None)
    }

    /// Advisory data-quality pass over current mappings.
    ///
    /// Surfaces entities owned by inactive customers and mappings with a
    /// non-positive unit price. Never fatal.
    pub async fn validate_mappings(&self) -> Result<MappingIssues, AppError> {
        let mut issues = MappingIssues::default();

        let customers: HashMap<_, _> = self
            .db
            .list_customers(false)
            .await?
            .into_iter()
            .map(|c| (c.customer_id, c.is_active))
            .collect();

        for entity in self.db.list_entities(true).await? {
            if let Some(owner) = entity.customer_id {
                if !customers.get(&owner).copied().unwrap_or(false) {
                    issues.entities_with_inactive_customer.push(entity.name);
                }
            }
        }

        for mapping in self.db.list_service_class_mappings(true).await? {
            if mapping.unit_price <= rust_decimal::Decimal::ZERO {
                issues
                    .mappings_with_nonpositive_price
                    .push(mapping.service_class);
            }
        }

        Ok(issues)
    }
}

/// Last two labels of a dotted name: `mail.example.com` -> `example.com`.
fn entity_root(name: &str) -> Option<String> {
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join("."))
}
