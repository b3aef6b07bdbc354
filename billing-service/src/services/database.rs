//! Database service for billing-service.

use crate::models::{
    BillableMark, BillingPeriod, ChangeLogEntry, Customer, Entity, EntityEvent,
    EntityHistoryEvent, ExclusionPattern, HighwaterMark, InvoiceRecord, MappingState,
    NewChangeLogEntry, NewHighwaterMark, NewInvoiceRecord, NewServiceClassMapping, ObservedUsage,
    PatternType, RecordOutcome, ServiceClassMapping,
};
use crate::services::invoicing::InvoiceStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn period_bounds(period: BillingPeriod) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = period.first_day().and_time(NaiveTime::MIN).and_utc();
    let end = period.next().first_day().and_time(NaiveTime::MIN).and_utc();
    (start, end)
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Customer Operations
    // =========================================================================

    /// Create or update a customer from the accounting system.
    #[instrument(skip(self, display_name))]
    pub async fn upsert_customer(
        &self,
        external_id: &str,
        display_name: &str,
        is_active: bool,
    ) -> Result<Customer, AppError> {
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            INSERT INTO customers (customer_id, external_id, display_name, is_active, last_synced_utc)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (external_id) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                is_active = EXCLUDED.is_active,
                last_synced_utc = NOW(),
                updated_utc = NOW()
            RETURNING customer_id, external_id, display_name, is_active, last_synced_utc, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(external_id)
        .bind(display_name)
        .bind(is_active)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to upsert customer: {}", e)))?;

        Ok(customer)
    }

    /// Get a customer by ID.
    pub async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT customer_id, external_id, display_name, is_active, last_synced_utc, created_utc, updated_utc
            FROM customers
            WHERE customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get customer: {}", e)))?;

        Ok(customer)
    }

    /// Get a customer by its accounting-system identifier.
    pub async fn get_customer_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Customer>, AppError> {
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT customer_id, external_id, display_name, is_active, last_synced_utc, created_utc, updated_utc
            FROM customers
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get customer: {}", e)))?;

        Ok(customer)
    }

    /// List customers, optionally active only.
    pub async fn list_customers(&self, active_only: bool) -> Result<Vec<Customer>, AppError> {
        let customers = sqlx::query_as::<_, Customer>(
            r#"
            SELECT customer_id, external_id, display_name, is_active, last_synced_utc, created_utc, updated_utc
            FROM customers
            WHERE ($1::bool = FALSE OR is_active = TRUE)
            ORDER BY display_name
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list customers: {}", e)))?;

        Ok(customers)
    }

    // =========================================================================
    // Entity Operations
    // =========================================================================

    /// Get an entity by name.
    pub async fn get_entity_by_name(&self, name: &str) -> Result<Option<Entity>, AppError> {
        let entity = sqlx::query_as::<_, Entity>(
            r#"
            SELECT entity_id, name, customer_id, is_active, first_seen_utc, last_seen_utc, notes, created_utc, updated_utc
            FROM entities
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get entity: {}", e)))?;

        Ok(entity)
    }

    /// List entities, optionally active only.
    pub async fn list_entities(&self, active_only: bool) -> Result<Vec<Entity>, AppError> {
        let entities = sqlx::query_as::<_, Entity>(
            r#"
            SELECT entity_id, name, customer_id, is_active, first_seen_utc, last_seen_utc, notes, created_utc, updated_utc
            FROM entities
            WHERE ($1::bool = FALSE OR is_active = TRUE)
            ORDER BY name
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list entities: {}", e)))?;

        Ok(entities)
    }

    /// List entities owned by a customer.
    pub async fn entities_for_customer(&self, customer_id: Uuid) -> Result<Vec<Entity>, AppError> {
        let entities = sqlx::query_as::<_, Entity>(
            r#"
            SELECT entity_id, name, customer_id, is_active, first_seen_utc, last_seen_utc, notes, created_utc, updated_utc
            FROM entities
            WHERE customer_id = $1
            ORDER BY name
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list entities: {}", e)))?;

        Ok(entities)
    }

    /// Register an entity observed in usage data.
    ///
    /// A known entity gets its `last_seen_utc` refreshed; an unknown one is
    /// created unowned with a `discovered` history event.
    #[instrument(skip(self))]
    pub async fn register_entity(&self, name: &str) -> Result<Entity, AppError> {
        if self.get_entity_by_name(name).await?.is_some() {
            let entity = sqlx::query_as::<_, Entity>(
                r#"
                UPDATE entities
                SET last_seen_utc = NOW(), updated_utc = NOW()
                WHERE name = $1
                RETURNING entity_id, name, customer_id, is_active, first_seen_utc, last_seen_utc, notes, created_utc, updated_utc
                "#,
            )
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to touch entity: {}", e))
            })?;
            return Ok(entity);
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let entity = sqlx::query_as::<_, Entity>(
            r#"
            INSERT INTO entities (entity_id, name)
            VALUES ($1, $2)
            RETURNING entity_id, name, customer_id, is_active, first_seen_utc, last_seen_utc, notes, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create entity: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO entity_history (event_id, entity_id, event_type)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity.entity_id)
        .bind(EntityEvent::Discovered.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record entity event: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        info!(entity = name, "New entity discovered");
        Ok(entity)
    }

    /// Assign an entity to a customer, creating the entity if needed.
    ///
    /// Returns the entity and its previous owner. The matching history
    /// event (`assigned` or `moved`) is written in the same transaction.
    #[instrument(skip(self, notes))]
    pub async fn assign_entity_to_customer(
        &self,
        name: &str,
        customer_id: Uuid,
        notes: Option<String>,
    ) -> Result<(Entity, Option<Uuid>), AppError> {
        let existing = self.get_entity_by_name(name).await?;
        let old_customer_id = existing.as_ref().and_then(|e| e.customer_id);

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let entity = if existing.is_some() {
            sqlx::query_as::<_, Entity>(
                r#"
                UPDATE entities
                SET customer_id = $2,
                    notes = COALESCE($3, notes),
                    last_seen_utc = NOW(),
                    updated_utc = NOW()
                WHERE name = $1
                RETURNING entity_id, name, customer_id, is_active, first_seen_utc, last_seen_utc, notes, created_utc, updated_utc
                "#,
            )
            .bind(name)
            .bind(customer_id)
            .bind(&notes)
            .fetch_one(&mut *tx)
            .await
        } else {
            sqlx::query_as::<_, Entity>(
                r#"
                INSERT INTO entities (entity_id, name, customer_id, notes)
                VALUES ($1, $2, $3, $4)
                RETURNING entity_id, name, customer_id, is_active, first_seen_utc, last_seen_utc, notes, created_utc, updated_utc
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(customer_id)
            .bind(&notes)
            .fetch_one(&mut *tx)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to assign entity: {}", e)))?;

        let event = if old_customer_id.is_none() {
            EntityEvent::Assigned
        } else {
            EntityEvent::Moved
        };

        sqlx::query(
            r#"
            INSERT INTO entity_history (event_id, entity_id, event_type, old_customer_id, new_customer_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity.entity_id)
        .bind(event.as_str())
        .bind(old_customer_id)
        .bind(customer_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record entity event: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        Ok((entity, old_customer_id))
    }

    /// Flip an entity's active flag, recording the lifecycle event.
    #[instrument(skip(self))]
    pub async fn set_entity_active(&self, name: &str, active: bool) -> Result<Entity, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let entity = sqlx::query_as::<_, Entity>(
            r#"
            UPDATE entities
            SET is_active = $2, updated_utc = NOW()
            WHERE name = $1
            RETURNING entity_id, name, customer_id, is_active, first_seen_utc, last_seen_utc, notes, created_utc, updated_utc
            "#,
        )
        .bind(name)
        .bind(active)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update entity: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Entity '{}' not found", name)))?;

        let event = if active {
            EntityEvent::Reappeared
        } else {
            EntityEvent::Disappeared
        };

        sqlx::query(
            r#"
            INSERT INTO entity_history (event_id, entity_id, event_type)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity.entity_id)
        .bind(event.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record entity event: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        Ok(entity)
    }

    /// Recent lifecycle events for an entity, newest first.
    pub async fn entity_history(
        &self,
        entity_id: Uuid,
        limit: i64,
    ) -> Result<Vec<EntityHistoryEvent>, AppError> {
        let events = sqlx::query_as::<_, EntityHistoryEvent>(
            r#"
            SELECT event_id, entity_id, event_type, old_customer_id, new_customer_id, event_utc, notes
            FROM entity_history
            WHERE entity_id = $1
            ORDER BY event_utc DESC
            LIMIT $2
            "#,
        )
        .bind(entity_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get entity history: {}", e))
        })?;

        Ok(events)
    }

    // =========================================================================
    // Exclusion Operations
    // =========================================================================

    /// Load all active exclusion patterns.
    pub async fn list_active_exclusions(&self) -> Result<Vec<ExclusionPattern>, AppError> {
        let patterns = sqlx::query_as::<_, ExclusionPattern>(
            r#"
            SELECT exclusion_id, pattern_type, pattern, reason, is_active, created_utc
            FROM exclusion_patterns
            WHERE is_active = TRUE
            ORDER BY pattern_type, pattern
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list exclusions: {}", e))
        })?;

        Ok(patterns)
    }

    /// Add (or reactivate) an exclusion pattern.
    #[instrument(skip(self, reason))]
    pub async fn add_exclusion(
        &self,
        pattern_type: PatternType,
        pattern: &str,
        reason: Option<String>,
    ) -> Result<ExclusionPattern, AppError> {
        let exclusion = sqlx::query_as::<_, ExclusionPattern>(
            r#"
            INSERT INTO exclusion_patterns (exclusion_id, pattern_type, pattern, reason)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (pattern_type, pattern) DO UPDATE
            SET is_active = TRUE,
                reason = COALESCE(EXCLUDED.reason, exclusion_patterns.reason)
            RETURNING exclusion_id, pattern_type, pattern, reason, is_active, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(pattern_type.as_str())
        .bind(pattern)
        .bind(&reason)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to add exclusion: {}", e)))?;

        info!(pattern_type = pattern_type.as_str(), pattern, "Exclusion pattern added");
        Ok(exclusion)
    }

    /// Deactivate an exclusion pattern. Returns false when none matched.
    pub async fn deactivate_exclusion(
        &self,
        pattern_type: PatternType,
        pattern: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE exclusion_patterns
            SET is_active = FALSE
            WHERE pattern_type = $1 AND pattern = $2 AND is_active = TRUE
            "#,
        )
        .bind(pattern_type.as_str())
        .bind(pattern)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to deactivate exclusion: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Service Class Mapping Operations
    // =========================================================================

    /// Get the active mapping for a service class.
    pub async fn get_service_class_mapping(
        &self,
        service_class: &str,
    ) -> Result<Option<ServiceClassMapping>, AppError> {
        let mapping = sqlx::query_as::<_, ServiceClassMapping>(
            r#"
            SELECT mapping_id, service_class, item_id, item_name, unit_price, quota_gb, description, is_active, created_utc, updated_utc
            FROM service_class_mappings
            WHERE service_class = $1 AND is_active = TRUE
            "#,
        )
        .bind(service_class)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get mapping: {}", e)))?;

        Ok(mapping)
    }

    /// List service class mappings, optionally active only.
    pub async fn list_service_class_mappings(
        &self,
        active_only: bool,
    ) -> Result<Vec<ServiceClassMapping>, AppError> {
        let mappings = sqlx::query_as::<_, ServiceClassMapping>(
            r#"
            SELECT mapping_id, service_class, item_id, item_name, unit_price, quota_gb, description, is_active, created_utc, updated_utc
            FROM service_class_mappings
            WHERE ($1::bool = FALSE OR is_active = TRUE)
            ORDER BY service_class
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list mappings: {}", e)))?;

        Ok(mappings)
    }

    /// Create or update a service class mapping.
    #[instrument(skip(self, input), fields(service_class = %input.service_class))]
    pub async fn upsert_service_class_mapping(
        &self,
        input: &NewServiceClassMapping,
    ) -> Result<ServiceClassMapping, AppError> {
        let mapping = sqlx::query_as::<_, ServiceClassMapping>(
            r#"
            INSERT INTO service_class_mappings (mapping_id, service_class, item_id, item_name, unit_price, quota_gb, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (service_class) DO UPDATE
            SET item_id = EXCLUDED.item_id,
                item_name = EXCLUDED.item_name,
                unit_price = EXCLUDED.unit_price,
                quota_gb = EXCLUDED.quota_gb,
                description = COALESCE(EXCLUDED.description, service_class_mappings.description),
                is_active = TRUE,
                updated_utc = NOW()
            RETURNING mapping_id, service_class, item_id, item_name, unit_price, quota_gb, description, is_active, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.service_class)
        .bind(&input.item_id)
        .bind(&input.item_name)
        .bind(input.unit_price)
        .bind(input.quota_gb)
        .bind(&input.description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to upsert mapping: {}", e)))?;

        Ok(mapping)
    }

    /// Deactivate a service class mapping. Returns false when none matched.
    pub async fn deactivate_service_class_mapping(
        &self,
        service_class: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE service_class_mappings
            SET is_active = FALSE, updated_utc = NOW()
            WHERE service_class = $1 AND is_active = TRUE
            "#,
        )
        .bind(service_class)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to deactivate mapping: {}", e))
        })?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Usage Snapshot Operations
    // =========================================================================

    /// Store one observation, overwriting a re-ingested duplicate.
    pub async fn upsert_snapshot(
        &self,
        entity_id: Uuid,
        service_class: &str,
        observed_at: DateTime<Utc>,
        account_count: i32,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO usage_snapshots (snapshot_id, observed_at, entity_id, service_class, account_count)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (observed_at, entity_id, service_class) DO UPDATE
            SET account_count = EXCLUDED.account_count
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(observed_at)
        .bind(entity_id)
        .bind(service_class)
        .bind(account_count)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to store snapshot: {}", e)))?;

        Ok(())
    }

    /// All observations within a period, joined with entity names.
    pub async fn snapshots_for_period(
        &self,
        period: BillingPeriod,
    ) -> Result<Vec<ObservedUsage>, AppError> {
        let (start, end) = period_bounds(period);

        let snapshots = sqlx::query_as::<_, ObservedUsage>(
            r#"
            SELECT e.name AS entity_name, s.service_class, s.account_count, s.observed_at
            FROM usage_snapshots s
            JOIN entities e ON e.entity_id = s.entity_id
            WHERE s.observed_at >= $1 AND s.observed_at < $2
            ORDER BY s.observed_at, e.name, s.service_class
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load snapshots: {}", e))
        })?;

        Ok(snapshots)
    }

    // =========================================================================
    // Highwater Operations
    // =========================================================================

    /// Replace the period's highwater marks with a freshly computed set.
    ///
    /// Delete-then-insert in one transaction keeps recomputation idempotent:
    /// stale pairs from a prior run never linger.
    #[instrument(skip(self, marks), fields(period = %period, marks = marks.len()))]
    pub async fn replace_highwater_for_period(
        &self,
        period: BillingPeriod,
        marks: &[NewHighwaterMark],
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query(
            r#"
            DELETE FROM highwater_marks
            WHERE period_year = $1 AND period_month = $2
            "#,
        )
        .bind(period.year())
        .bind(period.month() as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to clear highwater marks: {}", e))
        })?;

        for mark in marks {
            sqlx::query(
                r#"
                INSERT INTO highwater_marks (highwater_id, period_year, period_month, entity_id, service_class, highwater_count, is_billable)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(period.year())
            .bind(period.month() as i32)
            .bind(mark.entity_id)
            .bind(&mark.service_class)
            .bind(mark.highwater_count)
            .bind(mark.is_billable)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to store highwater mark: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        info!(period = %period, marks = marks.len(), "Highwater marks stored");
        Ok(())
    }

    /// Highwater marks for a period, optionally billable only.
    pub async fn highwater_for_period(
        &self,
        period: BillingPeriod,
        billable_only: bool,
    ) -> Result<Vec<HighwaterMark>, AppError> {
        let marks = sqlx::query_as::<_, HighwaterMark>(
            r#"
            SELECT highwater_id, period_year, period_month, entity_id, service_class, highwater_count, is_billable, computed_utc
            FROM highwater_marks
            WHERE period_year = $1 AND period_month = $2
              AND ($3::bool = FALSE OR is_billable = TRUE)
            ORDER BY service_class
            "#,
        )
        .bind(period.year())
        .bind(period.month() as i32)
        .bind(billable_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load highwater marks: {}", e))
        })?;

        Ok(marks)
    }

    /// Names of entities with billable usage in a period.
    pub async fn entity_names_with_billable_usage(
        &self,
        period: BillingPeriod,
    ) -> Result<Vec<String>, AppError> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT e.name
            FROM highwater_marks hw
            JOIN entities e ON e.entity_id = hw.entity_id
            WHERE hw.period_year = $1 AND hw.period_month = $2 AND hw.is_billable = TRUE
            ORDER BY e.name
            "#,
        )
        .bind(period.year())
        .bind(period.month() as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load billable entities: {}", e))
        })?;

        Ok(names)
    }

    /// Billable marks for one customer's entities in a period.
    pub async fn billable_marks_for_customer(
        &self,
        customer_id: Uuid,
        period: BillingPeriod,
    ) -> Result<Vec<BillableMark>, AppError> {
        let marks = sqlx::query_as::<_, BillableMark>(
            r#"
            SELECT e.name AS entity_name, hw.service_class, hw.highwater_count
            FROM highwater_marks hw
            JOIN entities e ON e.entity_id = hw.entity_id
            WHERE e.customer_id = $1
              AND hw.period_year = $2 AND hw.period_month = $3
              AND hw.is_billable = TRUE
            ORDER BY e.name, hw.service_class
            "#,
        )
        .bind(customer_id)
        .bind(period.year())
        .bind(period.month() as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to load billable marks: {}", e))
        })?;

        Ok(marks)
    }

    /// Customers owning at least one billable mark in a period.
    pub async fn customers_with_billable_usage(
        &self,
        period: BillingPeriod,
    ) -> Result<Vec<Customer>, AppError> {
        let customers = sqlx::query_as::<_, Customer>(
            r#"
            SELECT DISTINCT c.customer_id, c.external_id, c.display_name, c.is_active, c.last_synced_utc, c.created_utc, c.updated_utc
            FROM customers c
            JOIN entities e ON e.customer_id = c.customer_id
            JOIN highwater_marks hw ON hw.entity_id = e.entity_id
            WHERE hw.period_year = $1 AND hw.period_month = $2 AND hw.is_billable = TRUE
            ORDER BY c.display_name
            "#,
        )
        .bind(period.year())
        .bind(period.month() as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to list customers with usage: {}",
                e
            ))
        })?;

        Ok(customers)
    }

    // =========================================================================
    // Invoice Record Operations
    // =========================================================================

    /// Look up an invoice record by idempotency key.
    pub async fn find_invoice_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<InvoiceRecord>, AppError> {
        let record = sqlx::query_as::<_, InvoiceRecord>(
            r#"
            SELECT record_id, external_invoice_id, customer_id, billing_year, billing_month, invoice_date, total_amount, line_item_count, status, idempotency_key, created_utc, updated_utc
            FROM invoice_records
            WHERE idempotency_key = $1
            "#,
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find invoice record: {}", e))
        })?;

        Ok(record)
    }

    /// Persist a created invoice.
    ///
    /// A unique violation on the idempotency key means another writer got
    /// there first; the existing row is returned instead of an error.
    #[instrument(skip(self, record), fields(idempotency_key = %record.idempotency_key))]
    pub async fn insert_invoice_record(
        &self,
        record: NewInvoiceRecord,
    ) -> Result<RecordOutcome, AppError> {
        let result = sqlx::query_as::<_, InvoiceRecord>(
            r#"
            INSERT INTO invoice_records (record_id, external_invoice_id, customer_id, billing_year, billing_month, invoice_date, total_amount, line_item_count, status, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING record_id, external_invoice_id, customer_id, billing_year, billing_month, invoice_date, total_amount, line_item_count, status, idempotency_key, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.external_invoice_id)
        .bind(record.customer_id)
        .bind(record.billing_year)
        .bind(record.billing_month)
        .bind(record.invoice_date)
        .bind(record.total_amount)
        .bind(record.line_item_count)
        .bind(record.status.as_str())
        .bind(&record.idempotency_key)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(created) => Ok(RecordOutcome::Created(created)),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let existing = self
                    .find_invoice_by_key(&record.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        AppError::DatabaseError(anyhow::anyhow!(
                            "Unique violation without an existing row for key {}",
                            record.idempotency_key
                        ))
                    })?;
                Ok(RecordOutcome::AlreadyExists(existing))
            }
            Err(e) => Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to record invoice: {}",
                e
            ))),
        }
    }

    /// All invoice records for a billing period.
    pub async fn invoices_for_period(
        &self,
        period: BillingPeriod,
    ) -> Result<Vec<InvoiceRecord>, AppError> {
        let records = sqlx::query_as::<_, InvoiceRecord>(
            r#"
            SELECT record_id, external_invoice_id, customer_id, billing_year, billing_month, invoice_date, total_amount, line_item_count, status, idempotency_key, created_utc, updated_utc
            FROM invoice_records
            WHERE billing_year = $1 AND billing_month = $2
            ORDER BY created_utc
            "#,
        )
        .bind(period.year())
        .bind(period.month() as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list invoice records: {}", e))
        })?;

        Ok(records)
    }

    // =========================================================================
    // Change Log Operations
    // =========================================================================

    /// Append an entry to the change log.
    pub async fn log_change(&self, entry: NewChangeLogEntry) -> Result<ChangeLogEntry, AppError> {
        let logged = sqlx::query_as::<_, ChangeLogEntry>(
            r#"
            INSERT INTO change_log (entry_id, change_type, subject_type, subject_id, description, is_user_decision, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING entry_id, logged_utc, change_type, subject_type, subject_id, description, is_user_decision, metadata
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.change_type)
        .bind(&entry.subject_type)
        .bind(entry.subject_id)
        .bind(&entry.description)
        .bind(entry.is_user_decision)
        .bind(&entry.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to log change: {}", e)))?;

        Ok(logged)
    }

    // =========================================================================
    // Reconciliation State
    // =========================================================================

    /// Load the persisted state one change-detection pass compares against.
    #[instrument(skip(self), fields(period = %period))]
    pub async fn load_mapping_state(
        &self,
        period: BillingPeriod,
    ) -> Result<MappingState, AppError> {
        let mut state = MappingState::default();

        let entities = sqlx::query_as::<_, (String, bool)>(
            r#"
            SELECT name, is_active
            FROM entities
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load entities: {}", e)))?;

        for (name, is_active) in entities {
            if !is_active {
                state.inactive_entities.insert(name.clone());
            }
            state.known_entities.insert(name);
        }

        state.previous_billable_entities = self
            .entity_names_with_billable_usage(period.previous())
            .await?
            .into_iter()
            .collect();

        state.active_mappings = self.list_service_class_mappings(true).await?;
        state.mapped_service_classes = state
            .active_mappings
            .iter()
            .map(|m| m.service_class.clone())
            .collect();

        Ok(state)
    }
}

#[async_trait]
impl InvoiceStore for Database {
    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        Database::get_customer(self, customer_id).await
    }

    async fn customers_with_billable_usage(
        &self,
        period: BillingPeriod,
    ) -> Result<Vec<Customer>, AppError> {
        Database::customers_with_billable_usage(self, period).await
    }

    async fn billable_marks_for_customer(
        &self,
        customer_id: Uuid,
        period: BillingPeriod,
    ) -> Result<Vec<BillableMark>, AppError> {
        Database::billable_marks_for_customer(self, customer_id, period).await
    }

    async fn mapping_for_service_class(
        &self,
        service_class: &str,
    ) -> Result<Option<ServiceClassMapping>, AppError> {
        self.get_service_class_mapping(service_class).await
    }

    async fn find_invoice_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<InvoiceRecord>, AppError> {
        Database::find_invoice_by_key(self, idempotency_key).await
    }

    async fn record_invoice(&self, record: NewInvoiceRecord) -> Result<RecordOutcome, AppError> {
        self.insert_invoice_record(record).await
    }
}
