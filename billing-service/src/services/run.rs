//! One complete billing run for a period.
//!
//! Sequential batch: ingest snapshots, recompute highwater marks, sync
//! customers, detect changes, and - only when no mapping decision is
//! pending - generate invoices.

use crate::config::BillingSettings;
use crate::models::{
    BillingPeriod, ChangeReport, InvoiceBatchResult, NewChangeLogEntry, NewHighwaterMark,
    UsageReport,
};
use crate::services::accounting::AccountingApi;
use crate::services::database::Database;
use crate::services::detector;
use crate::services::exclusions::ExclusionFilter;
use crate::services::highwater::{self, HighwaterMap};
use crate::services::invoicing::InvoiceGenerator;
use crate::services::source::SnapshotSource;
use serde::Serialize;
use service_core::error::AppError;
use service_core::retry::RetryPolicy;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

/// How a billing run ended.
#[derive(Debug, Clone, Serialize)]
pub enum RunOutcome {
    /// Mapping decisions are required; invoicing did not run. Re-run the
    /// period once the decisions are applied.
    ReconciliationRequired(ChangeReport),
    Completed {
        changes: ChangeReport,
        invoices: InvoiceBatchResult,
    },
}

/// Executes billing runs against the store and external collaborators.
pub struct BillingRunner<S, A> {
    db: Database,
    source: S,
    api: A,
    retry: RetryPolicy,
    settings: BillingSettings,
}

impl<S, A> BillingRunner<S, A>
where
    S: SnapshotSource,
    A: AccountingApi + Clone,
{
    pub fn new(db: Database, source: S, api: A, settings: BillingSettings) -> Self {
        Self {
            db,
            source,
            api,
            retry: RetryPolicy::with_max_retries(settings.max_retries),
            settings,
        }
    }

    /// Run one (year, month) period to completion.
    #[instrument(skip(self), fields(period = %period))]
    pub async fn run(&self, period: BillingPeriod) -> Result<RunOutcome, AppError> {
        info!(%period, "Starting billing run");

        let fetched = self.source.fetch_reports(period).await?;
        info!(reports = fetched.len(), "Fetched usage reports");

        if !fetched.is_empty() {
            self.ingest_reports(&fetched).await?;
        }

        // Highwater always derives from the full persisted month, so a
        // partial fetch or a re-run after reconciliation sees every
        // observation stored for the period.
        let reports = self.persisted_reports(period).await?;
        info!(
            observations = reports.len(),
            "Loaded persisted snapshots for the period"
        );

        let patterns = self.db.list_active_exclusions().await?;
        let filter = ExclusionFilter::from_patterns(&patterns);

        let marks = highwater::aggregate(&reports);
        self.store_highwater(period, &marks, &filter).await?;

        self.sync_customers().await?;

        let (observed_entities, observed_classes) = highwater::observed_sets(&marks);
        let state = self.db.load_mapping_state(period).await?;
        let known_items = self.upstream_items().await;

        let changes = detector::detect_all_changes(
            period,
            &observed_entities,
            &observed_classes,
            &state,
            &filter,
            known_items.as_ref(),
        );

        for name in &changes.missing_entities {
            // Re-runs of a period must not repeat the deactivation.
            let already_inactive = self
                .db
                .get_entity_by_name(name)
                .await?
                .map(|entity| !entity.is_active)
                .unwrap_or(true);
            if already_inactive {
                continue;
            }

            self.db.set_entity_active(name, false).await?;
            self.db
                .log_change(NewChangeLogEntry {
                    change_type: "entity_disappeared".to_string(),
                    subject_type: Some("entity".to_string()),
                    subject_id: None,
                    description: format!(
                        "Entity '{}' absent from {} usage, deactivated",
                        name, period
                    ),
                    is_user_decision: false,
                    metadata: None,
                })
                .await?;
        }

        if changes.needs_attention {
            info!(%period, "Reconciliation required before invoicing");
            return Ok(RunOutcome::ReconciliationRequired(changes));
        }

        let generator = InvoiceGenerator::new(
            self.db.clone(),
            self.api.clone(),
            self.retry.clone(),
            self.settings.invoice_memo.clone(),
        );
        let invoices = generator.generate_all(period).await?;

        for success in &invoices.succeeded {
            self.db
                .log_change(NewChangeLogEntry {
                    change_type: "invoice_created".to_string(),
                    subject_type: Some("customer".to_string()),
                    subject_id: Some(success.customer_id),
                    description: format!(
                        "Created invoice {} for customer {} ({})",
                        success.external_invoice_id, success.customer_id, period
                    ),
                    is_user_decision: false,
                    metadata: None,
                })
                .await?;
        }

        info!(
            %period,
            succeeded = invoices.succeeded.len(),
            skipped = invoices.skipped.len(),
            failed = invoices.failed.len(),
            "Billing run complete"
        );

        Ok(RunOutcome::Completed { changes, invoices })
    }

    /// Persist fetched reports: register unknown entities and upsert every
    /// observation.
    async fn ingest_reports(&self, reports: &[UsageReport]) -> Result<(), AppError> {
        for report in reports {
            if report.entity_name.is_empty() {
                warn!("Usage report missing entity name, skipping");
                continue;
            }

            let entity = self.db.register_entity(&report.entity_name).await?;
            for (service_class, count) in &report.class_counts {
                self.db
                    .upsert_snapshot(entity.entity_id, service_class, report.observed_at, *count)
                    .await?;
            }
        }
        Ok(())
    }

    /// Reload the period's persisted snapshots as single-observation reports.
    async fn persisted_reports(
        &self,
        period: BillingPeriod,
    ) -> Result<Vec<UsageReport>, AppError> {
        let snapshots = self.db.snapshots_for_period(period).await?;

        Ok(snapshots
            .into_iter()
            .map(|row| UsageReport {
                entity_name: row.entity_name,
                class_counts: BTreeMap::from([(row.service_class, row.account_count)]),
                observed_at: row.observed_at,
            })
            .collect())
    }

    async fn store_highwater(
        &self,
        period: BillingPeriod,
        marks: &HighwaterMap,
        filter: &ExclusionFilter,
    ) -> Result<(), AppError> {
        let mut rows = Vec::with_capacity(marks.len());

        for ((entity_name, service_class), entry) in marks {
            let Some(entity) = self.db.get_entity_by_name(entity_name).await? else {
                warn!(entity = %entity_name, "Entity vanished between ingest and highwater");
                continue;
            };

            rows.push(NewHighwaterMark {
                entity_id: entity.entity_id,
                service_class: service_class.clone(),
                highwater_count: entry.count,
                is_billable: filter.is_billable(entity_name, service_class),
            });
        }

        self.db.replace_highwater_for_period(period, &rows).await
    }

    /// Best-effort customer sync; a failure falls back to persisted rows.
    async fn sync_customers(&self) -> Result<(), AppError> {
        match self
            .retry
            .execute("list_customers", || async { self.api.list_customers().await })
            .await
        {
            Ok(customers) => {
                let count = customers.len();
                for customer in customers {
                    self.db
                        .upsert_customer(&customer.id, &customer.display_name, customer.is_active)
                        .await?;
                }
                info!(customers = count, "Customer sync complete");
            }
            Err(e) => {
                warn!(error = %e, "Customer sync failed, continuing with persisted customers");
            }
        }
        Ok(())
    }

    /// Upstream billable items keyed by id, when the accounting system is
    /// reachable; `None` skips the invalid-mapping check.
    async fn upstream_items(&self) -> Option<BTreeMap<String, bool>> {
        match self
            .retry
            .execute("list_items", || async { self.api.list_items().await })
            .await
        {
            Ok(items) => Some(
                items
                    .into_iter()
                    .map(|item| (item.id, item.is_active))
                    .collect(),
            ),
            Err(e) => {
                warn!(error = %e, "Item listing failed, skipping invalid-mapping check");
                None
            }
        }
    }
}
