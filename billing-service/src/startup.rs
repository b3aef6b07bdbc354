//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::models::BillingPeriod;
use crate::services::{
    BillingRunner, Database, JsonReportSource, RestAccountingClient, RunOutcome,
};
use service_core::error::AppError;

/// Application container wiring configuration, store, and collaborators.
pub struct Application {
    config: BillingConfig,
    db: Database,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        Ok(Self { config, db })
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Execute one billing run for the period.
    pub async fn run_billing(&self, period: BillingPeriod) -> Result<RunOutcome, AppError> {
        let source = JsonReportSource::new(&self.config.reports.dir);
        let api = RestAccountingClient::new(self.config.accounting.clone());
        let runner = BillingRunner::new(
            self.db.clone(),
            source,
            api,
            self.config.billing.clone(),
        );

        runner.run(period).await
    }
}
