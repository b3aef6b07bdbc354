//! Billing Service entry point.

use billing_service::config::BillingConfig;
use billing_service::models::BillingPeriod;
use billing_service::services::RunOutcome;
use billing_service::startup::Application;
use chrono::{Datelike, Utc};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, aborting billing run");
}

/// Period to bill: explicit override, or the previous calendar month
/// (billing runs in arrears).
fn resolve_period(config: &BillingConfig) -> Result<BillingPeriod, AppError> {
    if let (Some(year), Some(month)) = (config.billing.year, config.billing.month) {
        return BillingPeriod::new(year, month);
    }

    let now = Utc::now();
    let current = BillingPeriod::new(now.year(), now.month())?;
    Ok(current.previous())
}

fn report_outcome(outcome: &RunOutcome) -> std::io::Result<()> {
    match outcome {
        RunOutcome::ReconciliationRequired(changes) => {
            tracing::warn!(
                new_entities = changes.new_entities.len(),
                new_service_classes = changes.new_service_classes.len(),
                reappearing_entities = changes.reappearing_entities.len(),
                obsolete_mappings = changes.obsolete_service_class_mappings.len(),
                invalid_item_mappings = changes.invalid_item_mappings.len(),
                "Mapping decisions required; resolve them and re-run the period"
            );
            Ok(())
        }
        RunOutcome::Completed { invoices, .. } => {
            for failure in &invoices.failed {
                tracing::error!(
                    customer_id = %failure.customer_id,
                    error = %failure.error,
                    "Invoice generation failed for customer"
                );
            }

            tracing::info!(
                succeeded = invoices.succeeded.len(),
                skipped = invoices.skipped.len(),
                failed = invoices.failed.len(),
                "Billing run finished"
            );

            if invoices.is_clean() {
                Ok(())
            } else {
                Err(std::io::Error::other(format!(
                    "{} customer(s) failed invoicing",
                    invoices.failed.len()
                )))
            }
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load configuration
    let config = BillingConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(&config.service_name, &config.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting billing-service"
    );

    // Log configuration (mask sensitive values)
    tracing::info!(
        service_name = %config.service_name,
        environment = %config.common.environment,
        db_max_connections = %config.database.max_connections,
        db_min_connections = %config.database.min_connections,
        accounting_api = %config.accounting.base_url,
        reports_dir = %config.reports.dir.display(),
        "Configuration loaded"
    );

    let period = resolve_period(&config).map_err(|e| {
        tracing::error!(error = %e, "Invalid billing period");
        std::io::Error::other(format!("Invalid billing period: {}", e))
    })?;

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    tracing::info!(period = %period, "Billing period resolved");

    tokio::select! {
        result = app.run_billing(period) => {
            match result {
                Ok(outcome) => report_outcome(&outcome)?,
                Err(e) => {
                    tracing::error!(error = %e, "Billing run failed");
                    return Err(std::io::Error::other(format!("Billing run failed: {}", e)));
                }
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Billing run aborted before completion");
        }
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}
