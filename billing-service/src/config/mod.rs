//! Configuration module for billing-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub accounting: AccountingConfig,
    pub reports: ReportsConfig,
    pub billing: BillingSettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct AccountingConfig {
    pub base_url: String,
    pub api_token: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct ReportsConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BillingSettings {
    /// Memo prefix on generated invoices.
    pub invoice_memo: String,
    /// Explicit billing period override; defaults to the previous month.
    pub year: Option<i32>,
    pub month: Option<u32>,
    /// Retry attempts for accounting API calls, not counting the first.
    pub max_retries: u32,
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "billing-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            accounting: AccountingConfig {
                base_url: env::var("ACCOUNTING_API_BASE_URL")
                    .unwrap_or_else(|_| "http://accounting-api:4000/v1".to_string()),
                api_token: Secret::new(env::var("ACCOUNTING_API_TOKEN").unwrap_or_default()),
            },
            reports: ReportsConfig {
                dir: env::var("REPORTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./reports")),
            },
            billing: BillingSettings {
                invoice_memo: env::var("INVOICE_MEMO")
                    .unwrap_or_else(|_| "Hosted Email Services".to_string()),
                year: env::var("BILLING_YEAR").ok().and_then(|s| s.parse().ok()),
                month: env::var("BILLING_MONTH").ok().and_then(|s| s.parse().ok()),
                max_retries: env::var("ACCOUNTING_MAX_RETRIES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3),
            },
        })
    }
}
