//! External accounting system contract and error taxonomy.
//!
//! The pipeline only ever touches the accounting system through the
//! [`AccountingApi`] trait; failures are classified into retry/no-retry
//! categories before they reach the retry policy.

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::retry::Retryable;
use std::time::Duration;
use thiserror::Error;

/// Default wait when the server rate-limits without suggesting one.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Customer as the accounting system reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCustomer {
    pub id: String,
    pub display_name: String,
    pub is_active: bool,
}

/// Billable item as the accounting system reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiItem {
    pub id: String,
    pub name: String,
    pub unit_price: Decimal,
    pub is_active: bool,
}

/// Invoice as returned by the accounting system, which computes line
/// totals from its own current item prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiInvoice {
    pub id: String,
    pub total_amount: Decimal,
}

/// One line of an invoice request. Carries no unit price: pricing is owned
/// by the accounting system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub item_id: String,
    pub quantity: i32,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvoiceRequest {
    /// External customer identifier.
    pub customer_id: String,
    pub lines: Vec<InvoiceLine>,
    pub invoice_date: NaiveDate,
    pub memo: String,
    /// Document number carrying the idempotency key, so an invoice created
    /// upstream but never recorded locally can be found again.
    pub doc_number: Option<String>,
}

/// Classified failure from the accounting system.
///
/// Every variant names the operation and keeps the upstream message
/// (redacted of credentials) as context.
#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("{operation}: rate limited: {message}")]
    RateLimited {
        operation: String,
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("{operation}: authentication failed: {message}")]
    Auth { operation: String, message: String },

    #[error("{operation}: validation error: {message}")]
    Validation { operation: String, message: String },

    #[error("{operation}: not found: {message}")]
    NotFound { operation: String, message: String },

    #[error("{operation}: server error (status {status}): {message}")]
    Server {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("{operation}: network error: {message}")]
    Network { operation: String, message: String },

    #[error("{operation}: {message}")]
    Unclassified { operation: String, message: String },
}

impl AccountingError {
    pub fn operation(&self) -> &str {
        match self {
            AccountingError::RateLimited { operation, .. }
            | AccountingError::Auth { operation, .. }
            | AccountingError::Validation { operation, .. }
            | AccountingError::NotFound { operation, .. }
            | AccountingError::Server { operation, .. }
            | AccountingError::Network { operation, .. }
            | AccountingError::Unclassified { operation, .. } => operation,
        }
    }
}

impl Retryable for AccountingError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            AccountingError::RateLimited { .. }
                | AccountingError::Server { .. }
                | AccountingError::Network { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            AccountingError::RateLimited { retry_after, .. } => {
                Some(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WAIT))
            }
            _ => None,
        }
    }
}

/// Classify an upstream failure by HTTP status, falling back to message
/// keywords when no status is available.
pub fn classify(
    operation: &str,
    status: Option<u16>,
    message: &str,
    retry_after: Option<Duration>,
) -> AccountingError {
    let operation = operation.to_string();
    let message = redact_secrets(message);

    match status {
        Some(429) => AccountingError::RateLimited {
            operation,
            retry_after,
            message,
        },
        Some(401) | Some(403) => AccountingError::Auth { operation, message },
        Some(400) | Some(422) => AccountingError::Validation { operation, message },
        Some(404) => AccountingError::NotFound { operation, message },
        Some(status) if status >= 500 => AccountingError::Server {
            operation,
            status,
            message,
        },
        _ => {
            let lowered = message.to_lowercase();
            if lowered.contains("rate limit") || lowered.contains("too many requests") {
                AccountingError::RateLimited {
                    operation,
                    retry_after,
                    message,
                }
            } else if lowered.contains("unauthorized")
                || lowered.contains("forbidden")
                || lowered.contains("authentication")
            {
                AccountingError::Auth { operation, message }
            } else if lowered.contains("validation") || lowered.contains("invalid") {
                AccountingError::Validation { operation, message }
            } else if lowered.contains("not found") {
                AccountingError::NotFound { operation, message }
            } else if lowered.contains("connection")
                || lowered.contains("timeout")
                || lowered.contains("network")
                || lowered.contains("unreachable")
            {
                AccountingError::Network { operation, message }
            } else {
                AccountingError::Unclassified { operation, message }
            }
        }
    }
}

static BEARER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[a-z0-9._~+/=-]+").expect("static pattern compiles"));
static TOKEN_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(access_token|refresh_token|client_secret|api_key)=[^&\s]+")
        .expect("static pattern compiles")
});

/// Strip credentials from an upstream message before it is logged or stored.
pub fn redact_secrets(message: &str) -> String {
    let redacted = BEARER_TOKEN.replace_all(message, "Bearer [redacted]");
    TOKEN_PARAM
        .replace_all(&redacted, "$1=[redacted]")
        .into_owned()
}

/// Operations the billing core requires from the accounting system.
#[async_trait]
pub trait AccountingApi: Send + Sync {
    async fn list_customers(&self) -> Result<Vec<ApiCustomer>, AccountingError>;

    async fn list_items(&self) -> Result<Vec<ApiItem>, AccountingError>;

    async fn get_item(&self, item_id: &str) -> Result<Option<ApiItem>, AccountingError>;

    async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
    ) -> Result<ApiInvoice, AccountingError>;

    async fn find_invoice_by_doc_number(
        &self,
        doc_number: &str,
    ) -> Result<Option<ApiInvoice>, AccountingError>;
}
