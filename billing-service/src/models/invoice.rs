//! Invoice record model and batch results.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "issued" => InvoiceStatus::Issued,
            "paid" => InvoiceStatus::Paid,
            "void" => InvoiceStatus::Void,
            _ => InvoiceStatus::Draft,
        }
    }
}

/// Record of an invoice created in the accounting system.
///
/// The unique `idempotency_key` is the sole mechanism preventing duplicate
/// invoice creation for a (customer, period) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceRecord {
    pub record_id: Uuid,
    pub external_invoice_id: String,
    pub customer_id: Uuid,
    pub billing_year: i32,
    pub billing_month: i32,
    pub invoice_date: NaiveDate,
    pub total_amount: Decimal,
    pub line_item_count: i32,
    pub status: String,
    pub idempotency_key: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for recording a created invoice.
#[derive(Debug, Clone)]
pub struct NewInvoiceRecord {
    pub external_invoice_id: String,
    pub customer_id: Uuid,
    pub billing_year: i32,
    pub billing_month: i32,
    pub invoice_date: NaiveDate,
    pub total_amount: Decimal,
    pub line_item_count: i32,
    pub status: InvoiceStatus,
    pub idempotency_key: String,
}

/// Outcome of persisting an invoice record.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Created(InvoiceRecord),
    /// The idempotency key was already present; carries the existing row.
    AlreadyExists(InvoiceRecord),
}

/// Per-customer success in a batch invoicing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceSuccess {
    pub customer_id: Uuid,
    pub external_invoice_id: String,
}

/// Per-customer failure in a batch invoicing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceFailure {
    pub customer_id: Uuid,
    pub error: String,
}

/// Partitioned result of a batch invoicing run.
///
/// `skipped` holds customers with no billable lines; no customer's failure
/// blocks another's processing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceBatchResult {
    pub succeeded: Vec<InvoiceSuccess>,
    pub skipped: Vec<Uuid>,
    pub failed: Vec<InvoiceFailure>,
}

impl InvoiceBatchResult {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
