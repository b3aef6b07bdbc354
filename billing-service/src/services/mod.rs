//! Services module for billing-service.

pub mod accounting;
pub mod database;
pub mod detector;
pub mod exclusions;
pub mod highwater;
pub mod invoicing;
pub mod mapping;
pub mod rest_client;
pub mod run;
pub mod source;

pub use accounting::{
    AccountingApi, AccountingError, ApiCustomer, ApiInvoice, ApiItem, CreateInvoiceRequest,
    InvoiceLine,
};
pub use database::Database;
pub use exclusions::ExclusionFilter;
pub use invoicing::{idempotency_key, InvoiceError, InvoiceGenerator, InvoiceStore};
pub use mapping::MappingService;
pub use rest_client::RestAccountingClient;
pub use run::{BillingRunner, RunOutcome};
pub use source::{JsonReportSource, SnapshotSource};
