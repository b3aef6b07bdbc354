//! Domain models for billing-service.

mod change_log;
mod customer;
mod entity;
mod exclusion;
mod invoice;
mod period;
mod reconciliation;
mod service_class;
mod usage;

pub use change_log::{ChangeLogEntry, NewChangeLogEntry};
pub use customer::Customer;
pub use entity::{Entity, EntityEvent, EntityHistoryEvent};
pub use exclusion::{ExclusionPattern, PatternType};
pub use invoice::{
    InvoiceBatchResult, InvoiceFailure, InvoiceRecord, InvoiceStatus, InvoiceSuccess,
    NewInvoiceRecord, RecordOutcome,
};
pub use period::BillingPeriod;
pub use reconciliation::{ChangeReport, MappingIssues, MappingState};
pub use service_class::{parse_quota_gb, NewServiceClassMapping, ServiceClassMapping};
pub use usage::{
    BillableMark, HighwaterMark, NewHighwaterMark, ObservedUsage, UsageReport, UsageSnapshot,
};
