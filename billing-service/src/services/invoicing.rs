//! Idempotent invoice generation.
//!
//! At most one invoice per (customer, billing period), enforced solely by
//! the deterministic idempotency key and its unique constraint in the
//! store. Upstream failures are classified and retried per policy;
//! per-customer failures never block the rest of a batch.

use crate::models::{
    BillableMark, BillingPeriod, Customer, InvoiceBatchResult, InvoiceFailure, InvoiceRecord,
    InvoiceStatus, InvoiceSuccess, NewInvoiceRecord, RecordOutcome, ServiceClassMapping,
};
use crate::services::accounting::{
    AccountingApi, AccountingError, CreateInvoiceRequest, InvoiceLine,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use service_core::retry::RetryPolicy;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Persisted state the invoice generator reads and writes.
///
/// Implemented by `Database`; tests substitute in-memory fakes.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError>;

    async fn customers_with_billable_usage(
        &self,
        period: BillingPeriod,
    ) -> Result<Vec<Customer>, AppError>;

    async fn billable_marks_for_customer(
        &self,
        customer_id: Uuid,
        period: BillingPeriod,
    ) -> Result<Vec<BillableMark>, AppError>;

    async fn mapping_for_service_class(
        &self,
        service_class: &str,
    ) -> Result<Option<ServiceClassMapping>, AppError>;

    async fn find_invoice_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<InvoiceRecord>, AppError>;

    async fn record_invoice(&self, record: NewInvoiceRecord) -> Result<RecordOutcome, AppError>;
}

/// Failure generating one customer's invoice.
#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error(transparent)]
    Store(#[from] AppError),

    #[error(transparent)]
    Api(#[from] AccountingError),
}

/// Deterministic idempotency key for one (customer, period) invoice.
///
/// SHA-256 over `external_id|year|month`, truncated for fixed length and
/// prefixed with the period for human readability.
pub fn idempotency_key(external_customer_id: &str, period: BillingPeriod) -> String {
    let seed = format!(
        "{}|{}|{:02}",
        external_customer_id,
        period.year(),
        period.month()
    );
    let digest = hex::encode(Sha256::digest(seed.as_bytes()));
    format!(
        "inv_{}{:02}_{}",
        period.year(),
        period.month(),
        &digest[..32]
    )
}

/// One line of an invoice preview with locally resolved pricing.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewLine {
    pub entity_name: String,
    pub service_class: String,
    pub quota_gb: Option<i32>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

/// Read-only preview of what an invoice would contain.
#[derive(Debug, Clone, Serialize)]
pub struct InvoicePreview {
    pub customer_id: Uuid,
    pub customer_name: String,
    pub period: BillingPeriod,
    pub lines: Vec<PreviewLine>,
    pub total_amount: Decimal,
}

/// Generates invoices in the accounting system from billable usage.
pub struct InvoiceGenerator<S, A> {
    store: S,
    api: A,
    retry: RetryPolicy,
    memo_prefix: String,
}

impl<S, A> InvoiceGenerator<S, A>
where
    S: InvoiceStore,
    A: AccountingApi,
{
    pub fn new(store: S, api: A, retry: RetryPolicy, memo_prefix: String) -> Self {
        Self {
            store,
            api,
            retry,
            memo_prefix,
        }
    }

    /// Generate the invoice for one customer and period.
    ///
    /// Returns the external invoice id, or `None` when the customer has no
    /// billable usage. Calling this twice for the same (customer, period)
    /// returns the first call's invoice id without another external call.
    #[instrument(skip(self), fields(customer_id = %customer_id, period = %period))]
    pub async fn generate_for_customer(
        &self,
        customer_id: Uuid,
        period: BillingPeriod,
    ) -> Result<Option<String>, InvoiceError> {
        let customer = self
            .store
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Customer {} not found", customer_id))
            })?;

        let key = idempotency_key(&customer.external_id, period);

        if let Some(existing) = self.store.find_invoice_by_key(&key).await? {
            info!(
                invoice_id = %existing.external_invoice_id,
                "Invoice already recorded for this period, skipping creation"
            );
            return Ok(Some(existing.external_invoice_id));
        }

        let lines = self.assemble_lines(customer_id, period).await?;
        if lines.is_empty() {
            info!("No billable usage, no invoice");
            return Ok(None);
        }
        let line_count = lines.len() as i32;

        // An invoice may exist upstream without a local record when a prior
        // run died between the external call and the history write. Adopt it
        // instead of creating a duplicate.
        let orphan = self
            .retry
            .execute("find_invoice_by_doc_number", || async {
                self.api.find_invoice_by_doc_number(&key).await
            })
            .await?;

        let invoice = match orphan {
            Some(existing) => {
                warn!(
                    invoice_id = %existing.id,
                    "Adopting invoice found upstream with no local record"
                );
                existing
            }
            None => {
                let request = CreateInvoiceRequest {
                    customer_id: customer.external_id.clone(),
                    lines,
                    invoice_date: period.invoice_date(),
                    memo: format!(
                        "{} - {} {}",
                        self.memo_prefix,
                        period.month_name(),
                        period.year()
                    ),
                    doc_number: Some(key.clone()),
                };

                self.retry
                    .execute("create_invoice", || async {
                        self.api.create_invoice(&request).await
                    })
                    .await?
            }
        };

        let record = NewInvoiceRecord {
            external_invoice_id: invoice.id.clone(),
            customer_id,
            billing_year: period.year(),
            billing_month: period.month() as i32,
            invoice_date: period.invoice_date(),
            total_amount: invoice.total_amount,
            line_item_count: line_count,
            status: InvoiceStatus::Draft,
            idempotency_key: key.clone(),
        };

        match self.store.record_invoice(record).await? {
            RecordOutcome::Created(created) => {
                info!(
                    invoice_id = %created.external_invoice_id,
                    total_amount = %created.total_amount,
                    line_items = line_count,
                    "Invoice recorded"
                );
                Ok(Some(created.external_invoice_id))
            }
            RecordOutcome::AlreadyExists(existing) => {
                if existing.total_amount != invoice.total_amount {
                    error!(
                        idempotency_key = %key,
                        existing_total = %existing.total_amount,
                        new_total = %invoice.total_amount,
                        "Idempotency key already recorded with a different total"
                    );
                    return Err(InvoiceError::Store(AppError::Conflict(anyhow::anyhow!(
                        "Idempotency key {} exists with total {} but invoice {} totals {}",
                        key,
                        existing.total_amount,
                        invoice.id,
                        invoice.total_amount
                    ))));
                }

                info!(
                    invoice_id = %existing.external_invoice_id,
                    "Concurrent writer recorded this invoice first, treating as existing"
                );
                Ok(Some(existing.external_invoice_id))
            }
        }
    }

    /// Preview one customer's invoice without creating anything.
    ///
    /// Unlike generation, this resolves current unit prices from the
    /// accounting system so the preview totals what the system would charge.
    pub async fn preview_for_customer(
        &self,
        customer_id: Uuid,
        period: BillingPeriod,
    ) -> Result<InvoicePreview, InvoiceError> {
        let customer = self
            .store
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Customer {} not found", customer_id))
            })?;

        let marks = self
            .store
            .billable_marks_for_customer(customer_id, period)
            .await?;

        let mut lines = Vec::new();
        let mut total_amount = Decimal::ZERO;

        for mark in marks {
            let Some(mapping) = self
                .store
                .mapping_for_service_class(&mark.service_class)
                .await?
            else {
                continue;
            };

            let item = self
                .retry
                .execute("get_item", || async {
                    self.api.get_item(&mapping.item_id).await
                })
                .await?;
            let unit_price = item.map(|i| i.unit_price).unwrap_or(Decimal::ZERO);
            let amount = unit_price * Decimal::from(mark.highwater_count);
            total_amount += amount;

            lines.push(PreviewLine {
                entity_name: mark.entity_name,
                service_class: mark.service_class,
                quota_gb: mapping.quota_gb,
                quantity: mark.highwater_count,
                unit_price,
                amount,
            });
        }

        Ok(InvoicePreview {
            customer_id,
            customer_name: customer.display_name,
            period,
            lines,
            total_amount,
        })
    }

    /// Generate invoices for every customer with billable usage this period.
    ///
    /// Returns a partitioned result; one customer's failure never blocks
    /// another's processing.
    #[instrument(skip(self), fields(period = %period))]
    pub async fn generate_all(
        &self,
        period: BillingPeriod,
    ) -> Result<InvoiceBatchResult, AppError> {
        let customers = self.store.customers_with_billable_usage(period).await?;
        info!(
            customers = customers.len(),
            "Generating invoices for all customers with billable usage"
        );

        let mut result = InvoiceBatchResult::default();

        for customer in customers {
            match self.generate_for_customer(customer.customer_id, period).await {
                Ok(Some(invoice_id)) => result.succeeded.push(InvoiceSuccess {
                    customer_id: customer.customer_id,
                    external_invoice_id: invoice_id,
                }),
                Ok(None) => result.skipped.push(customer.customer_id),
                Err(e) => {
                    error!(
                        customer_id = %customer.customer_id,
                        error = %e,
                        "Invoice generation failed"
                    );
                    result.failed.push(InvoiceFailure {
                        customer_id: customer.customer_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            succeeded = result.succeeded.len(),
            skipped = result.skipped.len(),
            failed = result.failed.len(),
            "Invoice generation complete"
        );

        Ok(result)
    }

    async fn assemble_lines(
        &self,
        customer_id: Uuid,
        period: BillingPeriod,
    ) -> Result<Vec<InvoiceLine>, AppError> {
        let marks = self
            .store
            .billable_marks_for_customer(customer_id, period)
            .await?;

        let mut lines = Vec::with_capacity(marks.len());
        for mark in marks {
            let Some(mapping) = self
                .store
                .mapping_for_service_class(&mark.service_class)
                .await?
            else {
                warn!(
                    service_class = %mark.service_class,
                    entity = %mark.entity_name,
                    "No active mapping for service class, skipping line"
                );
                continue;
            };

            let mut description = format!("{} - {}", mark.entity_name, mark.service_class);
            if let Some(quota) = mapping.quota_gb {
                description.push_str(&format!(" ({}GB)", quota));
            }

            lines.push(InvoiceLine {
                item_id: mapping.item_id,
                quantity: mark.highwater_count,
                description,
            });
        }

        Ok(lines)
    }
}
