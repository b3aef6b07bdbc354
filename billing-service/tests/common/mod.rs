//! Common test utilities: in-memory fakes for the invoice store and the
//! accounting system.

#![allow(dead_code)]

use async_trait::async_trait;
use billing_service::models::{
    BillableMark, BillingPeriod, Customer, InvoiceRecord, NewInvoiceRecord, RecordOutcome,
    ServiceClassMapping,
};
use billing_service::services::accounting::{
    AccountingApi, AccountingError, ApiCustomer, ApiInvoice, ApiItem, CreateInvoiceRequest,
};
use billing_service::services::InvoiceStore;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,billing_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Default)]
struct StoreState {
    customers: Vec<Customer>,
    marks: HashMap<Uuid, Vec<BillableMark>>,
    mappings: HashMap<String, ServiceClassMapping>,
    invoices: HashMap<String, InvoiceRecord>,
    suppress_key_lookup: bool,
}

/// In-memory invoice store.
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_customer(&self, external_id: &str, display_name: &str) -> Customer {
        let customer = Customer {
            customer_id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            is_active: true,
            last_synced_utc: Some(Utc::now()),
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        };
        self.state.lock().unwrap().customers.push(customer.clone());
        customer
    }

    pub fn add_mark(&self, customer_id: Uuid, entity_name: &str, service_class: &str, count: i32) {
        self.state
            .lock()
            .unwrap()
            .marks
            .entry(customer_id)
            .or_default()
            .push(BillableMark {
                entity_name: entity_name.to_string(),
                service_class: service_class.to_string(),
                highwater_count: count,
            });
    }

    pub fn add_mapping(&self, service_class: &str, item_id: &str, quota_gb: Option<i32>) {
        let mapping = ServiceClassMapping {
            mapping_id: Uuid::new_v4(),
            service_class: service_class.to_string(),
            item_id: item_id.to_string(),
            item_name: format!("Item {}", item_id),
            unit_price: Decimal::new(500, 2),
            quota_gb,
            description: None,
            is_active: true,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .mappings
            .insert(service_class.to_string(), mapping);
    }

    pub fn seed_invoice(
        &self,
        idempotency_key: &str,
        external_invoice_id: &str,
        customer_id: Uuid,
        total_amount: Decimal,
    ) {
        let record = InvoiceRecord {
            record_id: Uuid::new_v4(),
            external_invoice_id: external_invoice_id.to_string(),
            customer_id,
            billing_year: 2025,
            billing_month: 10,
            invoice_date: chrono::NaiveDate::from_ymd_opt(2025, 11, 1).unwrap(),
            total_amount,
            line_item_count: 1,
            status: "draft".to_string(),
            idempotency_key: idempotency_key.to_string(),
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .invoices
            .insert(idempotency_key.to_string(), record);
    }

    /// Make `find_invoice_by_key` miss, simulating a concurrent writer that
    /// commits between the lookup and the insert.
    pub fn suppress_key_lookup(&self) {
        self.state.lock().unwrap().suppress_key_lookup = true;
    }

    pub fn recorded_invoice_count(&self) -> usize {
        self.state.lock().unwrap().invoices.len()
    }

    pub fn recorded_invoice(&self, idempotency_key: &str) -> Option<InvoiceRecord> {
        self.state
            .lock()
            .unwrap()
            .invoices
            .get(idempotency_key)
            .cloned()
    }
}

#[async_trait]
impl InvoiceStore for FakeStore {
    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .customers
            .iter()
            .find(|c| c.customer_id == customer_id)
            .cloned())
    }

    async fn customers_with_billable_usage(
        &self,
        _period: BillingPeriod,
    ) -> Result<Vec<Customer>, AppError> {
        let state = self.state.lock().unwrap();
        let mut customers: Vec<Customer> = state
            .customers
            .iter()
            .filter(|c| state.marks.get(&c.customer_id).is_some_and(|m| !m.is_empty()))
            .cloned()
            .collect();
        customers.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(customers)
    }

    async fn billable_marks_for_customer(
        &self,
        customer_id: Uuid,
        _period: BillingPeriod,
    ) -> Result<Vec<BillableMark>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .marks
            .get(&customer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mapping_for_service_class(
        &self,
        service_class: &str,
    ) -> Result<Option<ServiceClassMapping>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .mappings
            .get(service_class)
            .cloned())
    }

    async fn find_invoice_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<InvoiceRecord>, AppError> {
        let state = self.state.lock().unwrap();
        if state.suppress_key_lookup {
            return Ok(None);
        }
        Ok(state.invoices.get(idempotency_key).cloned())
    }

    async fn record_invoice(&self, record: NewInvoiceRecord) -> Result<RecordOutcome, AppError> {
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state.invoices.get(&record.idempotency_key) {
            return Ok(RecordOutcome::AlreadyExists(existing.clone()));
        }

        let stored = InvoiceRecord {
            record_id: Uuid::new_v4(),
            external_invoice_id: record.external_invoice_id,
            customer_id: record.customer_id,
            billing_year: record.billing_year,
            billing_month: record.billing_month,
            invoice_date: record.invoice_date,
            total_amount: record.total_amount,
            line_item_count: record.line_item_count,
            status: record.status.as_str().to_string(),
            idempotency_key: record.idempotency_key.clone(),
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        };
        state
            .invoices
            .insert(record.idempotency_key, stored.clone());
        Ok(RecordOutcome::Created(stored))
    }
}

#[derive(Default)]
struct ApiState {
    customers: Vec<ApiCustomer>,
    items: HashMap<String, ApiItem>,
    create_errors: VecDeque<AccountingError>,
    orphan: Option<ApiInvoice>,
    created: Vec<ApiInvoice>,
    create_calls: u32,
    find_calls: u32,
    next_id: u32,
}

/// In-memory accounting system.
#[derive(Clone, Default)]
pub struct FakeApi {
    state: Arc<Mutex<ApiState>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, item_id: &str, unit_price: Decimal, is_active: bool) {
        self.state.lock().unwrap().items.insert(
            item_id.to_string(),
            ApiItem {
                id: item_id.to_string(),
                name: format!("Item {}", item_id),
                unit_price,
                is_active,
            },
        );
    }

    pub fn add_customer(&self, id: &str, display_name: &str) {
        self.state.lock().unwrap().customers.push(ApiCustomer {
            id: id.to_string(),
            display_name: display_name.to_string(),
            is_active: true,
        });
    }

    /// Queue an error for the next create_invoice call(s).
    pub fn queue_create_error(&self, error: AccountingError) {
        self.state.lock().unwrap().create_errors.push_back(error);
    }

    /// Pretend an invoice with this doc number already exists upstream.
    pub fn set_orphan(&self, invoice: ApiInvoice) {
        self.state.lock().unwrap().orphan = Some(invoice);
    }

    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    pub fn find_calls(&self) -> u32 {
        self.state.lock().unwrap().find_calls
    }

    pub fn created_invoices(&self) -> Vec<ApiInvoice> {
        self.state.lock().unwrap().created.clone()
    }
}

#[async_trait]
impl AccountingApi for FakeApi {
    async fn list_customers(&self) -> Result<Vec<ApiCustomer>, AccountingError> {
        Ok(self.state.lock().unwrap().customers.clone())
    }

    async fn list_items(&self) -> Result<Vec<ApiItem>, AccountingError> {
        Ok(self.state.lock().unwrap().items.values().cloned().collect())
    }

    async fn get_item(&self, item_id: &str) -> Result<Option<ApiItem>, AccountingError> {
        Ok(self.state.lock().unwrap().items.get(item_id).cloned())
    }

    async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
    ) -> Result<ApiInvoice, AccountingError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;

        if let Some(error) = state.create_errors.pop_front() {
            return Err(error);
        }

        // The accounting system totals lines from its own item prices.
        let total_amount = request
            .lines
            .iter()
            .map(|line| {
                let unit_price = state
                    .items
                    .get(&line.item_id)
                    .map(|item| item.unit_price)
                    .unwrap_or(Decimal::ZERO);
                unit_price * Decimal::from(line.quantity)
            })
            .sum();

        state.next_id += 1;
        let invoice = ApiInvoice {
            id: format!("inv-{}", 1000 + state.next_id),
            total_amount,
        };
        state.created.push(invoice.clone());
        Ok(invoice)
    }

    async fn find_invoice_by_doc_number(
        &self,
        _doc_number: &str,
    ) -> Result<Option<ApiInvoice>, AccountingError> {
        let mut state = self.state.lock().unwrap();
        state.find_calls += 1;
        Ok(state.orphan.clone())
    }
}
