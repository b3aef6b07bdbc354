//! Invoice generation behavior against in-memory collaborators.

mod common;

use billing_service::models::BillingPeriod;
use billing_service::services::accounting::{AccountingError, ApiInvoice};
use billing_service::services::invoicing::{idempotency_key, InvoiceGenerator};
use common::{init_tracing, FakeApi, FakeStore};
use rust_decimal::Decimal;
use service_core::retry::RetryPolicy;
use std::time::Duration;

fn period() -> BillingPeriod {
    BillingPeriod::new(2025, 10).unwrap()
}

fn generator(store: &FakeStore, api: &FakeApi) -> InvoiceGenerator<FakeStore, FakeApi> {
    InvoiceGenerator::new(
        store.clone(),
        api.clone(),
        RetryPolicy::quick(),
        "Hosted Email Services".to_string(),
    )
}

#[tokio::test]
async fn test_invoice_created_and_recorded() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "customer-50gb", 15);
    store.add_mapping("customer-50gb", "item-50", Some(50));
    api.add_item("item-50", Decimal::new(500, 2), true);

    let invoice_id = generator(&store, &api)
        .generate_for_customer(customer.customer_id, period())
        .await
        .unwrap()
        .expect("billable usage must produce an invoice");

    assert_eq!(api.create_calls(), 1);
    assert_eq!(store.recorded_invoice_count(), 1);

    let key = idempotency_key("cust-1", period());
    let record = store.recorded_invoice(&key).unwrap();
    assert_eq!(record.external_invoice_id, invoice_id);
    assert_eq!(record.line_item_count, 1);
    // 15 accounts at $5.00, priced by the accounting system
    assert_eq!(record.total_amount, Decimal::new(7500, 2));
}

#[tokio::test]
async fn test_second_generation_reuses_invoice_without_external_call() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "customer-50gb", 15);
    store.add_mapping("customer-50gb", "item-50", Some(50));
    api.add_item("item-50", Decimal::new(500, 2), true);

    let generator = generator(&store, &api);

    let first = generator
        .generate_for_customer(customer.customer_id, period())
        .await
        .unwrap();
    let second = generator
        .generate_for_customer(customer.customer_id, period())
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(api.create_calls(), 1);
    assert_eq!(api.find_calls(), 1);
    assert_eq!(store.recorded_invoice_count(), 1);
}

#[tokio::test]
async fn test_zero_billable_usage_produces_no_invoice() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");

    let result = generator(&store, &api)
        .generate_for_customer(customer.customer_id, period())
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(api.create_calls(), 0);
    assert_eq!(store.recorded_invoice_count(), 0);
}

#[tokio::test]
async fn test_unmapped_service_class_skips_line() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "unmapped-class", 9);

    let result = generator(&store, &api)
        .generate_for_customer(customer.customer_id, period())
        .await
        .unwrap();

    // The only mark has no mapping, so no lines and no invoice.
    assert!(result.is_none());
    assert_eq!(api.create_calls(), 0);
}

#[tokio::test]
async fn test_quota_annotation_in_line_description() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "customer-50gb", 3);
    store.add_mapping("customer-50gb", "item-50", Some(50));
    api.add_item("item-50", Decimal::new(500, 2), true);

    generator(&store, &api)
        .generate_for_customer(customer.customer_id, period())
        .await
        .unwrap();

    // Description formatting is visible in the preview path too, but the
    // created invoice's total proves the line carried quantity 3.
    let created = api.created_invoices();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].total_amount, Decimal::new(1500, 2));
}

#[tokio::test]
async fn test_batch_isolates_per_customer_failures() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let failing = store.add_customer("cust-1", "Alpha LLC");
    let healthy = store.add_customer("cust-2", "Beta GmbH");
    store.add_mark(failing.customer_id, "mail.alpha.com", "customer-20gb", 4);
    store.add_mark(healthy.customer_id, "mail.beta.de", "customer-20gb", 6);
    store.add_mapping("customer-20gb", "item-20", Some(20));
    api.add_item("item-20", Decimal::new(300, 2), true);

    // Customers process in display-name order: Alpha hits the queued
    // validation error, Beta succeeds.
    api.queue_create_error(AccountingError::Validation {
        operation: "create_invoice".to_string(),
        message: "line item rejected".to_string(),
    });

    let result = generator(&store, &api).generate_all(period()).await.unwrap();

    assert_eq!(result.succeeded.len(), 1);
    assert_eq!(result.succeeded[0].customer_id, healthy.customer_id);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].customer_id, failing.customer_id);
    assert!(result.failed[0].error.contains("validation"));
}

#[tokio::test]
async fn test_validation_error_is_never_retried() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "customer-50gb", 1);
    store.add_mapping("customer-50gb", "item-50", None);

    api.queue_create_error(AccountingError::Validation {
        operation: "create_invoice".to_string(),
        message: "malformed request".to_string(),
    });

    let result = generator(&store, &api)
        .generate_for_customer(customer.customer_id, period())
        .await;

    assert!(result.is_err());
    assert_eq!(api.create_calls(), 1);
    assert_eq!(store.recorded_invoice_count(), 0);
}

#[tokio::test]
async fn test_rate_limit_retries_up_to_configured_maximum() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "customer-50gb", 1);
    store.add_mapping("customer-50gb", "item-50", None);

    for _ in 0..3 {
        api.queue_create_error(AccountingError::RateLimited {
            operation: "create_invoice".to_string(),
            retry_after: Some(Duration::from_millis(5)),
            message: "slow down".to_string(),
        });
    }

    let generator = InvoiceGenerator::new(
        store.clone(),
        api.clone(),
        RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::quick()
        },
        "Hosted Email Services".to_string(),
    );

    let result = generator
        .generate_for_customer(customer.customer_id, period())
        .await;

    assert!(result.is_err());
    // Initial attempt plus two retries, each honoring the suggested wait.
    assert_eq!(api.create_calls(), 3);
}

#[tokio::test]
async fn test_rate_limit_recovery_creates_invoice() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "customer-50gb", 2);
    store.add_mapping("customer-50gb", "item-50", None);
    api.add_item("item-50", Decimal::new(400, 2), true);

    api.queue_create_error(AccountingError::RateLimited {
        operation: "create_invoice".to_string(),
        retry_after: Some(Duration::from_millis(5)),
        message: "slow down".to_string(),
    });

    let result = generator(&store, &api)
        .generate_for_customer(customer.customer_id, period())
        .await
        .unwrap();

    assert!(result.is_some());
    assert_eq!(api.create_calls(), 2);
    assert_eq!(store.recorded_invoice_count(), 1);
}

#[tokio::test]
async fn test_adopts_orphaned_upstream_invoice() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "customer-50gb", 5);
    store.add_mapping("customer-50gb", "item-50", None);

    // A previous run created this invoice upstream but died before the
    // local history write.
    api.set_orphan(ApiInvoice {
        id: "inv-orphan".to_string(),
        total_amount: Decimal::new(2500, 2),
    });

    let result = generator(&store, &api)
        .generate_for_customer(customer.customer_id, period())
        .await
        .unwrap();

    assert_eq!(result.as_deref(), Some("inv-orphan"));
    assert_eq!(api.create_calls(), 0);
    assert_eq!(store.recorded_invoice_count(), 1);
}

#[tokio::test]
async fn test_concurrent_writer_with_same_total_is_adopted() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "customer-50gb", 10);
    store.add_mapping("customer-50gb", "item-50", None);
    api.add_item("item-50", Decimal::new(100, 2), true);

    let key = idempotency_key("cust-1", period());
    // Same total the accounting fake will compute: 10 x $1.00.
    store.seed_invoice(&key, "inv-racer", customer.customer_id, Decimal::new(1000, 2));
    store.suppress_key_lookup();

    let result = generator(&store, &api)
        .generate_for_customer(customer.customer_id, period())
        .await
        .unwrap();

    assert_eq!(result.as_deref(), Some("inv-racer"));
}

#[tokio::test]
async fn test_key_collision_with_different_total_is_loud() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "customer-50gb", 10);
    store.add_mapping("customer-50gb", "item-50", None);
    api.add_item("item-50", Decimal::new(100, 2), true);

    let key = idempotency_key("cust-1", period());
    store.seed_invoice(&key, "inv-racer", customer.customer_id, Decimal::new(9999, 2));
    store.suppress_key_lookup();

    let result = generator(&store, &api)
        .generate_for_customer(customer.customer_id, period())
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_preview_resolves_current_prices_upstream() {
    init_tracing();
    let store = FakeStore::new();
    let api = FakeApi::new();

    let customer = store.add_customer("cust-1", "Acme Corp");
    store.add_mark(customer.customer_id, "mail.acme.com", "customer-50gb", 4);
    // Cached mapping price is $5.00 but the item now costs $7.00 upstream;
    // the preview must use the current price.
    store.add_mapping("customer-50gb", "item-50", Some(50));
    api.add_item("item-50", Decimal::new(700, 2), true);

    let preview = generator(&store, &api)
        .preview_for_customer(customer.customer_id, period())
        .await
        .unwrap();

    assert_eq!(preview.lines.len(), 1);
    assert_eq!(preview.lines[0].unit_price, Decimal::new(700, 2));
    assert_eq!(preview.total_amount, Decimal::new(2800, 2));
    assert_eq!(api.create_calls(), 0);
    assert_eq!(store.recorded_invoice_count(), 0);
}
