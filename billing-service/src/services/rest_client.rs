//! REST client for the external accounting system.
//!
//! Thin HTTP binding for the [`AccountingApi`] contract; every failure is
//! classified through the accounting error taxonomy before it surfaces.

use crate::config::AccountingConfig;
use crate::services::accounting::{
    classify, AccountingApi, AccountingError, ApiCustomer, ApiInvoice, ApiItem,
    CreateInvoiceRequest,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Client for the accounting system's REST API.
#[derive(Clone)]
pub struct RestAccountingClient {
    client: Client,
    config: AccountingConfig,
}

impl RestAccountingClient {
    pub fn new(config: AccountingConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Check if credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.base_url.is_empty() && !self.config.api_token.expose_secret().is_empty()
    }

    fn ensure_configured(&self, operation: &str) -> Result<(), AccountingError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(AccountingError::Auth {
                operation: operation.to_string(),
                message: "accounting API credentials not configured".to_string(),
            })
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request_error(operation: &str, error: reqwest::Error) -> AccountingError {
        let message = if error.is_timeout() || error.is_connect() {
            format!("network: {}", error)
        } else {
            error.to_string()
        };
        classify(operation, None, &message, None)
    }

    async fn read_failure(operation: &str, response: Response) -> AccountingError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        tracing::warn!(
            operation = operation,
            status = %status,
            body = %body,
            "Accounting API call failed"
        );

        classify(operation, Some(status.as_u16()), &body, retry_after)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<T, AccountingError> {
        self.ensure_configured(operation)?;

        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(self.config.api_token.expose_secret())
            .send()
            .await
            .map_err(|e| Self::request_error(operation, e))?;

        if !response.status().is_success() {
            return Err(Self::read_failure(operation, response).await);
        }

        response
            .json()
            .await
            .map_err(|e| Self::request_error(operation, e))
    }
}

#[async_trait]
impl AccountingApi for RestAccountingClient {
    async fn list_customers(&self) -> Result<Vec<ApiCustomer>, AccountingError> {
        self.get_json("list_customers", "/customers").await
    }

    async fn list_items(&self) -> Result<Vec<ApiItem>, AccountingError> {
        self.get_json("list_items", "/items").await
    }

    async fn get_item(&self, item_id: &str) -> Result<Option<ApiItem>, AccountingError> {
        let operation = "get_item";
        self.ensure_configured(operation)?;

        let response = self
            .client
            .get(self.url(&format!("/items/{}", item_id)))
            .bearer_auth(self.config.api_token.expose_secret())
            .send()
            .await
            .map_err(|e| Self::request_error(operation, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::read_failure(operation, response).await);
        }

        let item = response
            .json()
            .await
            .map_err(|e| Self::request_error(operation, e))?;
        Ok(Some(item))
    }

    async fn create_invoice(
        &self,
        request: &CreateInvoiceRequest,
    ) -> Result<ApiInvoice, AccountingError> {
        let operation = "create_invoice";
        self.ensure_configured(operation)?;

        let response = self
            .client
            .post(self.url("/invoices"))
            .bearer_auth(self.config.api_token.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| Self::request_error(operation, e))?;

        if !response.status().is_success() {
            return Err(Self::read_failure(operation, response).await);
        }

        let invoice: ApiInvoice = response
            .json()
            .await
            .map_err(|e| Self::request_error(operation, e))?;

        tracing::info!(
            invoice_id = %invoice.id,
            total_amount = %invoice.total_amount,
            customer_id = %request.customer_id,
            "Invoice created in accounting system"
        );

        Ok(invoice)
    }

    async fn find_invoice_by_doc_number(
        &self,
        doc_number: &str,
    ) -> Result<Option<ApiInvoice>, AccountingError> {
        let matches: Vec<ApiInvoice> = self
            .get_json(
                "find_invoice_by_doc_number",
                &format!("/invoices?doc_number={}", doc_number),
            )
            .await?;

        Ok(matches.into_iter().next())
    }
}
