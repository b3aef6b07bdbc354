//! Snapshot sources: where usage reports come from.

use crate::models::{BillingPeriod, UsageReport};
use async_trait::async_trait;
use service_core::error::AppError;
use std::path::PathBuf;
use tracing::info;

/// Yields the usage reports observed during a billing period.
///
/// The pipeline does not care how reports are obtained; tests use
/// fixtures, production reads pre-fetched report files.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_reports(&self, period: BillingPeriod) -> Result<Vec<UsageReport>, AppError>;
}

/// Reads report files from a local directory.
///
/// Files are JSON arrays of usage reports named `usage-YYYYMM*.json`;
/// everything matching the requested period is loaded and merged.
pub struct JsonReportSource {
    dir: PathBuf,
}

impl JsonReportSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SnapshotSource for JsonReportSource {
    async fn fetch_reports(&self, period: BillingPeriod) -> Result<Vec<UsageReport>, AppError> {
        let prefix = format!("usage-{}{:02}", period.year(), period.month());
        let mut reports = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.starts_with(&prefix) || !file_name.ends_with(".json") {
                continue;
            }

            let contents = tokio::fs::read_to_string(entry.path()).await?;
            let mut parsed: Vec<UsageReport> = serde_json::from_str(&contents).map_err(|e| {
                AppError::BadRequest(anyhow::anyhow!(
                    "Malformed report file {}: {}",
                    file_name,
                    e
                ))
            })?;

            info!(
                file = %file_name,
                reports = parsed.len(),
                "Loaded usage report file"
            );
            reports.append(&mut parsed);
        }

        reports.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then_with(|| a.entity_name.cmp(&b.entity_name))
        });
        Ok(reports)
    }
}
