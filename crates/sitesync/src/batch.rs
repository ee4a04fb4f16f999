//! One pass over every enabled source, with continue-on-error semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::SourceRecord;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::store::{ItemRepository, SourceRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    NotModified,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub source_id: String,
    pub name: String,
    pub status: SourceStatus,
    pub items: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SourceReport {
    fn new(record: &SourceRecord, status: SourceStatus) -> Self {
        Self {
            source_id: record.source.id.clone(),
            name: record.source.name.clone(),
            status,
            items: 0,
            message: None,
        }
    }

    fn failed(record: &SourceRecord, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(record, SourceStatus::Error)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub completed_at: DateTime<Utc>,
    pub results: Vec<SourceReport>,
}

impl BatchReport {
    pub fn count(&self, status: SourceStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Syncs every enabled source in name order and persists what changed.
///
/// A failing source is reported and the pass moves on; nothing is persisted for it.
/// Cancellation ends the pass after the source in flight.
pub async fn run_all(
    engine: &SyncEngine,
    sources: &dyn SourceRepository,
    items: &dyn ItemRepository,
    cancel: &CancellationToken,
) -> Result<BatchReport, SyncError> {
    let mut records: Vec<SourceRecord> = sources
        .list()
        .await?
        .into_iter()
        .filter(|record| record.enabled)
        .collect();
    records.sort_by(|a, b| a.source.name.cmp(&b.source.name));

    let mut results = Vec::with_capacity(records.len());
    for record in &records {
        if cancel.is_cancelled() {
            tracing::info!("Batch cancelled before source {}", record.source.id);
            break;
        }

        if record.source.base_url.is_none() {
            tracing::warn!(
                "Source {} has an invalid base url '{}'",
                record.source.id,
                record.raw_base_url
            );
            results.push(SourceReport::failed(
                record,
                format!("invalid base url '{}'", record.raw_base_url),
            ));
            continue;
        }

        let report = sync_one(engine, sources, items, record, cancel).await;
        let cancelled = matches!(&report, Err(SyncError::Cancelled));
        results.push(match report {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Sync failed for source {}: {}", record.source.id, e);
                SourceReport::failed(record, e.to_string())
            }
        });
        if cancelled {
            break;
        }
    }

    Ok(BatchReport {
        completed_at: Utc::now(),
        results,
    })
}

async fn sync_one(
    engine: &SyncEngine,
    sources: &dyn SourceRepository,
    items: &dyn ItemRepository,
    record: &SourceRecord,
    cancel: &CancellationToken,
) -> Result<SourceReport, SyncError> {
    let result = match engine.sync(&record.source, cancel).await {
        Ok(result) => result,
        Err(SyncError::NotModified) => {
            return Ok(SourceReport::new(record, SourceStatus::NotModified));
        }
        Err(e) => return Err(e),
    };

    if !result.items.is_empty() {
        items.upsert(&result.items).await?;
    }
    sources
        .update_sync_state(
            &record.source.id,
            result.etag.clone(),
            result.last_modified,
            result.fetched_at,
        )
        .await?;

    Ok(SourceReport {
        items: result.items.len(),
        ..SourceReport::new(record, SourceStatus::Ok)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serializes_camel_case() {
        let report = BatchReport {
            completed_at: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            results: vec![SourceReport {
                source_id: "blog".to_string(),
                name: "Blog".to_string(),
                status: SourceStatus::NotModified,
                items: 0,
                message: None,
            }],
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["completedAt"], "2024-01-01T00:00:00Z");
        assert_eq!(json["results"][0]["sourceId"], "blog");
        assert_eq!(json["results"][0]["status"], "not_modified");
        assert!(json["results"][0].get("message").is_none());
        assert_eq!(report.count(SourceStatus::NotModified), 1);
    }
}
