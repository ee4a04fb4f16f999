use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Snapshot of an external source, read once at the start of a sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub name: String,
    pub base_url: Option<Url>,
    pub source_type: String,
    /// Validators stored after the previous successful sync.
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl Source {
    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.etag.clone(),
            last_modified: self.last_modified,
        }
    }
}

/// HTTP cache validators, sent as `If-None-Match`/`If-Modified-Since` and read back from
/// `ETag`/`Last-Modified`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Project,
    Service,
    Post,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Project => "project",
            ItemKind::Service => "service",
            ItemKind::Post => "post",
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized piece of structured content found on a page.
///
/// `hash` identifies the revision: persistence upserts on `(source_id, hash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedItem {
    pub source_id: String,
    pub kind: ItemKind,
    pub title: String,
    pub url: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub published_at: Option<DateTime<Utc>>,
    pub hash: String,
    pub visible: bool,
}

/// Counters collected while a sync walks its pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub pages_discovered: usize,
    pub pages_fetched: usize,
    pub pages_skipped_robots: usize,
    pub pages_failed: usize,
    pub duplicates_dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub items: Vec<ExtractedItem>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub stats: SyncStats,
}

impl SyncResult {
    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.etag.clone(),
            last_modified: self.last_modified,
        }
    }
}
