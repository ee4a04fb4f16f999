//! Polite, sitemap-driven ingestion of schema.org content from external sites.
//!
//! A [`SyncEngine`] discovers pages through a source's sitemap, fetches them under a shared
//! rate limit while honouring `robots.txt` and a host allowlist, extracts JSON-LD objects
//! into [`ExtractedItem`]s and deduplicates them by content hash.
//!
//! # Features
//!
//! - Conditional sitemap requests (`If-None-Match` / `If-Modified-Since`); a `304` ends the
//!   sync with [`SyncError::NotModified`]
//! - `sitemapindex` flattening, one level deep, capped at a configured page count
//! - Token-bucket rate limiting shared by every request of one engine
//! - Per-host `robots.txt` cache
//! - Bounded retries and a response body cap
//! - Cancellation through [`CancellationToken`](tokio_util::sync::CancellationToken)
//!
//! # Usage
//!
//! ```rust,no_run
//! use sitesync::{EngineConfig, Source, SyncEngine, SyncError};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! # async fn run() -> Result<(), SyncError> {
//! let engine = SyncEngine::new(EngineConfig {
//!     allowlist: vec!["example.com".to_string()],
//!     ..EngineConfig::default()
//! })?;
//! let source = Source {
//!     id: "example".to_string(),
//!     name: "Example".to_string(),
//!     base_url: Url::parse("https://example.com/").ok(),
//!     ..Source::default()
//! };
//!
//! match engine.sync(&source, &CancellationToken::new()).await {
//!     Ok(result) => println!("{} item(s)", result.items.len()),
//!     Err(SyncError::NotModified) => println!("nothing changed"),
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Persisting results and looping over many sources is left to the caller; [`batch::run_all`]
//! together with [`store::MemoryStore`] is a ready-made version of that loop.
pub mod allowlist;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod model;
pub mod rate_limiter;
pub mod robots;
pub mod sitemap;
pub mod store;

pub use config::{AppConfig, EngineConfig, LogFormat, normalize_base_url};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use model::{ExtractedItem, ItemKind, Source, SyncResult, SyncStats, Validators};
