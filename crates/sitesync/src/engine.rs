use chrono::Utc;
use reqwest::StatusCode;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::extract::ContentExtractor;
use crate::fetcher::Fetcher;
use crate::model::{ExtractedItem, Source, SyncResult, SyncStats};
use crate::rate_limiter::RateLimiter;
use crate::sitemap::SitemapResolver;

/// One ingestion engine: a fetcher with its rate limiter and robots cache, plus the
/// extractor. Cheap to share behind an `Arc`; concurrent [`SyncEngine::sync`] calls share
/// the politeness budget and the robots cache.
#[derive(Debug)]
pub struct SyncEngine {
    config: EngineConfig,
    fetcher: Fetcher,
    extractor: ContentExtractor,
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Result<Self, SyncError> {
        let config = config.normalized();
        let fetcher = Fetcher::new(&config)?;
        Ok(Self::from_parts(config, fetcher))
    }

    pub fn with_limiter(config: EngineConfig, limiter: Arc<RateLimiter>) -> Result<Self, SyncError> {
        let config = config.normalized();
        let fetcher = Fetcher::with_limiter(&config, limiter)?;
        Ok(Self::from_parts(config, fetcher))
    }

    fn from_parts(config: EngineConfig, fetcher: Fetcher) -> Self {
        Self {
            config,
            fetcher,
            extractor: ContentExtractor::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Runs one synchronization pass for `source`.
    ///
    /// Returns [`SyncError::NotModified`] when the sitemap answered `304`; in that case no
    /// page is fetched. Individual page failures are counted in [`SyncStats`] and skipped.
    pub async fn sync(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        let base = source.base_url.as_ref().ok_or(SyncError::MissingBaseUrl)?;
        self.fetcher.allowlist().check_url(base)?;

        tracing::info!("Syncing source {} ({})", source.id, base);

        let sitemap = match SitemapResolver::new(&self.fetcher, self.config.max_pages)
            .resolve(base, &source.validators(), cancel)
            .await
        {
            Ok(sitemap) => sitemap,
            Err(SyncError::NotModified) => {
                tracing::info!("Source {} not modified since last sync", source.id);
                return Err(SyncError::NotModified);
            }
            Err(e) => return Err(e),
        };

        let mut stats = SyncStats {
            pages_discovered: sitemap.urls.len(),
            ..SyncStats::default()
        };
        let items = self
            .fetch_pages(source, &sitemap.urls, &mut stats, cancel)
            .await?;

        tracing::info!(
            "Finished source {}: {} item(s) from {} page(s), {} failed, {} blocked by robots.txt",
            source.id,
            items.len(),
            stats.pages_fetched,
            stats.pages_failed,
            stats.pages_skipped_robots
        );

        Ok(SyncResult {
            items,
            etag: sitemap.validators.etag,
            last_modified: sitemap.validators.last_modified,
            fetched_at: Utc::now(),
            stats,
        })
    }

    async fn fetch_pages(
        &self,
        source: &Source,
        urls: &[Url],
        stats: &mut SyncStats,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedItem>, SyncError> {
        let max_items = self.config.max_pages;
        let mut seen = HashSet::new();
        let mut items: Vec<ExtractedItem> = Vec::new();

        for page in urls.iter().take(self.config.max_pages) {
            if items.len() >= max_items {
                break;
            }
            if !self
                .fetcher
                .allowlist()
                .is_allowed(page.host_str().unwrap_or_default())
            {
                tracing::debug!("Skipping page outside allowlist: {}", page);
                continue;
            }

            let response = match self.fetcher.fetch(page, None, false, cancel).await {
                Ok(response) => response,
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e @ SyncError::RobotsDisallowed { .. }) => {
                    tracing::debug!("{}", e);
                    stats.pages_skipped_robots += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Skipping page {}: {}", page, e);
                    stats.pages_failed += 1;
                    continue;
                }
            };
            stats.pages_fetched += 1;

            if response.status != StatusCode::OK {
                tracing::warn!("Skipping page {}: status {}", page, response.status);
                stats.pages_failed += 1;
                continue;
            }

            for item in self.extractor.extract(source, page, &response.text()) {
                if !seen.insert(item.hash.clone()) {
                    stats.duplicates_dropped += 1;
                    continue;
                }
                items.push(item);
                if items.len() >= max_items {
                    break;
                }
            }
        }

        Ok(items)
    }
}
