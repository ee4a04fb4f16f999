//! Sitemap discovery: well-known locations, `sitemapindex` flattening and page capping.

use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::SyncError;
use crate::fetcher::Fetcher;
use crate::model::Validators;

/// Paths tried, in order, against a source's base URL.
pub const SITEMAP_CANDIDATES: [&str; 2] = ["/sitemap-index.xml", "/sitemap.xml"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SitemapParseError {
    #[error("document has no root element")]
    MissingRoot,
    #[error("unsupported sitemap root <{0}>")]
    UnsupportedRoot(String),
    #[error("malformed sitemap: {0}")]
    Malformed(String),
}

/// The `<loc>` entries of one sitemap document, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapDocument {
    Index(Vec<String>),
    UrlSet(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct LocEntry {
    #[serde(default)]
    loc: String,
}

#[derive(Debug, Deserialize)]
struct SitemapIndex {
    #[serde(rename = "sitemap", default)]
    sitemaps: Vec<LocEntry>,
}

#[derive(Debug, Deserialize)]
struct UrlSet {
    #[serde(rename = "url", default)]
    urls: Vec<LocEntry>,
}

/// Classifies `xml` by its root element and collects its `<loc>` values.
pub fn parse_sitemap(xml: &str) -> Result<SitemapDocument, SitemapParseError> {
    let xml = xml.trim_start_matches('\u{feff}');
    let root = root_element(xml)?;
    let malformed = |e: quick_xml::de::DeError| SitemapParseError::Malformed(e.to_string());

    match root.as_str() {
        "sitemapindex" => {
            let index: SitemapIndex = quick_xml::de::from_str(xml).map_err(malformed)?;
            Ok(SitemapDocument::Index(locs(index.sitemaps)))
        }
        "urlset" => {
            let set: UrlSet = quick_xml::de::from_str(xml).map_err(malformed)?;
            Ok(SitemapDocument::UrlSet(locs(set.urls)))
        }
        _ => Err(SitemapParseError::UnsupportedRoot(root)),
    }
}

fn root_element(xml: &str) -> Result<String, SitemapParseError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                return Ok(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Eof) => return Err(SitemapParseError::MissingRoot),
            Ok(_) => {}
            Err(e) => return Err(SitemapParseError::Malformed(e.to_string())),
        }
    }
}

fn locs(entries: Vec<LocEntry>) -> Vec<String> {
    entries
        .into_iter()
        .map(|entry| entry.loc.trim().to_string())
        .filter(|loc| !loc.is_empty())
        .collect()
}

/// Page URLs discovered for one source plus the validators of the sitemap that listed them.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSitemap {
    pub location: Url,
    pub urls: Vec<Url>,
    pub validators: Validators,
}

#[derive(Debug, Error)]
enum CandidateFailure {
    #[error(transparent)]
    Fetch(#[from] SyncError),
    #[error("responded with status {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Parse(#[from] SitemapParseError),
    #[error("listed no usable urls")]
    Empty,
}

pub struct SitemapResolver<'a> {
    fetcher: &'a Fetcher,
    max_pages: usize,
}

impl<'a> SitemapResolver<'a> {
    pub fn new(fetcher: &'a Fetcher, max_pages: usize) -> Self {
        Self {
            fetcher,
            max_pages: max_pages.max(1),
        }
    }

    /// Tries each of [`SITEMAP_CANDIDATES`] with the stored validators and returns the first
    /// usable result.
    ///
    /// A `304` on any candidate ends resolution with [`SyncError::NotModified`]. When every
    /// candidate fails, the first robots or network error is returned, otherwise
    /// [`SyncError::SitemapUnavailable`].
    pub async fn resolve(
        &self,
        base: &Url,
        validators: &Validators,
        cancel: &CancellationToken,
    ) -> Result<ResolvedSitemap, SyncError> {
        let conditional = (!validators.is_empty()).then_some(validators);
        let mut fatal: Option<SyncError> = None;

        for path in SITEMAP_CANDIDATES {
            let target = base.join(path).map_err(|e| SyncError::InvalidUrl {
                input: base.to_string(),
                message: e.to_string(),
            })?;

            match self.retrieve(&target, conditional, cancel).await {
                Ok(resolved) => {
                    tracing::info!(
                        "Resolved sitemap {} with {} url(s)",
                        resolved.location,
                        resolved.urls.len()
                    );
                    return Ok(resolved);
                }
                Err(CandidateFailure::Fetch(SyncError::NotModified)) => {
                    tracing::info!("Sitemap {} not modified", target);
                    return Err(SyncError::NotModified);
                }
                Err(CandidateFailure::Fetch(SyncError::Cancelled)) => {
                    return Err(SyncError::Cancelled);
                }
                Err(CandidateFailure::Fetch(e)) if e.is_fatal() => {
                    tracing::warn!("Sitemap candidate {} failed: {}", target, e);
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    tracing::debug!("Sitemap candidate {} skipped: {}", target, e);
                }
            }
        }

        Err(fatal.unwrap_or_else(|| SyncError::SitemapUnavailable {
            base: base.to_string(),
        }))
    }

    async fn retrieve(
        &self,
        target: &Url,
        validators: Option<&Validators>,
        cancel: &CancellationToken,
    ) -> Result<ResolvedSitemap, CandidateFailure> {
        let response = self.fetcher.fetch(target, validators, false, cancel).await?;
        if response.is_not_modified() {
            return Err(SyncError::NotModified.into());
        }
        if response.status.as_u16() >= 400 {
            return Err(CandidateFailure::Status(response.status));
        }

        let urls = match parse_sitemap(&response.text())? {
            SitemapDocument::Index(locs) => self.flatten_index(&response.url, locs, cancel).await?,
            SitemapDocument::UrlSet(locs) => self.accept_all(&response.url, locs),
        };
        if urls.is_empty() {
            return Err(CandidateFailure::Empty);
        }

        Ok(ResolvedSitemap {
            location: response.url,
            urls,
            validators: response.validators,
        })
    }

    /// Fetches every nested sitemap listed by an index, depth-first, one level deep.
    async fn flatten_index(
        &self,
        index: &Url,
        locs: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Url>, SyncError> {
        let mut urls = Vec::new();
        for loc in locs {
            let Some(nested) = self.accept(index, &loc) else {
                continue;
            };

            match self.retrieve_nested(&nested, cancel).await {
                Ok(found) => {
                    for url in found {
                        urls.push(url);
                        if urls.len() >= self.max_pages {
                            return Ok(urls);
                        }
                    }
                }
                Err(CandidateFailure::Fetch(SyncError::Cancelled)) => {
                    return Err(SyncError::Cancelled);
                }
                Err(e) => {
                    tracing::warn!("Skipping nested sitemap {}: {}", nested, e);
                }
            }
        }
        Ok(urls)
    }

    async fn retrieve_nested(
        &self,
        target: &Url,
        cancel: &CancellationToken,
    ) -> Result<Vec<Url>, CandidateFailure> {
        let response = self.fetcher.fetch(target, None, false, cancel).await?;
        if response.status.as_u16() >= 400 {
            return Err(CandidateFailure::Status(response.status));
        }

        match parse_sitemap(&response.text())? {
            SitemapDocument::UrlSet(locs) => Ok(self.accept_all(&response.url, locs)),
            SitemapDocument::Index(_) => {
                tracing::warn!("Ignoring sitemap index nested inside {}", target);
                Ok(Vec::new())
            }
        }
    }

    fn accept_all(&self, base: &Url, locs: Vec<String>) -> Vec<Url> {
        locs.iter()
            .filter_map(|loc| self.accept(base, loc))
            .take(self.max_pages)
            .collect()
    }

    /// Resolves `loc` against `base` and keeps it only when it is http(s) on an allowed host.
    fn accept(&self, base: &Url, loc: &str) -> Option<Url> {
        let url = match base.join(loc.trim()) {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!("Ignoring invalid sitemap entry '{}': {}", loc, e);
                return None;
            }
        };
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        if !self
            .fetcher
            .allowlist()
            .is_allowed(url.host_str().unwrap_or_default())
        {
            tracing::debug!("Ignoring sitemap entry outside allowlist: {}", url);
            return None;
        }
        tracing::debug!("Discovered {}", url);
        Some(url)
    }
}
