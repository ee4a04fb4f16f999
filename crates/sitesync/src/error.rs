use miette::Diagnostic;
use thiserror::Error;

/// Everything a [`SyncEngine::sync`](crate::engine::SyncEngine::sync) call can end with
/// besides a result set.
///
/// [`SyncError::NotModified`] is not a failure: it signals that the source's sitemap
/// answered `304 Not Modified` and there is nothing to persist.
#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("external source not modified")]
    #[diagnostic(
        code(sitesync::not_modified),
        help("The sitemap answered 304; keep the stored validators and skip persistence.")
    )]
    NotModified,

    #[error("base url missing")]
    #[diagnostic(code(sitesync::config::missing_base_url))]
    MissingBaseUrl,

    #[error("host {host} not in allowlist")]
    #[diagnostic(
        code(sitesync::policy::host_not_allowed),
        help("Add the domain (or a parent domain) to the engine allowlist.")
    )]
    HostNotAllowed { host: String },

    #[error("robots disallow {url}")]
    #[diagnostic(code(sitesync::policy::robots_disallowed))]
    RobotsDisallowed { url: String },

    #[error("no sitemap available for {base}")]
    #[diagnostic(
        code(sitesync::sitemap::unavailable),
        help("Neither /sitemap-index.xml nor /sitemap.xml returned a usable document.")
    )]
    SitemapUnavailable { base: String },

    #[error("failed to fetch {url} after {attempts} attempt(s): {source}")]
    #[diagnostic(code(sitesync::network::fetch_exhausted))]
    FetchExhausted {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },

    #[error("sync cancelled")]
    #[diagnostic(code(sitesync::cancelled))]
    Cancelled,

    #[error("invalid url '{input}': {message}")]
    #[diagnostic(code(sitesync::config::invalid_url))]
    InvalidUrl { input: String, message: String },

    #[error("failed to build http client: {0}")]
    #[diagnostic(code(sitesync::config::http_client))]
    HttpClient(#[source] reqwest::Error),

    #[error("configuration error: {0}")]
    #[diagnostic(code(sitesync::config::invalid))]
    Config(String),

    #[error("source {id} not found")]
    #[diagnostic(code(sitesync::store::source_not_found))]
    SourceNotFound { id: String },
}

impl SyncError {
    /// Returns `true` for the expected "nothing changed" outcome.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, SyncError::NotModified)
    }

    /// Errors that end a whole sync rather than a single page or nested sitemap.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Cancelled
                | SyncError::RobotsDisallowed { .. }
                | SyncError::FetchExhausted { .. }
        )
    }
}
