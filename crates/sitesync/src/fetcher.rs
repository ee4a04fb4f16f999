use chrono::{DateTime, Utc};
use reqwest::header::{
    ETAG, HeaderMap, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, USER_AGENT,
};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::allowlist::HostAllowlist;
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::model::Validators;
use crate::rate_limiter::RateLimiter;
use crate::robots::RobotsGate;

/// Redirects are only followed while they stay on allowlisted hosts.
const MAX_REDIRECTS: usize = 10;

/// What a single successful GET produced.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: Url,
    pub status: StatusCode,
    pub body: Vec<u8>,
    /// `ETag` / `Last-Modified` sent back by the server.
    pub validators: Validators,
}

impl FetchResponse {
    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

enum AttemptError {
    Cancelled,
    Transport(reqwest::Error),
}

/// Conditional GET with bounded retries, a body-size cap and the engine's politeness
/// checks (allowlist, robots.txt, rate limit).
#[derive(Debug)]
pub struct Fetcher {
    client: Client,
    limiter: Arc<RateLimiter>,
    allowlist: Arc<HostAllowlist>,
    robots: RobotsGate,
    user_agent: String,
    attempts: usize,
    max_body_bytes: usize,
}

impl Fetcher {
    pub fn new(config: &EngineConfig) -> Result<Self, SyncError> {
        let limiter = Arc::new(RateLimiter::new(config.requests_per_minute));
        Self::with_limiter(config, limiter)
    }

    /// Builds a fetcher around an existing limiter so several engines can share one
    /// politeness budget.
    pub fn with_limiter(
        config: &EngineConfig,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, SyncError> {
        let allowlist = Arc::new(HostAllowlist::new(&config.allowlist));
        let redirect_allowlist = Arc::clone(&allowlist);
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(Policy::custom(move |attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    attempt.error("too many redirects")
                } else if attempt
                    .url()
                    .host_str()
                    .is_some_and(|host| redirect_allowlist.is_allowed(host))
                {
                    attempt.follow()
                } else {
                    attempt.stop()
                }
            }))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .timeout(config.http_timeout())
            .connect_timeout(config.http_timeout().min(Duration::from_secs(10)))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(SyncError::HttpClient)?;

        Ok(Self {
            client,
            limiter,
            allowlist,
            robots: RobotsGate::new(config.user_agent.clone()),
            user_agent: config.user_agent.clone(),
            attempts: config.retries.max(1),
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn allowlist(&self) -> &HostAllowlist {
        &self.allowlist
    }

    pub fn robots(&self) -> &RobotsGate {
        &self.robots
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetches `target`, enforcing the allowlist and robots.txt unless `skip_robots` is set.
    ///
    /// A `304 Not Modified` is returned as a normal response; interpreting it is up to the
    /// caller.
    pub async fn fetch(
        &self,
        target: &Url,
        validators: Option<&Validators>,
        skip_robots: bool,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, SyncError> {
        if !skip_robots {
            self.allowlist.check_url(target)?;
            self.robots.ensure_allowed(self, target, cancel).await?;
        }
        self.retrieve(target, validators, cancel).await
    }

    /// The retry loop without any policy checks.
    pub(crate) async fn retrieve(
        &self,
        target: &Url,
        validators: Option<&Validators>,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, SyncError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.acquire(cancel).await?;
            tracing::debug!("GET {} (attempt {}/{})", target, attempt, self.attempts);

            match self.attempt(target, validators, cancel).await {
                Ok(response) => return Ok(response),
                Err(AttemptError::Cancelled) => return Err(SyncError::Cancelled),
                Err(AttemptError::Transport(e)) if attempt < self.attempts => {
                    tracing::warn!("Attempt {} for {} failed: {}", attempt, target, e);
                }
                Err(AttemptError::Transport(e)) => {
                    return Err(SyncError::FetchExhausted {
                        url: target.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        target: &Url,
        validators: Option<&Validators>,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, AttemptError> {
        let mut request = self
            .client
            .get(target.clone())
            .header(USER_AGENT, &self.user_agent);
        if let Some(validators) = validators {
            if let Some(etag) = &validators.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = validators.last_modified {
                request = request.header(IF_MODIFIED_SINCE, http_date(&last_modified));
            }
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            response = request.send() => response.map_err(AttemptError::Transport)?,
        };

        let status = response.status();
        let validators = response_validators(response.headers());
        let body = self.read_body(response, cancel).await?;

        Ok(FetchResponse {
            url: target.clone(),
            status,
            body,
            validators,
        })
    }

    /// Reads at most `max_body_bytes`; anything beyond is dropped.
    async fn read_body(
        &self,
        mut response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, AttemptError> {
        let mut body = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                chunk = response.chunk() => chunk.map_err(AttemptError::Transport)?,
            };
            let Some(chunk) = chunk else {
                break;
            };

            let remaining = self.max_body_bytes.saturating_sub(body.len());
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                if chunk.len() > remaining {
                    tracing::debug!(
                        "Body of {} truncated at {} bytes",
                        response.url(),
                        self.max_body_bytes
                    );
                }
                break;
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Formats a timestamp as an HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn http_date(value: &DateTime<Utc>) -> String {
    value.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn response_validators(headers: &HeaderMap) -> Validators {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    Validators {
        etag: header(ETAG).map(str::to_string),
        last_modified: header(LAST_MODIFIED).and_then(parse_http_date),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::{Method::GET, MockServer};

    fn config_for(server: &MockServer) -> EngineConfig {
        EngineConfig {
            requests_per_minute: 60_000,
            allowlist: vec![server.host()],
            ..EngineConfig::default()
        }
    }

    fn url(server: &MockServer, path: &str) -> Url {
        Url::parse(&server.url(path)).unwrap()
    }

    #[test]
    fn test_http_date_round_trip() {
        let date = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(http_date(&date), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT"), Some(date));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn test_response_validators_ignores_blank_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, "  ".parse().unwrap());
        headers.insert(LAST_MODIFIED, "Sun, 06 Nov 1994 08:49:37 GMT".parse().unwrap());
        let validators = response_validators(&headers);
        assert_eq!(validators.etag, None);
        assert!(validators.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_fetch_sends_conditional_headers() {
        let server = MockServer::start_async().await;
        let last_modified = Utc.with_ymd_and_hms(2024, 2, 10, 12, 0, 0).unwrap();
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/sitemap.xml")
                    .header("If-None-Match", "\"abc\"")
                    .header("If-Modified-Since", "Sat, 10 Feb 2024 12:00:00 GMT");
                then.status(304);
            })
            .await;

        let fetcher = Fetcher::new(&config_for(&server)).unwrap();
        let validators = Validators {
            etag: Some("\"abc\"".to_string()),
            last_modified: Some(last_modified),
        };
        let response = fetcher
            .fetch(
                &url(&server, "/sitemap.xml"),
                Some(&validators),
                true,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(response.is_not_modified());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_captures_response_validators() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/page");
                then.status(200)
                    .header("ETag", "\"v2\"")
                    .header("Last-Modified", "Sat, 10 Feb 2024 12:00:00 GMT")
                    .body("hello");
            })
            .await;

        let fetcher = Fetcher::new(&config_for(&server)).unwrap();
        let response = fetcher
            .fetch(&url(&server, "/page"), None, true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "hello");
        assert_eq!(response.validators.etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            response.validators.last_modified,
            Some(Utc.with_ymd_and_hms(2024, 2, 10, 12, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_fetch_truncates_large_bodies() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/big");
                then.status(200).body("x".repeat(4096));
            })
            .await;

        let config = EngineConfig {
            max_body_bytes: 100,
            ..config_for(&server)
        };
        let fetcher = Fetcher::new(&config).unwrap();
        let response = fetcher
            .fetch(&url(&server, "/big"), None, true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.body.len(), 100);
    }

    #[tokio::test]
    async fn test_fetch_rejects_hosts_outside_allowlist() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200);
            })
            .await;

        let config = EngineConfig {
            allowlist: vec!["example.com".to_string()],
            ..config_for(&server)
        };
        let fetcher = Fetcher::new(&config).unwrap();
        let result = fetcher
            .fetch(&url(&server, "/page"), None, false, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(SyncError::HostNotAllowed { .. })));
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_robots_disallow_blocks_only_matching_paths() {
        let server = MockServer::start_async().await;
        let robots = server
            .mock_async(|when, then| {
                when.method(GET).path("/robots.txt");
                then.status(200).body("User-agent: *\nDisallow: /private\n");
            })
            .await;
        let private = server
            .mock_async(|when, then| {
                when.method(GET).path("/private/page");
                then.status(200).body("secret");
            })
            .await;
        let public = server
            .mock_async(|when, then| {
                when.method(GET).path("/public/page");
                then.status(200).body("hello");
            })
            .await;

        let fetcher = Fetcher::new(&config_for(&server)).unwrap();
        let cancel = CancellationToken::new();

        let blocked = fetcher
            .fetch(&url(&server, "/private/page"), None, false, &cancel)
            .await;
        assert!(matches!(blocked, Err(SyncError::RobotsDisallowed { .. })));

        let allowed = fetcher
            .fetch(&url(&server, "/public/page"), None, false, &cancel)
            .await
            .unwrap();
        assert_eq!(allowed.text(), "hello");

        robots.assert_hits_async(1).await;
        private.assert_hits_async(0).await;
        public.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_missing_robots_allows_everything() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/robots.txt");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/anything");
                then.status(200).body("ok");
            })
            .await;

        let fetcher = Fetcher::new(&config_for(&server)).unwrap();
        let response = fetcher
            .fetch(&url(&server, "/anything"), None, false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.text(), "ok");
        assert_eq!(fetcher.robots().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_errors_exhaust_retries() {
        // Nothing listens on port 9 of the loopback address.
        let target = Url::parse("http://127.0.0.1:9/unreachable").unwrap();
        let config = EngineConfig {
            requests_per_minute: 60_000,
            allowlist: vec!["127.0.0.1".to_string()],
            retries: 2,
            ..EngineConfig::default()
        };
        let fetcher = Fetcher::new(&config).unwrap();
        let result = fetcher
            .fetch(&target, None, true, &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(SyncError::FetchExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_error_then_success_recovers_within_retries() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // The first connection is closed before any response is written.
            let (dropped, _) = listener.accept().await.unwrap();
            drop(dropped);
            let mut accepted = 1;

            let (mut socket, _) = listener.accept().await.unwrap();
            accepted += 1;
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = socket.read(&mut buf).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..read]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                )
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
            accepted
        });

        let config = EngineConfig {
            requests_per_minute: 60_000,
            allowlist: vec!["127.0.0.1".to_string()],
            retries: 3,
            ..EngineConfig::default()
        };
        let fetcher = Fetcher::new(&config).unwrap();
        let target = Url::parse(&format!("http://{}/flaky", address)).unwrap();
        let response = fetcher
            .fetch(&target, None, true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "ok");
        assert_eq!(server.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_does_not_hit_server() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200);
            })
            .await;

        let fetcher = Fetcher::new(&config_for(&server)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fetcher
            .fetch(&url(&server, "/page"), None, true, &cancel)
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        mock.assert_hits_async(0).await;
    }
}
