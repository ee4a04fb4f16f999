use dashmap::DashMap;
use reqwest::StatusCode;
use robots_txt::Robots;
use robots_txt::matcher::SimpleMatcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::SyncError;
use crate::fetcher::Fetcher;

/// Parsed outcome of fetching one host's robots.txt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotsPolicy {
    /// No robots.txt (404 or another client error): everything is allowed.
    AllowAll,
    /// The server failed to serve robots.txt: nothing is allowed.
    DisallowAll,
    /// Raw robots.txt text, parsed on each lookup.
    Rules(String),
}

impl RobotsPolicy {
    pub fn from_status_and_body(status: StatusCode, body: &[u8]) -> Self {
        if status.is_success() {
            RobotsPolicy::Rules(String::from_utf8_lossy(body).into_owned())
        } else if status.is_server_error() {
            RobotsPolicy::DisallowAll
        } else {
            RobotsPolicy::AllowAll
        }
    }

    /// Checks `path` against the group for `user_agent`, falling back to the `*` group.
    ///
    /// Groups are matched on the product token, so `sitesync/1.0 (+https://...)` selects a
    /// `User-agent: sitesync` group.
    pub fn is_allowed(&self, path: &str, user_agent: &str) -> bool {
        match self {
            RobotsPolicy::AllowAll => true,
            RobotsPolicy::DisallowAll => false,
            RobotsPolicy::Rules(text) => {
                let parsed_robots = Robots::from_str_lossy(text);
                let section = parsed_robots.choose_section(&product_token(user_agent));
                let matcher = SimpleMatcher::new(&section.rules);
                matcher.check_path(path)
            }
        }
    }
}

/// Lowercased leading name of a user-agent string, without version or comment.
pub fn product_token(user_agent: &str) -> String {
    let token = user_agent
        .split(|c: char| c == '/' || c.is_whitespace())
        .find(|part| !part.is_empty())
        .unwrap_or("*");
    token.to_ascii_lowercase()
}

/// Per-host robots.txt cache owned by one engine.
///
/// Entries are populated on first use and live as long as the gate.
#[derive(Debug)]
pub struct RobotsGate {
    user_agent: String,
    cache: DashMap<String, Arc<RobotsPolicy>>,
}

impl RobotsGate {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            cache: DashMap::new(),
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn cached(&self, target: &Url) -> Option<Arc<RobotsPolicy>> {
        let key = host_key(target)?;
        self.cache.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, target: &Url, policy: RobotsPolicy) -> Option<Arc<RobotsPolicy>> {
        let key = host_key(target)?;
        let policy = Arc::new(policy);
        self.cache.insert(key, Arc::clone(&policy));
        Some(policy)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Fails with [`SyncError::RobotsDisallowed`] when the host's robots.txt forbids
    /// `target`. The robots.txt itself is fetched through `fetcher` without consulting this
    /// gate.
    pub async fn ensure_allowed(
        &self,
        fetcher: &Fetcher,
        target: &Url,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let policy = match self.cached(target) {
            Some(policy) => policy,
            None => {
                let robots_url = robots_url(target)?;
                tracing::info!("Fetching robots.txt from: {}", robots_url);
                let response = fetcher.retrieve(&robots_url, None, cancel).await?;
                let policy = RobotsPolicy::from_status_and_body(response.status, &response.body);
                tracing::debug!(
                    "robots.txt for {} answered {}: {:?}",
                    robots_url,
                    response.status,
                    policy
                );
                self.insert(target, policy)
                    .ok_or_else(|| SyncError::InvalidUrl {
                        input: target.to_string(),
                        message: "url has no host".to_string(),
                    })?
            }
        };

        if policy.is_allowed(target.path(), &self.user_agent) {
            Ok(())
        } else {
            tracing::warn!("Skipping URL disallowed by robots.txt: {}", target);
            Err(SyncError::RobotsDisallowed {
                url: target.to_string(),
            })
        }
    }
}

/// Cache key: host plus effective port, so two servers on one address stay apart.
fn host_key(target: &Url) -> Option<String> {
    let host = target.host_str()?.to_ascii_lowercase();
    Some(match target.port_or_known_default() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

fn robots_url(target: &Url) -> Result<Url, SyncError> {
    let mut robots = target.clone();
    robots.set_path("/robots.txt");
    robots.set_query(None);
    robots.set_fragment(None);
    if robots.host_str().is_none() {
        return Err(SyncError::InvalidUrl {
            input: target.to_string(),
            message: "url has no host".to_string(),
        });
    }
    Ok(robots)
}
