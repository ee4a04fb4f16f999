use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::SyncError;
use crate::model::Source;

pub const DEFAULT_USER_AGENT: &str = "sitesync/1.0 (+https://github.com/sitesync/sitesync)";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 30;
pub const DEFAULT_MAX_PAGES: usize = 64;
pub const DEFAULT_RETRIES: usize = 3;
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 << 20;

/// Tunables for one [`SyncEngine`](crate::engine::SyncEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sent on every request and used to pick the robots.txt group.
    pub user_agent: String,
    pub http_timeout_ms: u64,
    pub requests_per_minute: u32,
    /// Domains (and their subdomains) the engine may contact.
    pub allowlist: Vec<String>,
    /// Upper bound on pages fetched, and items kept, per sync.
    pub max_pages: usize,
    /// Attempts per request, including the first.
    pub retries: usize,
    pub max_body_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            allowlist: Vec::new(),
            max_pages: DEFAULT_MAX_PAGES,
            retries: DEFAULT_RETRIES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl EngineConfig {
    /// Replaces blank or zero values with defaults.
    pub fn normalized(mut self) -> Self {
        if self.user_agent.trim().is_empty() {
            self.user_agent = DEFAULT_USER_AGENT.to_string();
        }
        if self.http_timeout_ms == 0 {
            self.http_timeout_ms = DEFAULT_HTTP_TIMEOUT_MS;
        }
        if self.requests_per_minute == 0 {
            self.requests_per_minute = DEFAULT_REQUESTS_PER_MINUTE;
        }
        if self.max_pages == 0 {
            self.max_pages = DEFAULT_MAX_PAGES;
        }
        if self.retries == 0 {
            self.retries = DEFAULT_RETRIES;
        }
        if self.max_body_bytes == 0 {
            self.max_body_bytes = DEFAULT_MAX_BODY_BYTES;
        }
        self.allowlist = self
            .allowlist
            .into_iter()
            .map(|host| host.trim().to_ascii_lowercase())
            .filter(|host| !host.is_empty())
            .collect();
        self
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlays `SITESYNC_*` environment variables; invalid values are reported and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(user_agent) = env::var("SITESYNC_USER_AGENT") {
            if !user_agent.trim().is_empty() {
                self.user_agent = user_agent;
            }
        }

        parse_env("SITESYNC_HTTP_TIMEOUT_MS", &mut self.http_timeout_ms);
        parse_env("SITESYNC_RATE_LIMIT_RPM", &mut self.requests_per_minute);
        parse_env("SITESYNC_MAX_PAGES", &mut self.max_pages);
        parse_env("SITESYNC_RETRIES", &mut self.retries);
        parse_env("SITESYNC_MAX_BODY_BYTES", &mut self.max_body_bytes);

        if let Ok(allowlist) = env::var("SITESYNC_DOMAIN_ALLOWLIST") {
            if !allowlist.trim().is_empty() {
                self.allowlist = split_and_trim(&allowlist);
            }
        }

        self.normalized()
    }
}

fn parse_env<T>(name: &str, target: &mut T)
where
    T: std::str::FromStr + std::fmt::Display + PartialOrd + Default,
{
    let Ok(raw) = env::var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => *target = value,
        _ => tracing::warn!(
            "Invalid {} value '{}', using default {}",
            name,
            raw,
            target
        ),
    }
}

fn split_and_trim(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(SyncError::Config(format!("unknown log format '{}'", other))),
        }
    }
}

/// A source definition as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSeed {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

/// Configuration file read by the `sitesync` binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: Option<String>,
    pub log_format: LogFormat,
    pub engine: EngineConfig,
    pub sources: Vec<SourceSeed>,
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, SyncError> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }
}

/// A seed resolved into the engine's [`Source`] shape plus its enabled flag.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub source: Source,
    pub raw_base_url: String,
    pub enabled: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SourceSeed {
    pub fn into_record(self) -> SourceRecord {
        let name = self.name.trim().to_string();
        let id = self
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| slug(&name));
        let source_type = self
            .source_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "auto".to_string());

        SourceRecord {
            source: Source {
                id,
                name,
                base_url: normalize_base_url(&self.base_url).ok(),
                source_type,
                etag: self.etag,
                last_modified: self.last_modified,
            },
            raw_base_url: self.base_url,
            enabled: self.enabled,
            last_synced_at: None,
        }
    }
}

fn slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "source".to_string()
    } else {
        slug
    }
}

/// Turns a user-entered base URL into an absolute URL: `https://` is assumed when no scheme
/// is given, the fragment is dropped and an empty path becomes `/`.
pub fn normalize_base_url(raw: &str) -> Result<Url, SyncError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SyncError::MissingBaseUrl);
    }
    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| SyncError::InvalidUrl {
        input: raw.to_string(),
        message: e.to_string(),
    })?;
    url.set_fragment(None);
    if url.path().is_empty() {
        url.set_path("/");
    }
    if url.host_str().is_none() {
        return Err(SyncError::InvalidUrl {
            input: raw.to_string(),
            message: "missing host".to_string(),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.http_timeout(), Duration::from_secs(8));
        assert_eq!(config.requests_per_minute, 30);
        assert_eq!(config.max_pages, 64);
        assert_eq!(config.retries, 3);
        assert_eq!(config.max_body_bytes, 8 * 1024 * 1024);
        assert!(config.allowlist.is_empty());
    }

    #[test]
    fn test_normalized_replaces_zero_values() {
        let config = EngineConfig {
            user_agent: "  ".to_string(),
            http_timeout_ms: 0,
            requests_per_minute: 0,
            allowlist: vec![" Example.COM ".to_string(), "".to_string()],
            max_pages: 0,
            retries: 0,
            max_body_bytes: 0,
        }
        .normalized();

        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.http_timeout_ms, DEFAULT_HTTP_TIMEOUT_MS);
        assert_eq!(config.requests_per_minute, DEFAULT_REQUESTS_PER_MINUTE);
        assert_eq!(config.allowlist, vec!["example.com"]);
        assert_eq!(config.max_pages, DEFAULT_MAX_PAGES);
        assert_eq!(config.retries, DEFAULT_RETRIES);
        assert_eq!(config.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
    }

    #[test]
    fn test_config_from_env() {
        let names = [
            "SITESYNC_USER_AGENT",
            "SITESYNC_RATE_LIMIT_RPM",
            "SITESYNC_DOMAIN_ALLOWLIST",
            "SITESYNC_MAX_PAGES",
            "SITESYNC_RETRIES",
        ];
        let originals: Vec<Option<String>> = names.iter().map(|n| env::var(n).ok()).collect();

        unsafe {
            env::set_var("SITESYNC_USER_AGENT", "test-agent/2.0");
            env::set_var("SITESYNC_RATE_LIMIT_RPM", "120");
            env::set_var("SITESYNC_DOMAIN_ALLOWLIST", "example.com, blog.test ,");
            env::set_var("SITESYNC_MAX_PAGES", "not-a-number");
            env::set_var("SITESYNC_RETRIES", "0");
        }

        let config = EngineConfig::from_env();

        assert_eq!(config.user_agent, "test-agent/2.0");
        assert_eq!(config.requests_per_minute, 120);
        assert_eq!(config.allowlist, vec!["example.com", "blog.test"]);
        assert_eq!(config.max_pages, DEFAULT_MAX_PAGES);
        assert_eq!(config.retries, DEFAULT_RETRIES);

        unsafe {
            for (name, original) in names.iter().zip(originals) {
                match original {
                    Some(val) => env::set_var(name, val),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[rstest]
    #[case("example.com", "https://example.com/")]
    #[case("  http://example.com  ", "http://example.com/")]
    #[case("https://example.com/blog#top", "https://example.com/blog")]
    #[case("https://Example.com:8443", "https://example.com:8443/")]
    fn test_normalize_base_url(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_base_url(input).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("https://")]
    fn test_normalize_base_url_rejects(#[case] input: &str) {
        assert!(normalize_base_url(input).is_err());
    }

    #[test]
    fn test_app_config_from_toml() {
        let config = AppConfig::from_toml_str(
            r#"
log_level = "debug"
log_format = "json"

[engine]
user_agent = "custom-bot/1.0"
requests_per_minute = 10
allowlist = ["example.com"]

[[sources]]
name = "My Portfolio"
base_url = "example.com"

[[sources]]
id = "blog"
name = "Blog"
base_url = "https://blog.example.com"
source_type = "blog"
enabled = false
"#,
        )
        .unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.engine.user_agent, "custom-bot/1.0");
        assert_eq!(config.engine.requests_per_minute, 10);
        assert_eq!(config.engine.max_pages, DEFAULT_MAX_PAGES);
        assert_eq!(config.sources.len(), 2);

        let first = config.sources[0].clone().into_record();
        assert_eq!(first.source.id, "my-portfolio");
        assert_eq!(first.source.source_type, "auto");
        assert_eq!(
            first.source.base_url.as_ref().map(Url::as_str),
            Some("https://example.com/")
        );
        assert!(first.enabled);

        let second = config.sources[1].clone().into_record();
        assert_eq!(second.source.id, "blog");
        assert_eq!(second.source.source_type, "blog");
        assert!(!second.enabled);
    }

    #[test]
    fn test_app_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sitesync.toml");
        std::fs::write(
            &path,
            "[[sources]]\nname = \"Docs\"\nbase_url = \"https://docs.example.com\"\n",
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.engine, EngineConfig::default());
        assert!(matches!(
            AppConfig::load(&dir.path().join("missing.toml")),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_app_config_rejects_invalid_toml() {
        assert!(matches!(
            AppConfig::from_toml_str("engine = 3"),
            Err(SyncError::Config(_))
        ));
    }

    #[rstest]
    #[case("text", LogFormat::Text)]
    #[case("PLAIN", LogFormat::Text)]
    #[case("json", LogFormat::Json)]
    fn test_log_format_from_str(#[case] input: &str, #[case] expected: LogFormat) {
        assert_eq!(input.parse::<LogFormat>().unwrap(), expected);
    }
}
