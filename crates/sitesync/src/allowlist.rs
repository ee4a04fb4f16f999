use crate::error::SyncError;

/// Domains the engine may contact. A host passes when it equals an allowed domain or is a
/// subdomain of one.
#[derive(Debug, Clone, Default)]
pub struct HostAllowlist {
    hosts: Vec<String>,
}

impl HostAllowlist {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hosts: Vec<String> = hosts
            .into_iter()
            .map(|host| host.as_ref().trim().to_ascii_lowercase())
            .filter(|host| !host.is_empty())
            .collect();
        hosts.sort();
        hosts.dedup();
        Self { hosts }
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if host.is_empty() {
            return false;
        }
        self.hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn check(&self, host: &str) -> Result<(), SyncError> {
        if self.is_allowed(host) {
            Ok(())
        } else {
            Err(SyncError::HostNotAllowed {
                host: host.to_string(),
            })
        }
    }

    pub fn check_url(&self, url: &url::Url) -> Result<(), SyncError> {
        self.check(url.host_str().unwrap_or_default())
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}
