//! Skin-source domain policy
//!
//! Consulted by the orchestrator before any cache or network access. A
//! denial is silent by design: the request is dropped with only a log entry.

/// Allow/deny list over skin-source hostnames
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    /// `None` allows every host not on the blacklist
    whitelist: Option<Vec<String>>,
    blacklist: Vec<String>,
}

impl DomainPolicy {
    pub fn new(whitelist: Option<Vec<String>>, blacklist: Vec<String>) -> Self {
        let lower = |list: Vec<String>| -> Vec<String> {
            list.into_iter().map(|h| h.to_ascii_lowercase()).collect()
        };
        Self {
            whitelist: whitelist.map(lower),
            blacklist: lower(blacklist),
        }
    }

    /// Whether skins may be fetched from `host`. Matching is
    /// case-insensitive and covers subdomains of listed entries.
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();

        if self.blacklist.iter().any(|entry| matches(&host, entry)) {
            return false;
        }

        match &self.whitelist {
            None => true,
            Some(list) => list.iter().any(|entry| matches(&host, entry)),
        }
    }
}

/// `host` matches `entry` exactly or as a subdomain of it.
fn matches(host: &str, entry: &str) -> bool {
    host == entry
        || host
            .strip_suffix(entry)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_whitelist_allows_everything_but_the_blacklist() {
        let policy = DomainPolicy::new(None, vec!["evil.example".to_string()]);
        assert!(policy.is_allowed("textures.example.com"));
        assert!(!policy.is_allowed("evil.example"));
        assert!(!policy.is_allowed("cdn.evil.example"));
    }

    #[test]
    fn whitelist_restricts_to_listed_hosts_and_subdomains() {
        let policy = DomainPolicy::new(Some(vec!["textures.example.com".to_string()]), vec![]);
        assert!(policy.is_allowed("textures.example.com"));
        assert!(policy.is_allowed("eu.textures.example.com"));
        assert!(!policy.is_allowed("example.com"));
        assert!(!policy.is_allowed("nottextures.example.com"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let policy = DomainPolicy::new(Some(vec!["Textures.Example.Com".to_string()]), vec![]);
        assert!(policy.is_allowed("TEXTURES.example.com"));
    }

    #[test]
    fn blacklist_wins_over_whitelist() {
        let policy = DomainPolicy::new(
            Some(vec!["example.com".to_string()]),
            vec!["bad.example.com".to_string()],
        );
        assert!(policy.is_allowed("example.com"));
        assert!(!policy.is_allowed("bad.example.com"));
    }
}
