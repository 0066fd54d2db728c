//! Local domain check.
//!
//! Whether a counterpart is served by this server decides if its presence can
//! be delivered directly or must be requested with a `probe`.

use std::collections::HashSet;

/// Answers whether a domain is hosted locally.
pub trait Hosts: Send + Sync + 'static {
    fn is_local_host(&self, domain: &str) -> bool;
}

/// A fixed set of locally served domains.
#[derive(Debug, Clone, Default)]
pub struct LocalHosts {
    domains: HashSet<String>,
}

impl LocalHosts {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.into().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Hosts for LocalHosts {
    fn is_local_host(&self, domain: &str) -> bool {
        self.domains.contains(&domain.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_hosts() {
        let hosts = LocalHosts::new(["example.com", "Chat.Example.org"]);
        assert!(hosts.is_local_host("example.com"));
        assert!(hosts.is_local_host("chat.example.org"));
        assert!(!hosts.is_local_host("jabber.org"));
    }
}
