//! Online presence registry.
//!
//! Process-wide map from a full JID string to the latest available presence
//! received from it. Entries are added on `available` and removed on
//! `unavailable`; nothing is persisted, so the registry starts empty after a
//! restart. Stale entries left by dropped connections are the session
//! layer's concern.
//!
//! Lookups match at the granularity of the query:
//!
//! | pattern               | compared parts          |
//! |-----------------------|-------------------------|
//! | `node@domain/res`     | node, domain, resource  |
//! | `domain/res`          | domain, resource        |
//! | `node@domain`         | node, domain            |
//! | `domain`              | domain                  |

use std::fmt;

use dashmap::DashMap;
use jid::Jid;
use tracing::debug;
use xmpp_parsers::presence::Presence;

#[derive(Debug, Clone)]
struct OnlineEntry {
    jid: Jid,
    presence: Presence,
}

/// Concurrent registry of online resources.
#[derive(Default)]
pub struct OnlinePresences {
    entries: DashMap<String, OnlineEntry>,
}

impl OnlinePresences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest available presence from `jid`.
    ///
    /// Returns true when `jid` was not online before this call.
    pub fn store(&self, jid: &Jid, presence: Presence) -> bool {
        let previous = self.entries.insert(
            jid.to_string(),
            OnlineEntry {
                jid: jid.clone(),
                presence,
            },
        );
        let newly_online = previous.is_none();
        debug!(jid = %jid, newly_online, "Stored online presence");
        newly_online
    }

    /// Forget `jid`, returning its last presence if it was online.
    pub fn remove(&self, jid: &Jid) -> Option<Presence> {
        let removed = self
            .entries
            .remove(&jid.to_string())
            .map(|(_, entry)| entry.presence);
        debug!(jid = %jid, was_online = removed.is_some(), "Removed online presence");
        removed
    }

    /// Latest presence of one exact full JID.
    pub fn get(&self, jid: &Jid) -> Option<Presence> {
        self.entries
            .get(&jid.to_string())
            .map(|entry| entry.presence.clone())
    }

    /// Every online presence whose JID matches `pattern` (see module docs).
    pub fn matching(&self, pattern: &Jid) -> Vec<Presence> {
        self.entries
            .iter()
            .filter(|entry| jid_matches(&entry.value().jid, pattern))
            .map(|entry| entry.value().presence.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for OnlinePresences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnlinePresences")
            .field("online", &self.entries.len())
            .finish()
    }
}

fn jid_matches(online: &Jid, pattern: &Jid) -> bool {
    let same_domain = online.domain() == pattern.domain();
    let same_node = || online.node() == pattern.node();
    let same_resource = || online.resource() == pattern.resource();

    match (pattern.node().is_some(), pattern.resource().is_some()) {
        (true, true) => same_domain && same_node() && same_resource(),
        (false, true) => same_domain && same_resource(),
        (true, false) => same_domain && same_node(),
        (false, false) => same_domain,
    }
}
