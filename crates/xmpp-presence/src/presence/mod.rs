//! Presence handling.
//!
//! - [`registry`]: who is online, on which full JID
//! - [`subscription`]: RFC 6121 subscription state machine and engine
//! - [`dispatcher`]: the `process_presence` entry point

pub mod dispatcher;
pub mod registry;
pub mod subscription;

pub use dispatcher::PresenceDispatcher;
pub use registry::OnlinePresences;
pub use subscription::{SubscriptionEngine, SubscriptionStateMachine, SubscriptionVerb};

use jid::{BareJid, Jid};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::hosts::Hosts;

/// Protocol category of a presence stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    /// subscribe, subscribed, unsubscribe or unsubscribed
    Subscription(SubscriptionVerb),
    /// Request for a contact's current availability
    Probe,
    /// available (no type) or unavailable
    Availability,
    /// error and anything else this engine does not act upon
    Other,
}

impl PresenceKind {
    pub fn of(presence: &Presence) -> Self {
        match &presence.type_ {
            PresenceType::None | PresenceType::Unavailable => PresenceKind::Availability,
            PresenceType::Probe => PresenceKind::Probe,
            other => SubscriptionVerb::from_presence_type(other)
                .map(PresenceKind::Subscription)
                .unwrap_or(PresenceKind::Other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceKind::Subscription(verb) => verb.as_str(),
            PresenceKind::Probe => "probe",
            PresenceKind::Availability => "availability",
            PresenceKind::Other => "other",
        }
    }
}

/// Whether a presence announces availability (type absent).
pub fn is_available(presence: &Presence) -> bool {
    matches!(presence.type_, PresenceType::None)
}

/// Copy `source` under a new envelope.
///
/// The show, status, priority and extension payloads are kept; the id is
/// dropped since the result is a new stanza.
pub fn restamp(source: &Presence, from: Jid, to: Jid, type_: PresenceType) -> Presence {
    let mut presence = Presence::new(type_);
    presence.from = Some(from);
    presence.to = Some(to);
    presence.show = source.show.clone();
    presence.statuses = source.statuses.clone();
    presence.priority = source.priority;
    presence.payloads = source.payloads.clone();
    presence
}

/// An empty presence of the given type between two addresses.
pub fn build_presence(from: Jid, to: Jid, type_: PresenceType) -> Presence {
    let mut presence = Presence::new(type_);
    presence.from = Some(from);
    presence.to = Some(to);
    presence
}

/// Local part of a bare JID, used as the store's username key.
pub(crate) fn username(jid: &BareJid) -> Option<&str> {
    jid.node().map(|n| n.as_str())
}

/// Username of `jid` when it names an account on a local domain.
pub(crate) fn local_username<'a>(hosts: &dyn Hosts, jid: &'a BareJid) -> Option<&'a str> {
    if hosts.is_local_host(jid.domain().as_str()) {
        username(jid)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidom::Element;

    fn presence(type_: PresenceType) -> Presence {
        Presence::new(type_)
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            PresenceKind::of(&presence(PresenceType::None)),
            PresenceKind::Availability
        );
        assert_eq!(
            PresenceKind::of(&presence(PresenceType::Unavailable)),
            PresenceKind::Availability
        );
        assert_eq!(
            PresenceKind::of(&presence(PresenceType::Probe)),
            PresenceKind::Probe
        );
        assert_eq!(
            PresenceKind::of(&presence(PresenceType::Subscribed)),
            PresenceKind::Subscription(SubscriptionVerb::Subscribed)
        );
        assert_eq!(
            PresenceKind::of(&presence(PresenceType::Error)),
            PresenceKind::Other
        );
    }

    #[test]
    fn test_restamp_keeps_payload() {
        let mut source = presence(PresenceType::Subscribe);
        source.id = Some("abc".to_string());
        source.from = Some(Jid::new("alice@example.com/phone").unwrap());
        source
            .statuses
            .insert(String::new(), "Please add me".to_string());
        source
            .payloads
            .push(Element::builder("nick", "http://jabber.org/protocol/nick").build());

        let stamped = restamp(
            &source,
            Jid::new("alice@example.com").unwrap(),
            Jid::new("bob@example.com").unwrap(),
            PresenceType::Subscribe,
        );

        assert_eq!(stamped.from.unwrap().to_string(), "alice@example.com");
        assert_eq!(stamped.to.unwrap().to_string(), "bob@example.com");
        assert_eq!(stamped.id, None);
        assert_eq!(
            stamped.statuses.values().next(),
            Some(&"Please add me".to_string())
        );
        assert_eq!(stamped.payloads.len(), 1);
    }

    #[test]
    fn test_username() {
        let bare: BareJid = "alice@example.com".parse().unwrap();
        assert_eq!(username(&bare), Some("alice"));
        let domain: BareJid = "example.com".parse().unwrap();
        assert_eq!(username(&domain), None);
    }

    #[test]
    fn test_local_username() {
        let hosts = crate::hosts::LocalHosts::new(["example.com"]);
        let local: BareJid = "alice@example.com".parse().unwrap();
        let remote: BareJid = "alice@jabber.org".parse().unwrap();
        assert_eq!(local_username(&hosts, &local), Some("alice"));
        assert_eq!(local_username(&hosts, &remote), None);
    }
}
