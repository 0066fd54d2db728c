//! RFC 6121 roster model.
//!
//! A roster item is one directed edge of the relationship graph: it is owned
//! by a local username and points at a contact's bare JID. The two sides of a
//! relationship keep independent items, which only agree once a full
//! subscription exchange has completed.
//!
//! Roster push (server to client):
//! ```xml
//! <iq type='set' id='push-1' to='user@domain/resource'>
//!   <query xmlns='jabber:iq:roster' ver='v3'>
//!     <item jid='contact@example.com' subscription='both'/>
//!   </query>
//! </iq>
//! ```

pub mod push;

pub use push::{RosterPush, RosterPushNotifier};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use serde::{Deserialize, Serialize};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::presence::Presence;

use crate::PresenceError;

/// Namespace for RFC 6121 Roster Management.
pub const ROSTER_NS: &str = "jabber:iq:roster";

/// Subscription state of a roster item.
///
/// - `none`: no presence flows in either direction
/// - `to`: the owner receives the contact's presence
/// - `from`: the contact receives the owner's presence
/// - `both`: presence flows both ways
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl Subscription {
    /// Get the XML attribute value for this subscription state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }

    /// Whether the owner receives the contact's presence (`to` or `both`).
    pub fn receives_presence(&self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }

    /// Whether the owner shares presence with the contact (`from` or `both`).
    pub fn shares_presence(&self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }
}

impl FromStr for Subscription {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Subscription::None),
            "to" => Ok(Subscription::To),
            "from" => Ok(Subscription::From),
            "both" => Ok(Subscription::Both),
            _ => Err(PresenceError::bad_request(format!(
                "Invalid subscription state: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A roster item: the owner's view of one contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    /// Local username owning this item.
    pub username: String,
    /// The contact's bare JID.
    pub jid: BareJid,
    /// Optional human-readable name for the contact.
    pub name: Option<String>,
    /// Current subscription state.
    pub subscription: Subscription,
    /// True while the owner's subscription request is unanswered.
    pub ask: bool,
    /// Groups this contact belongs to.
    pub groups: Vec<String>,
    /// Roster version assigned by the store on the last write.
    pub ver: u64,
}

impl RosterItem {
    /// Create a new item with no subscription and no pending request.
    pub fn new(username: impl Into<String>, jid: BareJid) -> Self {
        Self {
            username: username.into(),
            jid,
            name: None,
            subscription: Subscription::None,
            ask: false,
            groups: Vec::new(),
            ver: 0,
        }
    }

    /// Set the subscription state.
    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = subscription;
        self
    }

    /// Set the ask flag.
    pub fn with_ask(mut self, ask: bool) -> Self {
        self.ask = ask;
        self
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    /// Convert this roster item to an `<item/>` element.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("item", ROSTER_NS)
            .attr("jid", self.jid.to_string())
            .attr("subscription", self.subscription.as_str());

        if let Some(ref name) = self.name {
            builder = builder.attr("name", name);
        }

        if self.ask {
            builder = builder.attr("ask", "subscribe");
        }

        for group in &self.groups {
            builder = builder.append(
                Element::builder("group", ROSTER_NS)
                    .append(group.clone())
                    .build(),
            );
        }

        builder.build()
    }
}

/// `<item subscription='remove'/>` announcing that a contact left the roster.
pub fn removal_element(jid: &BareJid) -> Element {
    Element::builder("item", ROSTER_NS)
        .attr("jid", jid.to_string())
        .attr("subscription", "remove")
        .build()
}

/// Format a roster version for the `ver` attribute.
pub fn version_string(ver: u64) -> String {
    format!("v{}", ver)
}

/// Build a roster push IQ addressed to one bound resource.
pub fn build_roster_push(push_id: &str, to: &FullJid, item: Element, ver: Option<&str>) -> Iq {
    let mut query_builder = Element::builder("query", ROSTER_NS);

    if let Some(v) = ver {
        query_builder = query_builder.attr("ver", v);
    }

    let query = query_builder.append(item).build();

    Iq {
        from: None,
        to: Some(Jid::from(to.clone())),
        id: push_id.to_string(),
        payload: IqType::Set(query),
    }
}

/// A subscription request awaiting the contact's decision.
///
/// Keyed by (`contact`, `jid`). The stamped `subscribe` stanza is kept so
/// it can be replayed to the contact's next resource coming online.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Local username of the contact being asked.
    pub contact: String,
    /// Bare JID of the requester.
    pub jid: BareJid,
    /// The stamped `subscribe` presence.
    pub presence: Presence,
    /// When the request was stored.
    pub received_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(contact: impl Into<String>, jid: BareJid, presence: Presence) -> Self {
        Self {
            contact: contact.into(),
            jid,
            presence,
            received_at: Utc::now(),
        }
    }
}

/// A local user record.
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    /// Last available/unavailable presence broadcast by the user, used to
    /// answer probes from authorized contacts.
    pub last_presence: Option<Presence>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            last_presence: None,
        }
    }

    pub fn with_last_presence(mut self, presence: Presence) -> Self {
        self.last_presence = Some(presence);
        self
    }
}
