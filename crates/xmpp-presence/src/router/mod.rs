//! Stanza routing interface.
//!
//! The presence engine hands fully-addressed stanzas to a [`Router`] and
//! never waits on delivery: routing is fire-and-forget, and the router is
//! expected to queue into each destination's own delivery pipeline.
//!
//! [`LocalRouter`] is an in-process implementation that delivers to bound
//! client streams and hands remote-domain stanzas to an outbound channel.

mod local;

pub use local::{BoundStream, LocalRouter};

use std::sync::Arc;

use jid::{FullJid, Jid};
use xmpp_parsers::iq::Iq;
use xmpp_parsers::presence::Presence;

/// A stanza produced by the presence engine.
#[derive(Debug, Clone)]
pub enum Stanza {
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    /// Destination address of the stanza.
    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Presence(p) => p.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    /// Sender address of the stanza.
    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Presence(p) => p.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    /// Borrow the presence if this is a presence stanza.
    pub fn as_presence(&self) -> Option<&Presence> {
        match self {
            Stanza::Presence(p) => Some(p),
            Stanza::Iq(_) => None,
        }
    }

    /// Borrow the IQ if this is an IQ stanza.
    pub fn as_iq(&self) -> Option<&Iq> {
        match self {
            Stanza::Iq(iq) => Some(iq),
            Stanza::Presence(_) => None,
        }
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

/// Result of a routing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingResult {
    /// Stanza was queued to local stream(s).
    DeliveredLocal {
        /// Number of streams the stanza was queued to
        delivered_count: usize,
        /// Number of targeted streams that could not take it
        offline_count: usize,
    },
    /// Stanza was handed to the federation channel.
    SentToRemote {
        /// The remote domain the stanza is headed for
        domain: String,
    },
    /// No destination JID in stanza.
    NoDestination,
    /// The destination is remote and no federation channel is configured.
    FederationDisabled,
}

/// A bound client session as seen by the presence engine.
pub trait UserStream: Send + Sync {
    /// Full JID bound to this stream.
    fn jid(&self) -> &FullJid;

    /// Queue a stanza for delivery on this stream.
    fn send_element(&self, stanza: Stanza);

    /// Whether the client requested its roster during this session, and so
    /// expects roster pushes.
    fn roster_requested(&self) -> bool;

    /// The last presence the client sent on this stream, if any.
    fn presence(&self) -> Option<Presence>;
}

/// Delivery of addressed stanzas to local or remote destinations.
pub trait Router: Send + Sync + 'static {
    /// Best-effort, non-blocking delivery.
    fn route(&self, stanza: Stanza) -> RoutingResult;

    /// Every stream currently bound by a local username.
    fn user_streams(&self, username: &str) -> Vec<Arc<dyn UserStream>>;
}
