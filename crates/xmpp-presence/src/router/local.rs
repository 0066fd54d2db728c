//! In-process router over bound client streams.
//!
//! Streams are tracked by full JID in a `DashMap`; each one owns a bounded
//! channel feeding its connection's writer. Stanzas for domains that are not
//! local go to an optional federation channel.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::presence::Presence;

use super::{Router, RoutingResult, Stanza, UserStream};
use crate::config::PresenceConfig;
use crate::hosts::Hosts;

const DEFAULT_STREAM_BUFFER: usize = 256;

/// A client stream bound to a full JID.
pub struct BoundStream {
    jid: FullJid,
    sender: mpsc::Sender<Stanza>,
    roster_requested: AtomicBool,
    presence: RwLock<Option<Presence>>,
}

impl BoundStream {
    pub fn new(jid: FullJid, sender: mpsc::Sender<Stanza>) -> Self {
        Self {
            jid,
            sender,
            roster_requested: AtomicBool::new(false),
            presence: RwLock::new(None),
        }
    }

    /// Record that the client fetched its roster and wants pushes.
    pub fn set_roster_requested(&self, requested: bool) {
        self.roster_requested.store(requested, Ordering::Relaxed);
    }

    /// Record the last presence sent by the client on this stream.
    pub fn set_presence(&self, presence: Option<Presence>) {
        *self.presence.write() = presence;
    }

    /// Queue a stanza, reporting whether the channel accepted it.
    fn try_deliver(&self, stanza: Stanza) -> bool {
        match self.sender.try_send(stanza) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(jid = %self.jid, "Outbound channel full, dropping stanza");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(jid = %self.jid, "Outbound channel closed, connection may have dropped");
                false
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl UserStream for BoundStream {
    fn jid(&self) -> &FullJid {
        &self.jid
    }

    fn send_element(&self, stanza: Stanza) {
        self.try_deliver(stanza);
    }

    fn roster_requested(&self) -> bool {
        self.roster_requested.load(Ordering::Relaxed)
    }

    fn presence(&self) -> Option<Presence> {
        self.presence.read().clone()
    }
}

impl fmt::Debug for BoundStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundStream")
            .field("jid", &self.jid)
            .field("roster_requested", &self.roster_requested())
            .finish()
    }
}

/// Router delivering to locally bound streams.
pub struct LocalRouter {
    hosts: Arc<dyn Hosts>,
    streams: DashMap<FullJid, Arc<BoundStream>>,
    /// Capacity of channels created by [`LocalRouter::connect`]
    stream_buffer: usize,
    /// Federation hand-off for remote domains (None = federation disabled)
    remote: Option<mpsc::Sender<Stanza>>,
}

impl LocalRouter {
    pub fn new(hosts: Arc<dyn Hosts>) -> Self {
        info!("Creating local router");
        Self {
            hosts,
            streams: DashMap::new(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
            remote: None,
        }
    }

    /// A router for the configured hosts, sizing stream channels from
    /// `stream_buffer`.
    pub fn from_config(config: &PresenceConfig) -> Self {
        let hosts: Arc<dyn Hosts> = Arc::new(config.local_hosts());
        let mut router = Self::new(hosts);
        router.stream_buffer = config.stream_buffer;
        router
    }

    /// Forward stanzas for remote domains into `sender`.
    pub fn with_remote(mut self, sender: mpsc::Sender<Stanza>) -> Self {
        self.remote = Some(sender);
        self
    }

    /// Bind a stream, replacing any previous stream with the same full JID.
    #[instrument(skip(self, sender), fields(jid = %jid))]
    pub fn bind(&self, jid: FullJid, sender: mpsc::Sender<Stanza>) -> Arc<BoundStream> {
        let stream = Arc::new(BoundStream::new(jid.clone(), sender));
        if self.streams.insert(jid, Arc::clone(&stream)).is_some() {
            debug!("Replaced existing stream binding");
        } else {
            debug!("Bound new stream");
        }
        stream
    }

    /// Create the outbound channel for a new connection and bind it.
    ///
    /// The receiver feeds the connection's writer.
    pub fn connect(&self, jid: FullJid) -> (Arc<BoundStream>, mpsc::Receiver<Stanza>) {
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        (self.bind(jid, tx), rx)
    }

    /// Unbind a stream.
    #[instrument(skip(self), fields(jid = %jid))]
    pub fn unbind(&self, jid: &FullJid) -> Option<Arc<BoundStream>> {
        self.streams.remove(jid).map(|(_, stream)| stream)
    }

    pub fn stream(&self, jid: &FullJid) -> Option<Arc<BoundStream>> {
        self.streams.get(jid).map(|s| Arc::clone(s.value()))
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Drop streams whose connection went away without unbinding.
    pub fn cleanup_stale(&self) -> usize {
        let stale: Vec<FullJid> = self
            .streams
            .iter()
            .filter(|entry| entry.value().is_closed())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for jid in stale {
            if self.streams.remove(&jid).is_some() {
                debug!(jid = %jid, "Removed stale stream");
                removed += 1;
            }
        }
        removed
    }

    fn streams_for_bare(&self, bare: &BareJid) -> Vec<Arc<BoundStream>> {
        self.streams
            .iter()
            .filter(|entry| entry.key().to_bare() == *bare)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn route_local(&self, to: &Jid, stanza: Stanza) -> RoutingResult {
        let targets = match to.clone().try_into_full() {
            Ok(full) => self.stream(&full).into_iter().collect::<Vec<_>>(),
            Err(bare) => self.streams_for_bare(&bare),
        };

        if targets.is_empty() {
            debug!(to = %to, "No bound stream for destination");
            return RoutingResult::DeliveredLocal {
                delivered_count: 0,
                offline_count: 1,
            };
        }

        let mut delivered_count = 0;
        let mut offline_count = 0;
        for target in targets {
            if target.try_deliver(stanza.clone()) {
                delivered_count += 1;
            } else {
                offline_count += 1;
            }
        }
        RoutingResult::DeliveredLocal {
            delivered_count,
            offline_count,
        }
    }

    fn route_remote(&self, domain: &str, stanza: Stanza) -> RoutingResult {
        let Some(ref remote) = self.remote else {
            debug!(domain = %domain, "Federation disabled, dropping remote stanza");
            return RoutingResult::FederationDisabled;
        };
        if let Err(e) = remote.try_send(stanza) {
            warn!(domain = %domain, error = %e, "Failed to queue stanza for remote domain");
        }
        RoutingResult::SentToRemote {
            domain: domain.to_string(),
        }
    }
}

impl Router for LocalRouter {
    fn route(&self, stanza: Stanza) -> RoutingResult {
        let Some(to) = stanza.to().cloned() else {
            debug!("Stanza has no destination JID");
            return RoutingResult::NoDestination;
        };

        let domain = to.domain().as_str().to_string();
        if self.hosts.is_local_host(&domain) {
            self.route_local(&to, stanza)
        } else {
            self.route_remote(&domain, stanza)
        }
    }

    fn user_streams(&self, username: &str) -> Vec<Arc<dyn UserStream>> {
        self.streams
            .iter()
            .filter(|entry| {
                entry.key().node().map(|n| n.as_str()) == Some(username)
                    && self.hosts.is_local_host(entry.key().domain().as_str())
            })
            .map(|entry| Arc::clone(entry.value()) as Arc<dyn UserStream>)
            .collect()
    }
}

impl fmt::Debug for LocalRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRouter")
            .field("stream_count", &self.streams.len())
            .field("stream_buffer", &self.stream_buffer)
            .field("federation", &self.remote.is_some())
            .finish()
    }
}
