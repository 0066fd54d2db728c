//! # xmpp-presence
//!
//! RFC 6121 presence subscription and presence fan-out for XMPP servers.
//!
//! The crate keeps per-user rosters consistent as subscription verbs flow
//! between two parties, tracks which resources are online, and decides who
//! receives each presence stanza. It does not own the wire: stanzas arrive
//! already parsed and addressed, and leave through a [`Router`].
//!
//! ## Architecture
//!
//! - **Dispatcher**: [`PresenceDispatcher::process_presence`] classifies each
//!   stanza as a subscription verb, a probe or an availability change
//! - **Subscription Engine**: per-verb roster updates on both sides of a
//!   relationship, pending request bookkeeping, stamped forwarding
//! - **Online Registry**: concurrent map of online full JIDs to their latest
//!   presence
//! - **Roster Pushes**: every roster write is pushed to the owner's resources
//!   that requested the roster
//!
//! Storage and routing are injected through [`RelationshipStore`] and
//! [`Router`]; [`PresenceContext`] wires them together.

pub mod config;
pub mod hosts;
pub mod metrics;
pub mod presence;
pub mod roster;
pub mod router;
pub mod storage;

mod error;

pub use config::PresenceConfig;
pub use error::PresenceError;
pub use hosts::{Hosts, LocalHosts};
pub use presence::{
    OnlinePresences, PresenceDispatcher, PresenceKind, SubscriptionEngine,
    SubscriptionStateMachine, SubscriptionVerb,
};
pub use roster::{Notification, RosterItem, RosterPushNotifier, Subscription, User};
pub use router::{LocalRouter, Router, RoutingResult, Stanza, UserStream};
pub use storage::{MemoryStore, RelationshipStore, StorageError};

use std::sync::Arc;

use tracing::info;

/// Shared state of the presence subsystem.
///
/// Built once at startup and cloned into whatever handles client and
/// server-to-server streams.
#[derive(Clone)]
pub struct PresenceContext {
    pub config: PresenceConfig,
    pub store: Arc<dyn RelationshipStore>,
    pub router: Arc<dyn Router>,
    pub hosts: Arc<dyn Hosts>,
    pub online: Arc<OnlinePresences>,
}

impl PresenceContext {
    pub fn new(
        config: PresenceConfig,
        store: Arc<dyn RelationshipStore>,
        router: Arc<dyn Router>,
        hosts: Arc<dyn Hosts>,
    ) -> Self {
        info!(
            versioning = config.versioning,
            hosts = ?config.hosts,
            "Creating presence context"
        );
        Self {
            config,
            store,
            router,
            hosts,
            online: Arc::new(OnlinePresences::new()),
        }
    }

    /// A dispatcher sharing this context's store, router and registry.
    pub fn dispatcher(&self) -> PresenceDispatcher {
        PresenceDispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.router),
            Arc::clone(&self.hosts),
            Arc::clone(&self.online),
            self.config.versioning,
        )
    }

    /// A roster push notifier for roster management outside presence
    /// handling (roster `set`/`remove` requests).
    pub fn roster_pusher(&self) -> RosterPushNotifier {
        RosterPushNotifier::new(
            Arc::clone(&self.store),
            Arc::clone(&self.router),
            self.config.versioning,
        )
    }
}

impl std::fmt::Debug for PresenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceContext")
            .field("config", &self.config)
            .field("online", &self.online)
            .finish()
    }
}
