//! RFC 6121 presence subscription handling.
//!
//! A subscription verb always involves two bare JIDs: the sender of the
//! stanza and its addressee. Each side that is hosted locally has its own
//! roster item about the other, and both items are updated independently.
//!
//! ## State Transitions
//!
//! `subscribe` (A to B), on A's item:
//! - to/both → unchanged, nothing forwarded
//! - ask already set → unchanged, request forwarded again
//! - otherwise → ask set
//!
//! `subscribed` (B to A):
//! - B's item: none → from, to → both (created as from when missing)
//! - A's item: none → to, from → both, ask cleared
//!
//! `unsubscribe` (A to B):
//! - A's item: both → from, otherwise → none
//! - B's item: both → to, otherwise → none
//!
//! `unsubscribed` (B to A):
//! - B's item: both → to, otherwise → none; untouched when this cancels a
//!   pending request from A
//! - A's item: without a pending request both → from, otherwise → none;
//!   ask cleared
//!
//! All roster writes and notification writes of a verb finish before any
//! roster push or presence leaves the engine. A storage failure therefore
//! aborts the verb with nothing emitted, though writes already done stay.
//! Writes are ordered so that retrying the verb repairs the state: a pending
//! request is stored before the requester's `ask` is set, and is deleted by a
//! cancellation only after both items are written.
//!
//! Reads and writes of one relationship are not serialized: two verbs racing
//! on the same pair of items can interleave and the last write wins.

use std::sync::Arc;

use jid::{BareJid, Jid};
use tracing::{debug, info, instrument};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use super::{build_presence, is_available, local_username, restamp};
use crate::hosts::Hosts;
use crate::roster::{Notification, RosterItem, RosterPush, RosterPushNotifier, Subscription};
use crate::router::{Router, Stanza};
use crate::storage::{RelationshipStore, StorageError};
use crate::PresenceError;

/// Presence subscription verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionVerb {
    /// Request to subscribe to another user's presence.
    Subscribe,
    /// Approval of a subscription request.
    Subscribed,
    /// Request to stop receiving another user's presence.
    Unsubscribe,
    /// Denial or revocation of a subscription.
    Unsubscribed,
}

impl SubscriptionVerb {
    /// Convert from xmpp_parsers presence type.
    pub fn from_presence_type(ptype: &PresenceType) -> Option<Self> {
        match ptype {
            PresenceType::Subscribe => Some(SubscriptionVerb::Subscribe),
            PresenceType::Subscribed => Some(SubscriptionVerb::Subscribed),
            PresenceType::Unsubscribe => Some(SubscriptionVerb::Unsubscribe),
            PresenceType::Unsubscribed => Some(SubscriptionVerb::Unsubscribed),
            _ => None,
        }
    }

    /// Convert to xmpp_parsers presence type.
    pub fn to_presence_type(&self) -> PresenceType {
        match self {
            SubscriptionVerb::Subscribe => PresenceType::Subscribe,
            SubscriptionVerb::Subscribed => PresenceType::Subscribed,
            SubscriptionVerb::Unsubscribe => PresenceType::Unsubscribe,
            SubscriptionVerb::Unsubscribed => PresenceType::Unsubscribed,
        }
    }

    /// Get the string representation for the type attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionVerb::Subscribe => "subscribe",
            SubscriptionVerb::Subscribed => "subscribed",
            SubscriptionVerb::Unsubscribe => "unsubscribe",
            SubscriptionVerb::Unsubscribed => "unsubscribed",
        }
    }
}

/// What an outbound `subscribe` should do given the sender's current item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The sender already receives the contact's presence.
    AlreadySubscribed,
    /// A request is already outstanding; forward again, store nothing.
    AlreadyAsked,
    /// Mark the request as outstanding and forward it.
    Ask,
}

/// Pure subscription state transitions.
#[derive(Debug, Clone)]
pub struct SubscriptionStateMachine;

impl SubscriptionStateMachine {
    /// Classify an outbound `subscribe` against the sender's item.
    pub fn subscribe_outcome(item: Option<&RosterItem>) -> SubscribeOutcome {
        match item {
            Some(item) if item.subscription.receives_presence() => {
                SubscribeOutcome::AlreadySubscribed
            }
            Some(item) if item.ask => SubscribeOutcome::AlreadyAsked,
            _ => SubscribeOutcome::Ask,
        }
    }

    /// Apply an outbound subscribe request: sets ask.
    pub fn apply_outbound_subscribe(item: &mut RosterItem) {
        item.ask = true;
        debug!(
            contact = %item.jid,
            subscription = %item.subscription,
            "Applied outbound subscribe"
        );
    }

    /// Apply an inbound subscribed response to the requester's item.
    ///
    /// - none → to
    /// - from → both
    ///
    /// Returns false, leaving the item alone, when it already receives the
    /// contact's presence.
    pub fn apply_inbound_subscribed(item: &mut RosterItem) -> bool {
        let new_subscription = match item.subscription {
            Subscription::None => Subscription::To,
            Subscription::From => Subscription::Both,
            Subscription::To | Subscription::Both => return false,
        };
        item.subscription = new_subscription;
        item.ask = false;
        debug!(
            contact = %item.jid,
            subscription = %item.subscription,
            "Applied inbound subscribed"
        );
        true
    }

    /// Apply an outbound subscribed response to the approver's item.
    ///
    /// - none → from
    /// - to → both
    pub fn apply_outbound_subscribed(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::None => Subscription::From,
            Subscription::To => Subscription::Both,
            other => other,
        };
        debug!(
            contact = %item.jid,
            subscription = %item.subscription,
            "Applied outbound subscribed"
        );
    }

    /// Apply an outbound unsubscribe request to the sender's item.
    ///
    /// - both → from
    /// - anything else → none
    pub fn apply_outbound_unsubscribe(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::Both => Subscription::From,
            _ => Subscription::None,
        };
        debug!(
            contact = %item.jid,
            subscription = %item.subscription,
            "Applied outbound unsubscribe"
        );
    }

    /// Stop sharing presence with the contact: the addressee side of
    /// `unsubscribe` and the sender side of `unsubscribed`.
    ///
    /// - both → to
    /// - anything else → none
    pub fn apply_revoke(item: &mut RosterItem) {
        item.subscription = match item.subscription {
            Subscription::Both => Subscription::To,
            _ => Subscription::None,
        };
        debug!(
            contact = %item.jid,
            subscription = %item.subscription,
            "Applied revoke"
        );
    }

    /// Apply an inbound unsubscribed response to the requester's item.
    ///
    /// A pending request (`ask` set, or `cancelling` a stored request) is
    /// simply dropped. Otherwise:
    /// - both → from
    /// - anything else → none
    pub fn apply_inbound_unsubscribed(item: &mut RosterItem, cancelling: bool) {
        if !item.ask && !cancelling {
            item.subscription = match item.subscription {
                Subscription::Both => Subscription::From,
                _ => Subscription::None,
            };
        }
        item.ask = false;
        debug!(
            contact = %item.jid,
            subscription = %item.subscription,
            "Applied inbound unsubscribed"
        );
    }
}

/// Side effects collected while a verb runs, emitted once all writes are done.
#[derive(Debug, Default)]
struct Effects {
    pushes: Vec<RosterPush>,
    presences: Vec<Presence>,
    echo: Option<Echo>,
}

/// Presence from every resource of `from` to the bare `to`.
#[derive(Debug)]
struct Echo {
    from: BareJid,
    to: BareJid,
    type_: PresenceType,
}

/// Executes subscription verbs against the store and the router.
pub struct SubscriptionEngine {
    store: Arc<dyn RelationshipStore>,
    router: Arc<dyn Router>,
    hosts: Arc<dyn Hosts>,
    pusher: RosterPushNotifier,
}

impl SubscriptionEngine {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        router: Arc<dyn Router>,
        hosts: Arc<dyn Hosts>,
        versioning: bool,
    ) -> Self {
        let pusher = RosterPushNotifier::new(Arc::clone(&store), Arc::clone(&router), versioning);
        Self {
            store,
            router,
            hosts,
            pusher,
        }
    }

    /// Run one verb from `from` to `to`. `source` supplies the payload copied
    /// into the forwarded stanza.
    pub async fn process(
        &self,
        verb: SubscriptionVerb,
        from: &BareJid,
        to: &BareJid,
        source: &Presence,
    ) -> Result<(), PresenceError> {
        match verb {
            SubscriptionVerb::Subscribe => self.subscribe(from, to, source).await,
            SubscriptionVerb::Subscribed => self.subscribed(from, to, source).await,
            SubscriptionVerb::Unsubscribe => self.unsubscribe(from, to, source).await,
            SubscriptionVerb::Unsubscribed => self.unsubscribed(from, to, source).await,
        }
    }

    /// `user` asks to receive `contact`'s presence.
    #[instrument(skip(self, source), fields(user = %user, contact = %contact))]
    pub async fn subscribe(
        &self,
        user: &BareJid,
        contact: &BareJid,
        source: &Presence,
    ) -> Result<(), PresenceError> {
        info!(user = %user, contact = %contact, "Processing subscribe");
        let mut effects = Effects::default();
        let mut repeated = false;
        let mut asking = None;

        if let Some(username) = local_username(self.hosts.as_ref(), user) {
            let existing = self.store.fetch_item(username, contact).await?;
            match SubscriptionStateMachine::subscribe_outcome(existing.as_ref()) {
                SubscribeOutcome::AlreadySubscribed => {
                    debug!("Already subscribed, ignoring");
                    return Ok(());
                }
                SubscribeOutcome::AlreadyAsked => {
                    debug!("Request already pending, forwarding only");
                    repeated = true;
                }
                SubscribeOutcome::Ask => {
                    let mut item = existing
                        .unwrap_or_else(|| RosterItem::new(username, contact.clone()));
                    SubscriptionStateMachine::apply_outbound_subscribe(&mut item);
                    asking = Some(item);
                }
            }
        }

        let stamped = restamp(
            source,
            Jid::from(user.clone()),
            Jid::from(contact.clone()),
            PresenceType::Subscribe,
        );

        // The request is stored before `ask` is set, so a failed write never
        // leaves `ask` pointing at a request the contact does not have.
        if !repeated {
            if let Some(contact_name) = local_username(self.hosts.as_ref(), contact) {
                let notification =
                    Notification::new(contact_name, user.clone(), stamped.clone());
                self.store.upsert_notification(&notification).await?;
                debug!(contact = %contact_name, "Stored pending subscription request");
            }
        }
        if let Some(item) = asking {
            effects.pushes.push(self.pusher.commit(&item).await?);
        }

        effects.presences.push(stamped);
        self.flush(effects);
        Ok(())
    }

    /// `contact` approves `user`'s subscription.
    #[instrument(skip(self, source), fields(contact = %contact, user = %user))]
    pub async fn subscribed(
        &self,
        contact: &BareJid,
        user: &BareJid,
        source: &Presence,
    ) -> Result<(), PresenceError> {
        info!(user = %user, contact = %contact, "Processing subscribed");
        let mut effects = Effects::default();

        if let Some(contact_name) = local_username(self.hosts.as_ref(), contact) {
            self.take_notification(contact_name, user).await?;
            let mut item = self
                .store
                .fetch_item(contact_name, user)
                .await?
                .unwrap_or_else(|| RosterItem::new(contact_name, user.clone()));
            SubscriptionStateMachine::apply_outbound_subscribed(&mut item);
            effects.pushes.push(self.pusher.commit(&item).await?);
        }

        if let Some(username) = local_username(self.hosts.as_ref(), user) {
            if let Some(mut item) = self.store.fetch_item(username, contact).await? {
                if !SubscriptionStateMachine::apply_inbound_subscribed(&mut item) {
                    debug!("User already subscribed, nothing to forward");
                    self.flush(effects);
                    return Ok(());
                }
                effects.pushes.push(self.pusher.commit(&item).await?);
            }
        }

        effects.presences.push(restamp(
            source,
            Jid::from(contact.clone()),
            Jid::from(user.clone()),
            PresenceType::Subscribed,
        ));
        effects.echo = Some(Echo {
            from: contact.clone(),
            to: user.clone(),
            type_: PresenceType::None,
        });
        self.flush(effects);
        Ok(())
    }

    /// `user` stops receiving `contact`'s presence.
    #[instrument(skip(self, source), fields(user = %user, contact = %contact))]
    pub async fn unsubscribe(
        &self,
        user: &BareJid,
        contact: &BareJid,
        source: &Presence,
    ) -> Result<(), PresenceError> {
        info!(user = %user, contact = %contact, "Processing unsubscribe");
        let mut effects = Effects::default();
        let mut previous = Subscription::None;

        if let Some(username) = local_username(self.hosts.as_ref(), user) {
            if let Some(mut item) = self.store.fetch_item(username, contact).await? {
                previous = item.subscription;
                SubscriptionStateMachine::apply_outbound_unsubscribe(&mut item);
                effects.pushes.push(self.pusher.commit(&item).await?);
            }
        }

        if let Some(contact_name) = local_username(self.hosts.as_ref(), contact) {
            if let Some(mut item) = self.store.fetch_item(contact_name, user).await? {
                SubscriptionStateMachine::apply_revoke(&mut item);
                effects.pushes.push(self.pusher.commit(&item).await?);
            }
        }

        effects.presences.push(restamp(
            source,
            Jid::from(user.clone()),
            Jid::from(contact.clone()),
            PresenceType::Unsubscribe,
        ));
        if previous.receives_presence() {
            effects.echo = Some(Echo {
                from: contact.clone(),
                to: user.clone(),
                type_: PresenceType::Unavailable,
            });
        }
        self.flush(effects);
        Ok(())
    }

    /// `contact` denies or revokes `user`'s subscription.
    #[instrument(skip(self, source), fields(contact = %contact, user = %user))]
    pub async fn unsubscribed(
        &self,
        contact: &BareJid,
        user: &BareJid,
        source: &Presence,
    ) -> Result<(), PresenceError> {
        info!(user = %user, contact = %contact, "Processing unsubscribed");
        let mut effects = Effects::default();
        let mut previous = Subscription::None;

        let contact_name = local_username(self.hosts.as_ref(), contact);
        let cancelling = match contact_name {
            Some(contact_name) => self
                .store
                .fetch_notification(contact_name, user)
                .await?
                .is_some(),
            None => false,
        };

        if let Some(contact_name) = contact_name {
            if cancelling {
                debug!("Cancelling pending request, contact state untouched");
            } else if let Some(mut item) = self.store.fetch_item(contact_name, user).await? {
                previous = item.subscription;
                SubscriptionStateMachine::apply_revoke(&mut item);
                effects.pushes.push(self.pusher.commit(&item).await?);
            }
        }

        if let Some(username) = local_username(self.hosts.as_ref(), user) {
            if let Some(mut item) = self.store.fetch_item(username, contact).await? {
                SubscriptionStateMachine::apply_inbound_unsubscribed(&mut item, cancelling);
                effects.pushes.push(self.pusher.commit(&item).await?);
            }
        }

        // Dropped last: while it exists a retry still takes the cancellation path.
        if let (true, Some(contact_name)) = (cancelling, contact_name) {
            self.store.delete_notification(contact_name, user).await?;
            debug!(contact = %contact_name, requester = %user, "Deleted pending subscription request");
        }

        effects.presences.push(restamp(
            source,
            Jid::from(contact.clone()),
            Jid::from(user.clone()),
            PresenceType::Unsubscribed,
        ));
        if previous.shares_presence() {
            effects.echo = Some(Echo {
                from: contact.clone(),
                to: user.clone(),
                type_: PresenceType::Unavailable,
            });
        }
        self.flush(effects);
        Ok(())
    }

    /// Delete the pending request from `requester`, reporting whether one existed.
    async fn take_notification(
        &self,
        contact: &str,
        requester: &BareJid,
    ) -> Result<bool, StorageError> {
        if self
            .store
            .fetch_notification(contact, requester)
            .await?
            .is_none()
        {
            return Ok(false);
        }
        self.store.delete_notification(contact, requester).await?;
        debug!(contact = %contact, requester = %requester, "Deleted pending subscription request");
        Ok(true)
    }

    fn flush(&self, effects: Effects) {
        for push in &effects.pushes {
            self.pusher.deliver(push);
        }
        for presence in effects.presences {
            self.router.route(Stanza::Presence(presence));
        }
        if let Some(echo) = effects.echo {
            self.route_presences_from(&echo.from, &echo.to, echo.type_);
        }
    }

    /// Send a presence of `type_` from each bound resource of `from` to the
    /// bare `to`, carrying the resource's current availability when it has one.
    pub(crate) fn route_presences_from(&self, from: &BareJid, to: &BareJid, type_: PresenceType) {
        let Some(username) = local_username(self.hosts.as_ref(), from) else {
            return;
        };
        for stream in self.router.user_streams(username) {
            let from_jid = Jid::from(stream.jid().clone());
            let to_jid = Jid::from(to.clone());
            let presence = match stream.presence() {
                Some(current) if is_available(&current) => {
                    restamp(&current, from_jid, to_jid, type_.clone())
                }
                _ => build_presence(from_jid, to_jid, type_.clone()),
            };
            self.router.route(Stanza::Presence(presence));
        }
    }
}

impl std::fmt::Debug for SubscriptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEngine")
            .field("pusher", &self.pusher)
            .finish()
    }
}
