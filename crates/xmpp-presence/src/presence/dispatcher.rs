//! Presence dispatch.
//!
//! [`PresenceDispatcher::process_presence`] is the single entry point for
//! presence stanzas whose addresses have already been validated by the
//! session layer. It classifies each stanza and hands it to:
//!
//! - the [`SubscriptionEngine`] for subscribe/subscribed/unsubscribe/unsubscribed
//! - probe handling, which answers from the stored last presence
//! - availability handling, which maintains the online registry, delivers
//!   pending state when a resource comes online and broadcasts the user's
//!   presence to contacts that are subscribed to it

use std::sync::Arc;
use std::time::Instant;

use jid::{BareJid, Jid};
use tracing::{debug, info, instrument};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use super::{
    build_presence, is_available, local_username, restamp, OnlinePresences, PresenceKind,
    SubscriptionEngine,
};
use crate::hosts::Hosts;
use crate::router::{Router, Stanza};
use crate::storage::RelationshipStore;
use crate::{metrics, PresenceError};

/// Routes presence stanzas to the subscription engine, probe handling or
/// availability handling.
pub struct PresenceDispatcher {
    store: Arc<dyn RelationshipStore>,
    router: Arc<dyn Router>,
    hosts: Arc<dyn Hosts>,
    online: Arc<OnlinePresences>,
    engine: SubscriptionEngine,
}

impl PresenceDispatcher {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        router: Arc<dyn Router>,
        hosts: Arc<dyn Hosts>,
        online: Arc<OnlinePresences>,
        versioning: bool,
    ) -> Self {
        let engine = SubscriptionEngine::new(
            Arc::clone(&store),
            Arc::clone(&router),
            Arc::clone(&hosts),
            versioning,
        );
        Self {
            store,
            router,
            hosts,
            online,
            engine,
        }
    }

    /// The subscription engine used for subscription verbs.
    pub fn engine(&self) -> &SubscriptionEngine {
        &self.engine
    }

    /// Process one inbound presence stanza.
    ///
    /// Fails with [`PresenceError::BadRequest`] when `from` is missing, or when
    /// `to` is missing on a subscription verb or probe. Storage failures abort
    /// the stanza before anything is routed. Types this engine does not act
    /// upon are accepted and dropped.
    #[instrument(
        skip(self, presence),
        fields(kind = tracing::field::Empty, from = tracing::field::Empty)
    )]
    pub async fn process_presence(&self, presence: Presence) -> Result<(), PresenceError> {
        let start = Instant::now();
        let kind = PresenceKind::of(&presence);
        tracing::Span::current().record("kind", kind.as_str());

        let result = self.dispatch(kind, presence).await;

        metrics::record_presence(kind.as_str(), result.is_ok());
        metrics::record_presence_latency(start.elapsed().as_secs_f64() * 1000.0, kind.as_str());
        result
    }

    /// Online presences whose full JID matches `jid` at its granularity.
    pub fn online_presences_matching(&self, jid: &Jid) -> Vec<Presence> {
        self.online.matching(jid)
    }

    async fn dispatch(&self, kind: PresenceKind, presence: Presence) -> Result<(), PresenceError> {
        let from = presence
            .from
            .clone()
            .ok_or_else(|| PresenceError::bad_request("Presence must have a 'from' attribute"))?;
        tracing::Span::current().record("from", tracing::field::display(&from));

        match kind {
            PresenceKind::Subscription(verb) => {
                let to = required_to(&presence, verb.as_str())?;
                metrics::record_subscription(verb.as_str());
                self.engine
                    .process(verb, &from.to_bare(), &to.to_bare(), &presence)
                    .await
            }
            PresenceKind::Probe => {
                let to = required_to(&presence, "probe")?;
                self.process_probe(presence, &from, &to).await
            }
            PresenceKind::Availability => self.process_availability(presence, from).await,
            PresenceKind::Other => {
                debug!(type_ = ?presence.type_, "Dropping presence of unhandled type");
                Ok(())
            }
        }
    }

    async fn process_probe(
        &self,
        presence: Presence,
        from: &Jid,
        to: &Jid,
    ) -> Result<(), PresenceError> {
        let user = to.to_bare();
        let prober = from.to_bare();
        info!(user = %user, contact = %prober, "Processing probe");

        if !self.hosts.is_local_host(user.domain().as_str()) {
            debug!("Probe target is remote, forwarding");
            self.router.route(Stanza::Presence(presence));
            metrics::record_probe("forwarded");
            return Ok(());
        }

        let (item, record) = match super::username(&user) {
            Some(username) => (
                self.store.fetch_item(username, &prober).await?,
                self.store.fetch_user(username).await?,
            ),
            None => (None, None),
        };

        let authorized = item.is_some_and(|item| item.subscription.shares_presence());
        let record = match record {
            Some(record) if authorized => record,
            _ => {
                debug!("Prober not authorized, answering unsubscribed");
                self.router.route(Stanza::Presence(build_presence(
                    Jid::from(user),
                    Jid::from(prober),
                    PresenceType::Unsubscribed,
                )));
                metrics::record_probe("denied");
                return Ok(());
            }
        };

        match record.last_presence {
            Some(last) => {
                let last_from = last.from.clone().unwrap_or_else(|| Jid::from(user));
                let type_ = last.type_.clone();
                self.router.route(Stanza::Presence(restamp(
                    &last,
                    last_from,
                    Jid::from(prober),
                    type_,
                )));
                metrics::record_probe("replayed");
            }
            None => {
                debug!("No stored presence to replay");
                metrics::record_probe("empty");
            }
        }
        Ok(())
    }

    async fn process_availability(
        &self,
        presence: Presence,
        from: Jid,
    ) -> Result<(), PresenceError> {
        let user = from.to_bare();
        // Undirected or self-addressed presence from a local account is
        // handled on the user's behalf; anything else is forwarded untouched.
        let on_behalf = local_username(self.hosts.as_ref(), &user).filter(|_| {
            presence
                .to
                .as_ref()
                .map_or(true, |to| to.to_bare() == user)
        });

        let newly_online = if is_available(&presence) {
            info!(jid = %from, "Processing available");
            self.online.store(&from, presence.clone())
        } else {
            info!(jid = %from, "Processing unavailable");
            self.online.remove(&from);
            false
        };

        let collected = self
            .availability_presences(presence, on_behalf, &user, &from, newly_online)
            .await;
        if collected.is_err() && newly_online {
            // A retry must still see the resource as coming online.
            debug!(jid = %from, "Availability failed, unregistering resource");
            self.online.remove(&from);
        }
        metrics::record_online_count(self.online.len());

        for presence in collected? {
            self.router.route(Stanza::Presence(presence));
        }
        Ok(())
    }

    async fn availability_presences(
        &self,
        presence: Presence,
        on_behalf: Option<&str>,
        user: &BareJid,
        from: &Jid,
        newly_online: bool,
    ) -> Result<Vec<Presence>, PresenceError> {
        let Some(username) = on_behalf else {
            return Ok(vec![presence]);
        };
        let mut outbound = Vec::new();
        if newly_online {
            outbound.extend(self.login_presences(username, user, from).await?);
        }
        outbound.extend(self.broadcast_presences(username, &presence, from).await?);
        Ok(outbound)
    }

    /// Everything a resource coming online must receive: pending subscription
    /// requests, then the availability of contacts it is subscribed to.
    async fn login_presences(
        &self,
        username: &str,
        user: &BareJid,
        resource: &Jid,
    ) -> Result<Vec<Presence>, PresenceError> {
        let mut presences = Vec::new();

        for notification in self.store.fetch_notifications(username).await? {
            presences.push(restamp(
                &notification.presence,
                Jid::from(notification.jid.clone()),
                resource.clone(),
                PresenceType::Subscribe,
            ));
        }

        for item in self.store.fetch_items(username).await? {
            if !item.subscription.receives_presence() {
                continue;
            }
            if !self.hosts.is_local_host(item.jid.domain().as_str()) {
                presences.push(build_presence(
                    Jid::from(user.clone()),
                    Jid::from(item.jid.clone()),
                    PresenceType::Probe,
                ));
                continue;
            }
            let contact = Jid::from(item.jid.clone());
            for online in self.online.matching(&contact) {
                let online_from = online.from.clone().unwrap_or_else(|| contact.clone());
                let type_ = online.type_.clone();
                presences.push(restamp(&online, online_from, resource.clone(), type_));
            }
        }

        debug!(user = %user, count = presences.len(), "Collected login presences");
        Ok(presences)
    }

    /// Copies of `presence` for every contact subscribed to the user. The
    /// presence is persisted as the user's last presence before returning.
    async fn broadcast_presences(
        &self,
        username: &str,
        presence: &Presence,
        from: &Jid,
    ) -> Result<Vec<Presence>, PresenceError> {
        let presences: Vec<Presence> = self
            .store
            .fetch_items(username)
            .await?
            .into_iter()
            .filter(|item| item.subscription.shares_presence())
            .map(|item| {
                restamp(
                    presence,
                    from.clone(),
                    Jid::from(item.jid),
                    presence.type_.clone(),
                )
            })
            .collect();

        if let Some(record) = self.store.fetch_user(username).await? {
            self.store
                .upsert_user(&record.with_last_presence(presence.clone()))
                .await?;
        }

        debug!(user = %username, count = presences.len(), "Broadcasting presence");
        Ok(presences)
    }
}

impl std::fmt::Debug for PresenceDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceDispatcher")
            .field("online", &self.online)
            .field("engine", &self.engine)
            .finish()
    }
}

fn required_to(presence: &Presence, kind: &str) -> Result<Jid, PresenceError> {
    presence.to.clone().ok_or_else(|| {
        PresenceError::bad_request(format!("'{}' presence must have a 'to' attribute", kind))
    })
}
