//! Roster pushes.
//!
//! Every roster write goes through [`RosterPushNotifier`]: the store assigns a
//! new per-owner version, and each of the owner's bound resources that has
//! requested its roster gets an `iq type='set'` carrying the updated item.
//!
//! Writing and delivering are split so a caller touching several items can
//! finish all of its writes before anything reaches the network.

use std::sync::Arc;

use jid::BareJid;
use minidom::Element;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{build_roster_push, removal_element, version_string, RosterItem};
use crate::router::{Router, Stanza};
use crate::storage::{RelationshipStore, StorageError};

/// A committed roster change waiting to be pushed.
#[derive(Debug, Clone)]
pub struct RosterPush {
    /// Local username owning the changed item.
    pub username: String,
    /// The `<item/>` to push (`subscription='remove'` for deletions).
    pub item: Element,
    /// Roster version after the change.
    pub ver: u64,
}

/// Writes roster items and pushes them to interested resources.
pub struct RosterPushNotifier {
    store: Arc<dyn RelationshipStore>,
    router: Arc<dyn Router>,
    versioning: bool,
}

impl RosterPushNotifier {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        router: Arc<dyn Router>,
        versioning: bool,
    ) -> Self {
        Self {
            store,
            router,
            versioning,
        }
    }

    /// Persist `item` without pushing it yet.
    pub async fn commit(&self, item: &RosterItem) -> Result<RosterPush, StorageError> {
        let ver = self.store.upsert_item(item).await?;
        let mut stored = item.clone();
        stored.ver = ver;
        debug!(
            user = %item.username,
            contact = %item.jid,
            subscription = %item.subscription,
            ask = item.ask,
            ver,
            "Committed roster item"
        );
        Ok(RosterPush {
            username: item.username.clone(),
            item: stored.to_element(),
            ver,
        })
    }

    /// Delete the item about `contact` without pushing the removal yet.
    pub async fn commit_delete(
        &self,
        username: &str,
        contact: &BareJid,
    ) -> Result<RosterPush, StorageError> {
        let ver = self.store.delete_item(username, contact).await?;
        debug!(user = %username, contact = %contact, ver, "Deleted roster item");
        Ok(RosterPush {
            username: username.to_string(),
            item: removal_element(contact),
            ver,
        })
    }

    /// Push a committed change to every resource of the owner that requested
    /// its roster. Returns how many pushes were queued.
    pub fn deliver(&self, push: &RosterPush) -> usize {
        let ver = self.versioning.then(|| version_string(push.ver));
        let mut pushed = 0;

        for stream in self.router.user_streams(&push.username) {
            if !stream.roster_requested() {
                continue;
            }
            let iq = build_roster_push(
                &Uuid::new_v4().to_string(),
                stream.jid(),
                push.item.clone(),
                ver.as_deref(),
            );
            stream.send_element(Stanza::Iq(iq));
            pushed += 1;
        }

        debug!(user = %push.username, ver = push.ver, pushed, "Delivered roster push");
        pushed
    }

    /// Persist `item` and push it immediately.
    #[instrument(skip(self, item), fields(user = %item.username, contact = %item.jid))]
    pub async fn insert_item(&self, item: &RosterItem) -> Result<RosterPush, StorageError> {
        let push = self.commit(item).await?;
        self.deliver(&push);
        Ok(push)
    }

    /// Delete the item about `contact` and push `subscription='remove'`.
    #[instrument(skip(self), fields(user = %username, contact = %contact))]
    pub async fn delete_item(
        &self,
        username: &str,
        contact: &BareJid,
    ) -> Result<RosterPush, StorageError> {
        let push = self.commit_delete(username, contact).await?;
        self.deliver(&push);
        Ok(push)
    }
}

impl std::fmt::Debug for RosterPushNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RosterPushNotifier")
            .field("versioning", &self.versioning)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::LocalHosts;
    use crate::roster::{Subscription, ROSTER_NS};
    use crate::router::LocalRouter;
    use crate::storage::MemoryStore;
    use jid::FullJid;
    use tokio::sync::mpsc;
    use xmpp_parsers::iq::IqType;

    struct Fixture {
        store: Arc<MemoryStore>,
        router: Arc<LocalRouter>,
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Arc::new(MemoryStore::new()),
            router: Arc::new(LocalRouter::new(Arc::new(LocalHosts::new(["example.com"])))),
        }
    }

    fn notifier(f: &Fixture, versioning: bool) -> RosterPushNotifier {
        RosterPushNotifier::new(f.store.clone(), f.router.clone(), versioning)
    }

    fn contact() -> BareJid {
        "bob@example.com".parse().unwrap()
    }

    fn query_of(stanza: Stanza) -> Element {
        match stanza {
            Stanza::Iq(iq) => match iq.payload {
                IqType::Set(query) => query,
                _ => panic!("Expected Set payload"),
            },
            other => panic!("Expected roster push, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_push_only_to_roster_requested_streams() {
        let f = fixture();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let phone: FullJid = "alice@example.com/phone".parse().unwrap();
        f.router.bind(phone.clone(), tx1).set_roster_requested(true);
        f.router.bind("alice@example.com/desk".parse().unwrap(), tx2);

        let item = RosterItem::new("alice", contact()).with_subscription(Subscription::To);
        let push = notifier(&f, false).insert_item(&item).await.unwrap();

        assert_eq!(push.ver, 1);
        let stanza = rx1.try_recv().unwrap();
        assert_eq!(stanza.to().unwrap().to_string(), phone.to_string());
        let query = query_of(stanza);
        assert_eq!(query.ns(), ROSTER_NS);
        assert_eq!(query.attr("ver"), None);
        assert_eq!(
            query.children().next().unwrap().attr("subscription"),
            Some("to")
        );
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_carries_version_when_enabled() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        f.router
            .bind("alice@example.com/phone".parse().unwrap(), tx)
            .set_roster_requested(true);

        let n = notifier(&f, true);
        n.insert_item(&RosterItem::new("alice", contact())).await.unwrap();
        n.insert_item(&RosterItem::new("alice", contact()).with_ask(true))
            .await
            .unwrap();

        assert_eq!(query_of(rx.try_recv().unwrap()).attr("ver"), Some("v1"));
        assert_eq!(query_of(rx.try_recv().unwrap()).attr("ver"), Some("v2"));
    }

    #[tokio::test]
    async fn test_commit_defers_delivery() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        f.router
            .bind("alice@example.com/phone".parse().unwrap(), tx)
            .set_roster_requested(true);

        let n = notifier(&f, false);
        let push = n.commit(&RosterItem::new("alice", contact())).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(f.store.fetch_item("alice", &contact()).await.unwrap().is_some());

        assert_eq!(n.deliver(&push), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_delete_item_pushes_removal() {
        let f = fixture();
        let (tx, mut rx) = mpsc::channel(4);
        f.router
            .bind("alice@example.com/phone".parse().unwrap(), tx)
            .set_roster_requested(true);

        let n = notifier(&f, true);
        n.commit(&RosterItem::new("alice", contact())).await.unwrap();
        let push = n.delete_item("alice", &contact()).await.unwrap();

        assert_eq!(push.ver, 2);
        assert!(f.store.fetch_item("alice", &contact()).await.unwrap().is_none());
        let query = query_of(rx.try_recv().unwrap());
        assert_eq!(query.attr("ver"), Some("v2"));
        let item = query.children().next().unwrap();
        assert_eq!(item.attr("subscription"), Some("remove"));
        assert_eq!(item.attr("jid"), Some("bob@example.com"));
    }
}
