//! In-memory relationship store.
//!
//! Backed by `DashMap`s so that it can be shared across tasks without an
//! outer lock. Useful for tests and single-node deployments that do not need
//! durability.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::BareJid;
use tracing::debug;

use super::{RelationshipStore, StorageError};
use crate::roster::{Notification, RosterItem, User};

#[derive(Debug, Default)]
struct OwnerRoster {
    version: u64,
    items: BTreeMap<String, RosterItem>,
}

/// Relationship store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    rosters: DashMap<String, OwnerRoster>,
    notifications: DashMap<(String, String), Notification>,
    users: DashMap<String, User>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current roster version of a user (0 if the user never had an item).
    pub fn roster_version(&self, username: &str) -> u64 {
        self.rosters
            .get(username)
            .map(|roster| roster.version)
            .unwrap_or(0)
    }

    /// Number of pending notifications across all users.
    pub fn notification_count(&self) -> usize {
        self.notifications.len()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("rosters", &self.rosters.len())
            .field("notifications", &self.notifications.len())
            .field("users", &self.users.len())
            .finish()
    }
}

#[async_trait]
impl RelationshipStore for MemoryStore {
    async fn fetch_item(
        &self,
        username: &str,
        contact: &BareJid,
    ) -> Result<Option<RosterItem>, StorageError> {
        Ok(self
            .rosters
            .get(username)
            .and_then(|roster| roster.items.get(&contact.to_string()).cloned()))
    }

    async fn fetch_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError> {
        Ok(self
            .rosters
            .get(username)
            .map(|roster| roster.items.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_item(&self, item: &RosterItem) -> Result<u64, StorageError> {
        let mut roster = self.rosters.entry(item.username.clone()).or_default();
        roster.version += 1;
        let version = roster.version;

        let mut stored = item.clone();
        stored.ver = version;
        roster.items.insert(item.jid.to_string(), stored);

        debug!(
            user = %item.username,
            contact = %item.jid,
            subscription = %item.subscription,
            ask = item.ask,
            version,
            "Stored roster item"
        );
        Ok(version)
    }

    async fn delete_item(&self, username: &str, contact: &BareJid) -> Result<u64, StorageError> {
        let mut roster = self.rosters.entry(username.to_string()).or_default();
        if roster.items.remove(&contact.to_string()).is_some() {
            roster.version += 1;
            debug!(user = %username, contact = %contact, "Deleted roster item");
        }
        Ok(roster.version)
    }

    async fn fetch_notification(
        &self,
        contact: &str,
        requester: &BareJid,
    ) -> Result<Option<Notification>, StorageError> {
        Ok(self
            .notifications
            .get(&(contact.to_string(), requester.to_string()))
            .map(|n| n.value().clone()))
    }

    async fn fetch_notifications(&self, contact: &str) -> Result<Vec<Notification>, StorageError> {
        let mut pending: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|entry| entry.key().0 == contact)
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.jid.to_string().cmp(&b.jid.to_string()))
        });
        Ok(pending)
    }

    async fn upsert_notification(&self, notification: &Notification) -> Result<(), StorageError> {
        self.notifications.insert(
            (notification.contact.clone(), notification.jid.to_string()),
            notification.clone(),
        );
        Ok(())
    }

    async fn delete_notification(
        &self,
        contact: &str,
        requester: &BareJid,
    ) -> Result<(), StorageError> {
        self.notifications
            .remove(&(contact.to_string(), requester.to_string()));
        Ok(())
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        Ok(self.users.get(username).map(|u| u.value().clone()))
    }

    async fn upsert_user(&self, user: &User) -> Result<(), StorageError> {
        self.users.insert(user.username.clone(), user.clone());
        Ok(())
    }
}
