//! Relationship store interface.
//!
//! The presence engine never owns roster items, notifications or user
//! records: it reads a transient copy, computes the next state and writes it
//! back through this trait. Backends are responsible for their own timeouts
//! and retries; every failure surfaces as a [`StorageError`].

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use jid::BareJid;
use thiserror::Error;

use crate::roster::{Notification, RosterItem, User};

/// Relationship store failures.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Backend unreachable or failing.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Write rejected by the backend.
    #[error("Write conflict: {0}")]
    Conflict(String),
}

impl StorageError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// Durable storage of roster items, pending notifications and users.
///
/// Items are keyed by (owner username, contact bare JID); notifications by
/// (contact username, requester bare JID).
#[async_trait]
pub trait RelationshipStore: Send + Sync + 'static {
    /// Fetch one roster item.
    async fn fetch_item(
        &self,
        username: &str,
        contact: &BareJid,
    ) -> Result<Option<RosterItem>, StorageError>;

    /// Fetch every roster item owned by a user.
    async fn fetch_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError>;

    /// Insert or replace a roster item, returning the owner's new roster version.
    async fn upsert_item(&self, item: &RosterItem) -> Result<u64, StorageError>;

    /// Delete a roster item, returning the owner's new roster version.
    async fn delete_item(&self, username: &str, contact: &BareJid) -> Result<u64, StorageError>;

    /// Fetch the pending request from `requester` to `contact`.
    async fn fetch_notification(
        &self,
        contact: &str,
        requester: &BareJid,
    ) -> Result<Option<Notification>, StorageError>;

    /// Fetch every pending request addressed to `contact`.
    async fn fetch_notifications(&self, contact: &str) -> Result<Vec<Notification>, StorageError>;

    /// Insert or replace a pending request.
    async fn upsert_notification(&self, notification: &Notification) -> Result<(), StorageError>;

    /// Delete a pending request. Deleting a missing one is not an error.
    async fn delete_notification(
        &self,
        contact: &str,
        requester: &BareJid,
    ) -> Result<(), StorageError>;

    /// Fetch a local user record.
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// Insert or replace a local user record.
    async fn upsert_user(&self, user: &User) -> Result<(), StorageError>;
}
