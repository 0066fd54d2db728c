//! Test utilities for presence integration tests.
//!
//! Provides a wired-up presence context over an in-memory store, a store
//! wrapper that can inject failures or pause a specific write, and simulated
//! client streams.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use xmpp_parsers::iq::IqType;
use xmpp_parsers::presence::{Presence, Type as PresenceType};
use xmpp_presence::router::BoundStream;
use xmpp_presence::{
    LocalRouter, MemoryStore, Notification, PresenceConfig, PresenceContext,
    PresenceDispatcher, RelationshipStore, RosterItem, StorageError, Stanza, Subscription, User,
};

pub const DOMAIN: &str = "example.com";
pub const REMOTE_DOMAIN: &str = "jabber.org";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn jid(s: &str) -> Jid {
    Jid::new(s).unwrap()
}

pub fn bare(s: &str) -> BareJid {
    s.parse().unwrap()
}

pub fn full(s: &str) -> FullJid {
    s.parse().unwrap()
}

pub fn presence(type_: PresenceType, from: &str, to: &str) -> Presence {
    let mut p = Presence::new(type_);
    p.from = Some(jid(from));
    p.to = Some(jid(to));
    p
}

/// A write held back until the test releases it.
struct Gate {
    owner: String,
    subscription: Subscription,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

/// Handles for a gated write.
pub struct GateHandle {
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// Relationship store wrapper with fault injection and write gating.
#[derive(Default)]
pub struct TestStore {
    pub inner: MemoryStore,
    fail: AtomicBool,
    /// Writes allowed before every further write fails (usize::MAX = no limit).
    write_budget: AtomicUsize,
    writes: AtomicUsize,
    gate: Mutex<Option<Gate>>,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            write_budget: AtomicUsize::new(usize::MAX),
            ..Default::default()
        }
    }

    /// Make every call fail as if the backend were down.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// Let `n` more writes succeed, then fail every write after them.
    pub fn fail_writes_after(&self, n: usize) {
        self.write_budget.store(n, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Pause the next upsert of `owner`'s item carrying `subscription`.
    pub fn gate_upsert(&self, owner: &str, subscription: Subscription) -> GateHandle {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock() = Some(Gate {
            owner: owner.to_string(),
            subscription,
            reached: Arc::clone(&reached),
            release: Arc::clone(&release),
        });
        GateHandle { reached, release }
    }

    fn check_read(&self) -> Result<(), StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("injected failure"));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StorageError> {
        self.check_read()?;
        let allowed = self
            .write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| match budget {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok();
        if !allowed {
            return Err(StorageError::unavailable("injected write failure"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_gate(&self, item: &RosterItem) -> Option<Gate> {
        let mut gate = self.gate.lock();
        match gate.as_ref() {
            Some(g) if g.owner == item.username && g.subscription == item.subscription => {
                gate.take()
            }
            _ => None,
        }
    }
}

#[async_trait]
impl RelationshipStore for TestStore {
    async fn fetch_item(
        &self,
        username: &str,
        contact: &BareJid,
    ) -> Result<Option<RosterItem>, StorageError> {
        self.check_read()?;
        self.inner.fetch_item(username, contact).await
    }

    async fn fetch_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError> {
        self.check_read()?;
        self.inner.fetch_items(username).await
    }

    async fn upsert_item(&self, item: &RosterItem) -> Result<u64, StorageError> {
        if let Some(gate) = self.take_gate(item) {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
        self.check_write()?;
        self.inner.upsert_item(item).await
    }

    async fn delete_item(&self, username: &str, contact: &BareJid) -> Result<u64, StorageError> {
        self.check_write()?;
        self.inner.delete_item(username, contact).await
    }

    async fn fetch_notification(
        &self,
        contact: &str,
        requester: &BareJid,
    ) -> Result<Option<Notification>, StorageError> {
        self.check_read()?;
        self.inner.fetch_notification(contact, requester).await
    }

    async fn fetch_notifications(&self, contact: &str) -> Result<Vec<Notification>, StorageError> {
        self.check_read()?;
        self.inner.fetch_notifications(contact).await
    }

    async fn upsert_notification(&self, notification: &Notification) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.upsert_notification(notification).await
    }

    async fn delete_notification(
        &self,
        contact: &str,
        requester: &BareJid,
    ) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.delete_notification(contact, requester).await
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        self.check_read()?;
        self.inner.fetch_user(username).await
    }

    async fn upsert_user(&self, user: &User) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.upsert_user(user).await
    }
}

/// A simulated client connection.
pub struct TestClient {
    pub stream: Arc<BoundStream>,
    rx: mpsc::Receiver<Stanza>,
}

impl TestClient {
    /// Everything queued for this client so far.
    pub fn drain(&mut self) -> Vec<Stanza> {
        let mut stanzas = Vec::new();
        while let Ok(stanza) = self.rx.try_recv() {
            stanzas.push(stanza);
        }
        stanzas
    }

    /// Queued presences, discarding anything else.
    pub fn presences(&mut self) -> Vec<Presence> {
        presences(&self.drain())
    }
}

pub fn presences(stanzas: &[Stanza]) -> Vec<Presence> {
    stanzas
        .iter()
        .filter_map(|s| s.as_presence().cloned())
        .collect()
}

/// `<item/>` elements carried by the roster pushes in `stanzas`.
pub fn pushed_items(stanzas: &[Stanza]) -> Vec<Element> {
    stanzas
        .iter()
        .filter_map(|s| s.as_iq())
        .filter_map(|iq| match &iq.payload {
            IqType::Set(query) => query.children().next().cloned(),
            _ => None,
        })
        .collect()
}

/// A presence context over [`TestStore`] and [`LocalRouter`], with remote
/// stanzas captured on a channel.
pub struct Harness {
    pub ctx: PresenceContext,
    pub dispatcher: Arc<PresenceDispatcher>,
    pub store: Arc<TestStore>,
    pub router: Arc<LocalRouter>,
    pub remote: mpsc::Receiver<Stanza>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PresenceConfig {
            hosts: vec![DOMAIN.to_string()],
            ..Default::default()
        })
    }

    pub fn with_config(config: PresenceConfig) -> Self {
        init_tracing();

        let hosts = Arc::new(config.local_hosts());
        let store = Arc::new(TestStore::new());
        let (remote_tx, remote) = mpsc::channel(64);
        let router = Arc::new(LocalRouter::from_config(&config).with_remote(remote_tx));
        let ctx = PresenceContext::new(config, store.clone(), router.clone(), hosts);
        let dispatcher = Arc::new(ctx.dispatcher());

        Self {
            ctx,
            dispatcher,
            store,
            router,
            remote,
        }
    }

    /// Bind a client stream that has requested its roster.
    pub fn connect(&self, jid: &str) -> TestClient {
        let (stream, rx) = self.router.connect(full(jid));
        stream.set_roster_requested(true);
        TestClient { stream, rx }
    }

    pub async fn process(&self, presence: Presence) {
        self.dispatcher.process_presence(presence).await.unwrap();
    }

    pub async fn seed_item(&self, owner: &str, contact: &str, subscription: Subscription, ask: bool) {
        self.store
            .inner
            .upsert_item(
                &RosterItem::new(owner, bare(contact))
                    .with_subscription(subscription)
                    .with_ask(ask),
            )
            .await
            .unwrap();
    }

    pub async fn item(&self, owner: &str, contact: &str) -> Option<RosterItem> {
        self.store.inner.fetch_item(owner, &bare(contact)).await.unwrap()
    }

    pub async fn seed_user(&self, user: User) {
        self.store.inner.upsert_user(&user).await.unwrap();
    }

    /// Stanzas handed to the federation channel so far.
    pub fn drain_remote(&mut self) -> Vec<Stanza> {
        let mut stanzas = Vec::new();
        while let Ok(stanza) = self.remote.try_recv() {
            stanzas.push(stanza);
        }
        stanzas
    }
}
