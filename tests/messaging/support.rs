//! Shared fixtures for the messaging integration tests: deterministic
//! message builders, seeded in-memory worlds, and instrumented store
//! wrappers for counting, failing, and stalling store calls.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Notify;

use cubiz_messaging::store::memory::InMemoryStore;
use cubiz_messaging::store::{
    MessageFilter, MessageOrder, MessagePatch, MessageStore, StoreError, Subscription,
};
use cubiz_messaging::types::{Message, MessagePolicy, Profile};

/// Fixed base instant so ordering assertions are deterministic.
pub fn at(offset_secs: i64) -> DateTime<Utc> {
    let base = Utc
        .with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
        .single()
        .expect("valid base instant");
    base + Duration::seconds(offset_secs)
}

/// Unconfirmed normal message with a deterministic timestamp.
pub fn draft_at(sender: &str, recipient: &str, content: &str, offset_secs: i64) -> Message {
    Message {
        id: None,
        sender_id: sender.to_owned(),
        recipient_id: recipient.to_owned(),
        content: content.to_owned(),
        created_at: at(offset_secs),
        read: false,
        is_request: false,
    }
}

/// Same as [`draft_at`] but already read by the recipient.
pub fn read_at(sender: &str, recipient: &str, content: &str, offset_secs: i64) -> Message {
    Message {
        read: true,
        ..draft_at(sender, recipient, content, offset_secs)
    }
}

/// Same as [`draft_at`] but quarantined as a message request.
pub fn request_at(sender: &str, recipient: &str, content: &str, offset_secs: i64) -> Message {
    Message {
        is_request: true,
        ..draft_at(sender, recipient, content, offset_secs)
    }
}

pub fn profile(id: &str, name: &str) -> Profile {
    Profile::new(id, name)
}

pub fn verified(id: &str, name: &str) -> Profile {
    let mut profile = Profile::new(id, name);
    profile.is_verified = true;
    profile
}

pub fn with_policy(id: &str, name: &str, policy: MessagePolicy) -> Profile {
    let mut profile = Profile::new(id, name);
    profile.privacy_settings.messages = policy;
    profile
}

/// In-memory world seeded with profiles and messages.
///
/// Message ids follow seed order, starting at 1.
pub async fn seeded(profiles: Vec<Profile>, messages: Vec<Message>) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for profile in profiles {
        store.insert_profile(profile).await;
    }
    for message in messages {
        store
            .insert(message)
            .await
            .expect("seed insert should succeed");
    }
    store
}

/// Delegating store that counts mutating calls.
pub struct CountingStore {
    inner: Arc<InMemoryStore>,
    inserts: AtomicUsize,
    updates: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            inserts: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for CountingStore {
    async fn query(
        &self,
        filter: &MessageFilter,
        order: MessageOrder,
    ) -> Result<Vec<Message>, StoreError> {
        self.inner.query(filter, order).await
    }

    async fn insert(&self, draft: Message) -> Result<Message, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(draft).await
    }

    async fn update(&self, id: i64, patch: &MessagePatch) -> Result<(), StoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn subscribe(&self, filter: MessageFilter) -> Result<Subscription, StoreError> {
        self.inner.subscribe(filter).await
    }
}

/// Store whose writes always fail, for exercising failure tickets.
pub struct FailingStore;

#[async_trait]
impl MessageStore for FailingStore {
    async fn query(
        &self,
        _filter: &MessageFilter,
        _order: MessageOrder,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(Vec::new())
    }

    async fn insert(&self, _draft: Message) -> Result<Message, StoreError> {
        Err(StoreError::Unavailable("backend offline".to_owned()))
    }

    async fn update(&self, _id: i64, _patch: &MessagePatch) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("backend offline".to_owned()))
    }

    async fn delete(&self, _id: i64) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("backend offline".to_owned()))
    }

    async fn subscribe(&self, _filter: MessageFilter) -> Result<Subscription, StoreError> {
        Ok(Subscription::channel().1)
    }
}

/// Store that parks the first pair query touching `gated_user` until
/// released, for racing a slow thread load against a newer one.
pub struct GatedStore {
    inner: Arc<InMemoryStore>,
    gated_user: String,
    armed: AtomicBool,
    /// Signalled once the gated query has arrived and parked.
    pub entered: Notify,
    /// Waited on by the parked query; notify to let it proceed.
    pub release: Notify,
}

impl GatedStore {
    pub fn new(inner: Arc<InMemoryStore>, gated_user: &str) -> Self {
        Self {
            inner,
            gated_user: gated_user.to_owned(),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl MessageStore for GatedStore {
    async fn query(
        &self,
        filter: &MessageFilter,
        order: MessageOrder,
    ) -> Result<Vec<Message>, StoreError> {
        let gated = self.armed.load(Ordering::SeqCst)
            && filter
                .pair
                .as_ref()
                .is_some_and(|(a, b)| a == &self.gated_user || b == &self.gated_user);
        if gated {
            self.armed.store(false, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.query(filter, order).await
    }

    async fn insert(&self, draft: Message) -> Result<Message, StoreError> {
        self.inner.insert(draft).await
    }

    async fn update(&self, id: i64, patch: &MessagePatch) -> Result<(), StoreError> {
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn subscribe(&self, filter: MessageFilter) -> Result<Subscription, StoreError> {
        self.inner.subscribe(filter).await
    }
}
