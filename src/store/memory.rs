//! In-memory store adapter for tests and ephemeral sessions.
//!
//! Holds the full message log in a `Vec` behind a [`tokio::sync::Mutex`]
//! and fans inserted rows out over a broadcast channel so subscriptions
//! behave exactly like the durable adapters.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::{
    MessageFilter, MessageOrder, MessagePatch, MessageStore, ProfileDirectory, StoreError,
    Subscription, SUBSCRIPTION_BUFFER,
};
use crate::types::{Message, Profile};

#[derive(Debug, Default)]
struct Inner {
    messages: Vec<Message>,
    profiles: HashMap<String, Profile>,
    next_id: i64,
}

/// Message log and profile directory held entirely in process memory.
#[derive(Debug)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<Message>,
}

impl InMemoryStore {
    /// Empty store with no messages and no profiles.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(SUBSCRIPTION_BUFFER);
        Self {
            inner: Mutex::new(Inner {
                messages: Vec::new(),
                profiles: HashMap::new(),
                next_id: 1,
            }),
            events,
        }
    }

    /// Add or replace a profile row.
    pub async fn insert_profile(&self, profile: Profile) {
        let mut inner = self.inner.lock().await;
        inner.profiles.insert(profile.id.clone(), profile);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn query(
        &self,
        filter: &MessageFilter,
        order: MessageOrder,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        order.sort(&mut rows);
        Ok(rows)
    }

    async fn insert(&self, draft: Message) -> Result<Message, StoreError> {
        let stored = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_id;
            inner.next_id = id.saturating_add(1);
            let mut stored = draft;
            stored.id = Some(id);
            inner.messages.push(stored.clone());
            stored
        };
        // No receivers is fine; events are best-effort.
        let _ = self.events.send(stored.clone());
        Ok(stored)
    }

    async fn update(&self, id: i64, patch: &MessagePatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .messages
            .iter_mut()
            .find(|m| m.id == Some(id))
            .ok_or(StoreError::MessageNotFound(id))?;
        patch.apply(row);
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let position = inner
            .messages
            .iter()
            .position(|m| m.id == Some(id))
            .ok_or(StoreError::MessageNotFound(id))?;
        inner.messages.remove(position);
        Ok(())
    }

    async fn subscribe(&self, filter: MessageFilter) -> Result<Subscription, StoreError> {
        let mut events = self.events.subscribe();
        let (tx, subscription) = Subscription::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.recv() => match event {
                        Ok(message) => {
                            if !filter.matches(&message) {
                                continue;
                            }
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "subscription lagged, missed inserts dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(subscription)
    }
}

#[async_trait]
impl ProfileDirectory for InMemoryStore {
    async fn get(&self, user_id: &str) -> Result<Profile, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| StoreError::ProfileNotFound(user_id.to_string()))
    }

    async fn search(&self, name_fragment: &str, limit: usize) -> Result<Vec<Profile>, StoreError> {
        let needle = name_fragment.to_lowercase();
        let inner = self.inner.lock().await;
        let mut hits: Vec<Profile> = inner
            .profiles
            .values()
            .filter(|p| p.full_name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        hits.truncate(limit);
        Ok(hits)
    }
}
