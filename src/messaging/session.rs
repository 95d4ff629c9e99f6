//! Conversation session: one open thread, its send tickets, and the
//! mark-read bookkeeping for the user at the keyboard.
//!
//! A session is bound to one user and holds at most one open conversation.
//! Opening another partner replaces the thread; a load that resolves after
//! a newer one has started is discarded, so a slow fetch can never clobber
//! the thread the user actually switched to.
//!
//! Sends run an explicit state machine ([`SendState`]): a ticket is
//! `Pending` while the store write is in flight and the thread only ever
//! gains the store-confirmed row. There is no optimistic echo to reconcile
//! later.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::gate::{classify_send, SendDecision};
use super::MessagingError;
use crate::store::{
    MessageFilter, MessageOrder, MessagePatch, MessageStore, ProfileDirectory, StoreError,
};
use crate::types::{thread_order, Message, Profile};

/// Outcome of [`ConversationSession::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The loaded thread is now the open conversation.
    Opened,
    /// A newer `open` started while this one was loading; its result was
    /// discarded and the newer load owns the session.
    Superseded,
}

/// Lifecycle of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
    /// Store write in flight.
    Pending,
    /// The store confirmed the row.
    Confirmed {
        /// Id the store assigned.
        message_id: i64,
    },
    /// The store write failed; the message is not in the log.
    Failed {
        /// Store error, rendered for display.
        reason: String,
    },
}

/// One send attempt, tagged before the store write starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTicket {
    /// Correlation tag, assigned locally.
    pub tag: Uuid,
    /// Current lifecycle state.
    pub state: SendState,
    /// When the send was submitted.
    pub submitted_at: DateTime<Utc>,
}

struct OpenThread {
    partner: Profile,
    messages: Vec<Message>,
    sends: Vec<SendTicket>,
}

/// Insert keeping `(created_at, id)` order; duplicate ids are dropped.
fn insert_sorted(thread: &mut Vec<Message>, message: Message) -> bool {
    if message.id.is_some() && thread.iter().any(|m| m.id == message.id) {
        return false;
    }
    let at = thread.partition_point(|m| thread_order(m, &message) != std::cmp::Ordering::Greater);
    thread.insert(at, message);
    true
}

/// One user's view onto one conversation at a time.
///
/// All methods take `&self`; the open thread lives behind a
/// [`tokio::sync::Mutex`] that is never held across a store await.
pub struct ConversationSession {
    current_user: String,
    store: Arc<dyn MessageStore>,
    profiles: Arc<dyn ProfileDirectory>,
    state: Mutex<Option<OpenThread>>,
    load_seq: AtomicU64,
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("current_user", &self.current_user)
            .finish_non_exhaustive()
    }
}

impl ConversationSession {
    /// New session for `current_user` with no conversation open.
    pub fn new(
        current_user: impl Into<String>,
        store: Arc<dyn MessageStore>,
        profiles: Arc<dyn ProfileDirectory>,
    ) -> Self {
        Self {
            current_user: current_user.into(),
            store,
            profiles,
            state: Mutex::new(None),
            load_seq: AtomicU64::new(0),
        }
    }

    /// The user this session belongs to.
    pub fn current_user(&self) -> &str {
        &self.current_user
    }

    /// Open the conversation with `partner_id`, replacing any open thread.
    ///
    /// Loads the full pair history ascending by `(created_at, id)`,
    /// quarantined requests included; the thread view shows everything the
    /// two users ever exchanged. If a newer `open` starts while this one is
    /// loading, the stale result is dropped and `Superseded` is returned.
    ///
    /// # Errors
    ///
    /// [`MessagingError::ProfileNotFound`] when `partner_id` has no
    /// profile; [`MessagingError::Store`] when the thread load fails.
    pub async fn open(&self, partner_id: &str) -> Result<OpenOutcome, MessagingError> {
        // fetch_add returns the previous value; this load owns prev + 1.
        let token = self
            .load_seq
            .fetch_add(1, AtomicOrdering::SeqCst)
            .wrapping_add(1);

        let partner = match self.profiles.get(partner_id).await {
            Ok(profile) => profile,
            Err(StoreError::ProfileNotFound(id)) => {
                return Err(MessagingError::ProfileNotFound(id))
            }
            Err(err) => return Err(err.into()),
        };
        let messages = self
            .store
            .query(
                &MessageFilter::pair(self.current_user.as_str(), partner_id),
                MessageOrder::CreatedAsc,
            )
            .await?;

        let mut state = self.state.lock().await;
        if self.load_seq.load(AtomicOrdering::SeqCst) != token {
            debug!(partner = %partner_id, "discarding superseded thread load");
            return Ok(OpenOutcome::Superseded);
        }
        debug!(partner = %partner_id, messages = messages.len(), "conversation opened");
        *state = Some(OpenThread {
            partner,
            messages,
            sends: Vec::new(),
        });
        Ok(OpenOutcome::Opened)
    }

    /// Close the open conversation, if any.
    pub async fn close(&self) {
        *self.state.lock().await = None;
    }

    /// Send `text` to the open conversation's partner.
    ///
    /// Consults the gate with a fresh sender profile; on anything but
    /// [`SendDecision::Blocked`] a `Pending` ticket is recorded, the draft
    /// is inserted, and the ticket flips to `Confirmed` (the confirmed row
    /// joins the thread) or `Failed`. A blocked send writes nothing and
    /// records no ticket.
    ///
    /// # Errors
    ///
    /// [`MessagingError::EmptyContent`] for blank text (checked before any
    /// store call), [`MessagingError::NoOpenConversation`] when nothing is
    /// open, [`MessagingError::Blocked`] when the recipient's policy
    /// refuses first contact, [`MessagingError::Store`] when the insert
    /// fails (the ticket is left `Failed`).
    pub async fn send(&self, text: &str) -> Result<Message, MessagingError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(MessagingError::EmptyContent);
        }

        let (partner, existing_conversation) = {
            let state = self.state.lock().await;
            let open = state.as_ref().ok_or(MessagingError::NoOpenConversation)?;
            (
                open.partner.clone(),
                open.messages.iter().any(|m| !m.is_request),
            )
        };

        let sender = match self.profiles.get(&self.current_user).await {
            Ok(profile) => profile,
            Err(StoreError::ProfileNotFound(id)) => {
                return Err(MessagingError::ProfileNotFound(id))
            }
            Err(err) => return Err(err.into()),
        };

        let decision = classify_send(&partner, &sender, existing_conversation);
        if decision == SendDecision::Blocked {
            info!(recipient = %partner.id, "send blocked by recipient policy");
            return Err(MessagingError::Blocked(partner.id));
        }

        let tag = Uuid::new_v4();
        {
            let mut state = self.state.lock().await;
            if let Some(open) = state.as_mut() {
                if open.partner.id == partner.id {
                    open.sends.push(SendTicket {
                        tag,
                        state: SendState::Pending,
                        submitted_at: Utc::now(),
                    });
                }
            }
        }

        let draft = Message::draft(
            self.current_user.as_str(),
            partner.id.as_str(),
            content,
            decision == SendDecision::AsRequest,
        );
        match self.store.insert(draft).await {
            Ok(stored) => {
                let mut state = self.state.lock().await;
                if let Some(open) = state.as_mut() {
                    if let Some(ticket) = open.sends.iter_mut().find(|t| t.tag == tag) {
                        ticket.state = SendState::Confirmed {
                            message_id: stored.id.unwrap_or_default(),
                        };
                    }
                    if open.partner.id == stored.recipient_id {
                        insert_sorted(&mut open.messages, stored.clone());
                    }
                }
                Ok(stored)
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                if let Some(open) = state.as_mut() {
                    if let Some(ticket) = open.sends.iter_mut().find(|t| t.tag == tag) {
                        ticket.state = SendState::Failed {
                            reason: err.to_string(),
                        };
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Mark every unread partner message in the open thread as read.
    ///
    /// One store patch per row, local state updated after each confirmed
    /// patch. With nothing unread this makes zero store calls, so calling
    /// it again right away is free. Returns how many rows were flipped.
    ///
    /// # Errors
    ///
    /// [`MessagingError::NoOpenConversation`] when nothing is open;
    /// [`MessagingError::Store`] on the first failing patch (earlier
    /// patches stay applied).
    pub async fn mark_read(&self) -> Result<u32, MessagingError> {
        let (partner_id, unread_ids) = {
            let state = self.state.lock().await;
            let open = state.as_ref().ok_or(MessagingError::NoOpenConversation)?;
            let ids: Vec<i64> = open
                .messages
                .iter()
                .filter(|m| {
                    m.recipient_id == self.current_user
                        && m.sender_id == open.partner.id
                        && !m.read
                })
                .filter_map(|m| m.id)
                .collect();
            (open.partner.id.clone(), ids)
        };
        if unread_ids.is_empty() {
            return Ok(0);
        }

        let patch = MessagePatch::mark_read();
        let mut flipped: u32 = 0;
        for id in unread_ids {
            self.store.update(id, &patch).await?;
            flipped = flipped.saturating_add(1);
            let mut state = self.state.lock().await;
            if let Some(open) = state.as_mut() {
                if open.partner.id == partner_id {
                    if let Some(message) = open.messages.iter_mut().find(|m| m.id == Some(id)) {
                        message.read = true;
                    }
                }
            }
        }
        debug!(partner = %partner_id, count = flipped, "thread marked read");
        Ok(flipped)
    }

    /// Apply a change-notification row to the open thread.
    ///
    /// Returns whether the thread changed. Rows for other pairs and
    /// duplicate ids are ignored, so feeding the same event twice is a
    /// no-op.
    pub async fn apply_event(&self, message: &Message) -> bool {
        let mut state = self.state.lock().await;
        let Some(open) = state.as_mut() else {
            return false;
        };
        if !message.pair_matches(&self.current_user, &open.partner.id) {
            return false;
        }
        insert_sorted(&mut open.messages, message.clone())
    }

    /// Snapshot of the open thread, oldest first. Empty when nothing is
    /// open.
    pub async fn thread(&self) -> Vec<Message> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .map(|open| open.messages.clone())
            .unwrap_or_default()
    }

    /// The open conversation's partner, if one is open.
    pub async fn partner(&self) -> Option<Profile> {
        let state = self.state.lock().await;
        state.as_ref().map(|open| open.partner.clone())
    }

    /// Snapshot of this conversation's send tickets, submission order.
    pub async fn sends(&self) -> Vec<SendTicket> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .map(|open| open.sends.clone())
            .unwrap_or_default()
    }
}
