//! Storage abstraction over the message log and the profile directory.
//!
//! The messaging core talks to persistence through two narrow traits:
//! [`MessageStore`] for the append-mostly message log and
//! [`ProfileDirectory`] for read-only profile lookups. Three adapters
//! implement them: [`memory::InMemoryStore`] for tests and ephemeral use,
//! [`sqlite::SqliteStore`] for a local database file, and
//! [`remote::RemoteStore`] for the hosted REST backend.

pub mod memory;
pub mod remote;
pub mod sqlite;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::{thread_order, Message, Profile};

/// Buffered events per subscription before the producer drops new ones.
pub const SUBSCRIPTION_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by store adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store cannot be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error from the SQLite adapter.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transport error from the remote adapter.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status from the remote backend.
    #[error("http status {status}: {body}")]
    HttpStatus {
        /// Status code returned.
        status: u16,
        /// Response body, truncated for log hygiene.
        body: String,
    },

    /// The configured remote base URL does not parse.
    #[error("invalid store url: {0}")]
    InvalidUrl(String),

    /// A stored row holds a value the domain types cannot represent.
    #[error("invalid row: field {field} holds {value:?}")]
    InvalidRow {
        /// Column that failed to convert.
        field: &'static str,
        /// The offending stored value.
        value: String,
    },

    /// No message row with the given id.
    #[error("message {0} not found")]
    MessageNotFound(i64),

    /// No profile row for the given user id.
    #[error("profile {0} not found")]
    ProfileNotFound(String),

    /// The subscription feed has been closed by the adapter.
    #[error("subscription closed")]
    SubscriptionClosed,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Conjunctive row filter for [`MessageStore::query`].
///
/// Every populated field must hold for a row to match. Adapters translate
/// the filter into their native form (SQL `WHERE`, REST query params); the
/// in-memory adapter evaluates [`MessageFilter::matches`] directly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Sender or recipient equals this user.
    pub involving: Option<String>,
    /// Both participants match, in either direction.
    pub pair: Option<(String, String)>,
    /// Sender equals this user.
    pub sender: Option<String>,
    /// Recipient equals this user.
    pub recipient: Option<String>,
    /// Request flag equals this value.
    pub is_request: Option<bool>,
    /// Read flag equals this value.
    pub read: Option<bool>,
    /// Row id equals this value.
    pub id: Option<i64>,
    /// Row id is strictly greater than this value.
    pub id_above: Option<i64>,
}

impl MessageFilter {
    /// Every message where `user_id` is sender or recipient.
    pub fn involving(user_id: impl Into<String>) -> Self {
        Self {
            involving: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Every message between `a` and `b`, in either direction.
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            pair: Some((a.into(), b.into())),
            ..Self::default()
        }
    }

    /// Pending requests addressed to `user_id`.
    pub fn requests_for(user_id: impl Into<String>) -> Self {
        Self {
            recipient: Some(user_id.into()),
            is_request: Some(true),
            ..Self::default()
        }
    }

    /// The single row with this id.
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Whether `message` satisfies every populated field.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(user) = &self.involving {
            if !message.involves(user) {
                return false;
            }
        }
        if let Some((a, b)) = &self.pair {
            if !message.pair_matches(a, b) {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if &message.sender_id != sender {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if &message.recipient_id != recipient {
                return false;
            }
        }
        if let Some(is_request) = self.is_request {
            if message.is_request != is_request {
                return false;
            }
        }
        if let Some(read) = self.read {
            if message.read != read {
                return false;
            }
        }
        if let Some(id) = self.id {
            if message.id != Some(id) {
                return false;
            }
        }
        if let Some(floor) = self.id_above {
            match message.id {
                Some(id) if id > floor => {}
                _ => return false,
            }
        }
        true
    }
}

/// Result ordering for [`MessageStore::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrder {
    /// Oldest first: `created_at` ascending, id as tie-break.
    CreatedAsc,
    /// Newest first: the exact reverse of [`MessageOrder::CreatedAsc`].
    CreatedDesc,
}

impl MessageOrder {
    /// Sort `messages` in place according to this ordering.
    pub fn sort(&self, messages: &mut [Message]) {
        match self {
            Self::CreatedAsc => messages.sort_by(thread_order),
            Self::CreatedDesc => messages.sort_by(|a, b| thread_order(b, a)),
        }
    }
}

/// Partial update applied to one message row.
///
/// Only the two mutable flags can be patched; everything else on a message
/// is immutable once written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessagePatch {
    /// New value for the read flag, if changing.
    pub read: Option<bool>,
    /// New value for the request flag, if changing.
    pub is_request: Option<bool>,
}

impl MessagePatch {
    /// Flip the read flag on.
    pub fn mark_read() -> Self {
        Self {
            read: Some(true),
            is_request: None,
        }
    }

    /// Accept a message request: mark it read and lift the quarantine.
    pub fn accept_request() -> Self {
        Self {
            read: Some(true),
            is_request: Some(false),
        }
    }

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.is_request.is_none()
    }

    /// Apply the patch to an owned message.
    pub fn apply(&self, message: &mut Message) {
        if let Some(read) = self.read {
            message.read = read;
        }
        if let Some(is_request) = self.is_request {
            message.is_request = is_request;
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Live feed of newly inserted messages for one recipient.
///
/// Dropping the subscription cancels the adapter-side producer task.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    /// Wrap a receiver handed out by an adapter.
    pub fn new(rx: mpsc::Receiver<Message>) -> Self {
        Self { rx }
    }

    /// Paired sender and subscription with the standard buffer size.
    pub fn channel() -> (mpsc::Sender<Message>, Self) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (tx, Self::new(rx))
    }

    /// Next inserted message, or `None` once the feed closes.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking poll used when draining after a wakeup.
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Convert into a [`tokio_stream`] stream for combinator use.
    pub fn into_stream(self) -> ReceiverStream<Message> {
        ReceiverStream::new(self.rx)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// The append-mostly direct-message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fetch all messages matching `filter`, ordered by `order`.
    ///
    /// # Errors
    /// Returns a transport or database error when the backend fails; an
    /// empty match is `Ok(vec![])`, never an error.
    async fn query(
        &self,
        filter: &MessageFilter,
        order: MessageOrder,
    ) -> Result<Vec<Message>, StoreError>;

    /// Append `draft` and return the stored row with its assigned id.
    ///
    /// The draft's `id` field is ignored; the store assigns the next
    /// insertion id and echoes the complete row back.
    ///
    /// # Errors
    /// Returns a transport or database error when the append fails; the
    /// caller must treat the send as failed, not retry blindly.
    async fn insert(&self, draft: Message) -> Result<Message, StoreError>;

    /// Patch the row with `id`.
    ///
    /// # Errors
    /// [`StoreError::MessageNotFound`] when no row has `id`.
    async fn update(&self, id: i64, patch: &MessagePatch) -> Result<(), StoreError>;

    /// Delete the row with `id`.
    ///
    /// # Errors
    /// [`StoreError::MessageNotFound`] when no row has `id`.
    async fn delete(&self, id: i64) -> Result<(), StoreError>;

    /// Live feed of future inserts matching `filter`.
    ///
    /// Only rows inserted after the call are delivered; the feed carries
    /// inserts only, never updates or deletes. Delivery is at-least-once;
    /// consumers de-duplicate by id.
    ///
    /// # Errors
    /// Returns a transport error when the feed cannot be established.
    async fn subscribe(&self, filter: MessageFilter) -> Result<Subscription, StoreError>;
}

/// Read-only lookups against the platform profile table.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// Fetch one profile by user id.
    ///
    /// # Errors
    /// [`StoreError::ProfileNotFound`] when no profile has `user_id`.
    async fn get(&self, user_id: &str) -> Result<Profile, StoreError>;

    /// Case-insensitive substring search over display names.
    ///
    /// Returns at most `limit` profiles, name order.
    ///
    /// # Errors
    /// Returns a transport or database error when the backend fails.
    async fn search(&self, name_fragment: &str, limit: usize) -> Result<Vec<Profile>, StoreError>;
}
