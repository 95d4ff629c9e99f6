//! Messaging subsystem: conversation aggregation, the request gate, the
//! request inbox, and conversation sessions.
//!
//! # Read/Write Split
//!
//! Reads (conversation list, request inbox, thread loads) re-derive their
//! views from the store on every call; nothing caches across calls except
//! the open thread inside a [`session::ConversationSession`]. Writes go
//! through the gate first, and only store-confirmed rows ever enter a
//! thread, so every view stays correct under concurrent writers.

pub mod conversations;
pub mod gate;
pub mod requests;
pub mod session;

use crate::store::StoreError;

/// Errors from the messaging subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Message text was empty or whitespace-only.
    #[error("message content is empty")]
    EmptyContent,

    /// The referenced user has no profile.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// The recipient's privacy settings refuse first contact.
    #[error("recipient {0} does not accept direct messages")]
    Blocked(String),

    /// No pending request with that id addressed to the caller.
    #[error("pending request not found: {0}")]
    RequestNotFound(i64),

    /// A session operation needs an open conversation and none is open.
    #[error("no open conversation")]
    NoOpenConversation,

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
