//! Shared domain types for the messaging core.
//!
//! [`Message`] mirrors the `user_messages` row of the platform backend and
//! [`Profile`] the public slice of the `profiles` row. Both serialize with
//! the exact snake_case field names of the existing data, so adapters can
//! move rows in and out without a mapping layer.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A single direct message between two users.
///
/// Immutable once written except for two flags: `read` flips `false -> true`
/// when the recipient opens the thread, and `is_request` flips
/// `true -> false` when the recipient accepts a message request (a rejected
/// request is deleted instead).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned insertion id (`None` for drafts not yet confirmed).
    ///
    /// Ids increase with insertion order and break ordering ties between
    /// messages that share a `created_at` timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Sender user id.
    pub sender_id: String,
    /// Recipient user id.
    pub recipient_id: String,
    /// Message body.
    pub content: String,
    /// Creation timestamp (set by the sender at submit time).
    pub created_at: DateTime<Utc>,
    /// Whether the recipient has read the message.
    pub read: bool,
    /// Whether the message is quarantined as a pending request.
    pub is_request: bool,
}

impl Message {
    /// Build an unconfirmed draft ready for [`MessageStore::insert`].
    ///
    /// [`MessageStore::insert`]: crate::store::MessageStore::insert
    pub fn draft(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        content: impl Into<String>,
        is_request: bool,
    ) -> Self {
        Self {
            id: None,
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            content: content.into(),
            created_at: Utc::now(),
            read: false,
            is_request,
        }
    }

    /// Whether `user_id` is the sender or the recipient.
    pub fn involves(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.recipient_id == user_id
    }

    /// The other participant from `user_id`'s point of view.
    ///
    /// Returns `None` when `user_id` is not a participant. A self-message
    /// (sender == recipient) yields the user itself.
    pub fn partner_of(&self, user_id: &str) -> Option<&str> {
        if self.sender_id == user_id {
            Some(&self.recipient_id)
        } else if self.recipient_id == user_id {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// Whether the message belongs to the unordered pair `{a, b}`.
    pub fn pair_matches(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.recipient_id == b)
            || (self.sender_id == b && self.recipient_id == a)
    }

    /// Whether this is a pending request addressed to `user_id`.
    pub fn is_pending_request_for(&self, user_id: &str) -> bool {
        self.is_request && self.recipient_id == user_id
    }
}

/// Thread ordering: `created_at` ascending, insertion id as tie-break.
///
/// Both the open-thread view and the last-message pick in the conversation
/// list use this comparator, so the two can never disagree on which message
/// is newest.
pub fn thread_order(a: &Message, b: &Message) -> Ordering {
    a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// Public profile slice the messaging core reads (never writes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// User id (auth-service identifier).
    pub id: String,
    /// Display name.
    pub full_name: String,
    /// Avatar reference, if one is set.
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Whether the platform has verified this account.
    #[serde(default)]
    pub is_verified: bool,
    /// The user's privacy choices; all default to open when unset.
    #[serde(default)]
    pub privacy_settings: PrivacySettings,
}

impl Profile {
    /// Minimal profile with everything defaulted except id and name.
    pub fn new(id: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            full_name: full_name.into(),
            avatar_url: None,
            is_verified: false,
            privacy_settings: PrivacySettings::default(),
        }
    }
}

/// Privacy block stored as JSON on the profile row.
///
/// Only `messages` matters to this crate; `profile` and `posts` are carried
/// so the blob round-trips unchanged for the rest of the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacySettings {
    /// Who may view the profile page.
    pub profile: Visibility,
    /// Who may view the user's posts.
    pub posts: Visibility,
    /// Who may open a direct-message conversation.
    pub messages: MessagePolicy,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            profile: Visibility::Public,
            posts: Visibility::Public,
            messages: MessagePolicy::All,
        }
    }
}

/// Two-state visibility used for profile and posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible to everyone.
    Public,
    /// Visible to the owner only.
    Private,
}

/// Who may send the profile owner a direct message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessagePolicy {
    /// Anyone may message; first contact lands as a normal message.
    #[serde(rename = "all")]
    All,
    /// Unverified first contact is quarantined as a message request.
    ///
    /// The legacy value `following` was written by an early settings form
    /// and still appears in stored blobs; it carried the same meaning.
    #[serde(rename = "verified", alias = "following")]
    VerifiedOnly,
    /// First contact is refused outright.
    #[serde(rename = "none")]
    None,
}

impl MessagePolicy {
    /// The stored string form, for logs and error detail.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::VerifiedOnly => "verified",
            Self::None => "none",
        }
    }
}
