//! Request gate: classifies an outgoing message before it is written.
//!
//! The gate only applies to first contact. Once any normal (non-request)
//! message exists between two users, later policy changes do not cut the
//! thread; they act on new first contacts only.

use crate::types::{MessagePolicy, Profile};

/// What the store write should look like, if it happens at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    /// Write a normal message.
    Normal,
    /// Write the message quarantined as a pending request.
    AsRequest,
    /// Refuse the send; nothing is written.
    Blocked,
}

/// Classify a send from `sender` to `recipient`.
///
/// `existing_conversation` is whether any non-request message already
/// exists between the pair, in either direction. When it does, the
/// recipient's policy is not consulted at all.
pub fn classify_send(
    recipient: &Profile,
    sender: &Profile,
    existing_conversation: bool,
) -> SendDecision {
    if existing_conversation {
        return SendDecision::Normal;
    }
    match recipient.privacy_settings.messages {
        MessagePolicy::All => SendDecision::Normal,
        MessagePolicy::VerifiedOnly => {
            if sender.is_verified {
                SendDecision::Normal
            } else {
                SendDecision::AsRequest
            }
        }
        MessagePolicy::None => SendDecision::Blocked,
    }
}
