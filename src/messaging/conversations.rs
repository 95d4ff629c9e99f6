//! Conversation aggregator: derives the conversation list from the flat
//! message log.
//!
//! Conversations are never persisted. Each call re-derives the full list
//! from one store query, so the result reflects whatever the log holds at
//! that moment and no cache can drift out of sync.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::MessagingError;
use crate::store::{MessageFilter, MessageOrder, MessageStore, ProfileDirectory, StoreError};
use crate::types::{thread_order, Message, Profile};

/// Default cap on preview length, in characters.
pub const DEFAULT_PREVIEW_CHARS: usize = 120;

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// The other participant's user id.
    pub partner_id: String,
    /// The other participant's profile.
    pub partner: Profile,
    /// Messages from the partner the current user has not read, excluding
    /// quarantined requests.
    pub unread_count: u32,
    /// Content of the newest message, truncated on a char boundary.
    pub last_message_preview: String,
    /// Timestamp of the newest message.
    pub last_message_at: DateTime<Utc>,
}

/// Derives [`Conversation`] lists for one store/directory pair.
#[derive(Clone)]
pub struct ConversationAggregator {
    store: Arc<dyn MessageStore>,
    profiles: Arc<dyn ProfileDirectory>,
    preview_max_chars: usize,
}

impl std::fmt::Debug for ConversationAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationAggregator")
            .field("preview_max_chars", &self.preview_max_chars)
            .finish_non_exhaustive()
    }
}

impl ConversationAggregator {
    /// New aggregator with the default preview cap.
    pub fn new(store: Arc<dyn MessageStore>, profiles: Arc<dyn ProfileDirectory>) -> Self {
        Self {
            store,
            profiles,
            preview_max_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    /// Override the preview cap (characters).
    #[must_use]
    pub fn with_preview_chars(mut self, max_chars: usize) -> Self {
        self.preview_max_chars = max_chars;
        self
    }

    /// Every conversation `current_user` participates in, newest activity
    /// first.
    ///
    /// Pending requests addressed to `current_user` stay invisible until
    /// accepted. The sender of a pending request does see the conversation;
    /// the quarantine protects the recipient, not the author. Partners whose
    /// profile is gone are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Store`] if the message query or a profile
    /// lookup fails for any reason other than a missing profile. Nothing
    /// partial is returned.
    pub async fn list_conversations(
        &self,
        current_user: &str,
    ) -> Result<Vec<Conversation>, MessagingError> {
        let rows = self
            .store
            .query(
                &MessageFilter::involving(current_user),
                MessageOrder::CreatedAsc,
            )
            .await?;

        struct Group {
            last: Message,
            unread: u32,
        }

        let mut groups: BTreeMap<String, Group> = BTreeMap::new();
        for message in rows {
            if message.is_pending_request_for(current_user) {
                continue;
            }
            let Some(partner_id) = message.partner_of(current_user) else {
                continue;
            };
            let partner_id = partner_id.to_string();
            let unread_here = u32::from(
                message.recipient_id == current_user && !message.read && !message.is_request,
            );
            match groups.entry(partner_id) {
                Entry::Occupied(mut entry) => {
                    let group = entry.get_mut();
                    group.unread = group.unread.saturating_add(unread_here);
                    if thread_order(&message, &group.last) == std::cmp::Ordering::Greater {
                        group.last = message;
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Group {
                        last: message,
                        unread: unread_here,
                    });
                }
            }
        }

        struct Build {
            last: Message,
            partner: Profile,
            unread: u32,
        }

        let mut builds = Vec::with_capacity(groups.len());
        for (partner_id, group) in groups {
            let partner = match self.profiles.get(&partner_id).await {
                Ok(profile) => profile,
                Err(StoreError::ProfileNotFound(_)) => {
                    warn!(partner = %partner_id, "skipping conversation, partner profile missing");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            builds.push(Build {
                last: group.last,
                partner,
                unread: group.unread,
            });
        }

        // Newest activity first; the shared comparator breaks timestamp ties.
        builds.sort_by(|a, b| thread_order(&b.last, &a.last));

        Ok(builds
            .into_iter()
            .map(|b| Conversation {
                partner_id: b.partner.id.clone(),
                last_message_preview: preview(&b.last.content, self.preview_max_chars),
                last_message_at: b.last.created_at,
                unread_count: b.unread,
                partner: b.partner,
            })
            .collect())
    }
}

/// Truncate to at most `max_chars` characters, marking the cut.
fn preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let mut cut: String = content.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
