//! Request inbox: pending message requests awaiting the recipient's call.
//!
//! A request stays quarantined until its recipient accepts it (the row's
//! `is_request` flag flips off and the pair surfaces as a conversation) or
//! rejects it (the row is deleted, leaving no trace on either side).

use std::sync::Arc;

use tracing::{info, warn};

use super::MessagingError;
use crate::store::{
    MessageFilter, MessageOrder, MessagePatch, MessageStore, ProfileDirectory, StoreError,
};
use crate::types::{Message, Profile};

/// A quarantined first message, paired with who sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// The quarantined message.
    pub message: Message,
    /// The sender's profile.
    pub sender: Profile,
}

/// Lists and settles pending requests for their recipient.
#[derive(Clone)]
pub struct RequestInbox {
    store: Arc<dyn MessageStore>,
    profiles: Arc<dyn ProfileDirectory>,
}

impl std::fmt::Debug for RequestInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestInbox").finish_non_exhaustive()
    }
}

impl RequestInbox {
    /// New inbox over the given store and directory.
    pub fn new(store: Arc<dyn MessageStore>, profiles: Arc<dyn ProfileDirectory>) -> Self {
        Self { store, profiles }
    }

    /// Pending requests addressed to `current_user`, newest first.
    ///
    /// Requests whose sender profile is gone are skipped with a warning;
    /// there is nobody left to accept.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Store`] if the query or a profile lookup
    /// fails for any reason other than a missing profile.
    pub async fn list(&self, current_user: &str) -> Result<Vec<PendingRequest>, MessagingError> {
        let rows = self
            .store
            .query(
                &MessageFilter::requests_for(current_user),
                MessageOrder::CreatedDesc,
            )
            .await?;
        let mut requests = Vec::with_capacity(rows.len());
        for message in rows {
            let sender = match self.profiles.get(&message.sender_id).await {
                Ok(profile) => profile,
                Err(StoreError::ProfileNotFound(_)) => {
                    warn!(sender = %message.sender_id, "skipping request, sender profile missing");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            requests.push(PendingRequest { message, sender });
        }
        Ok(requests)
    }

    /// Accept the request with `message_id` and return the released row.
    ///
    /// Flips `{ read: true, is_request: false }` on exactly that message.
    /// Other quarantined messages from the same sender stay quarantined.
    ///
    /// # Errors
    ///
    /// [`MessagingError::RequestNotFound`] unless the row exists, is
    /// addressed to `current_user`, and is still a pending request.
    pub async fn accept(
        &self,
        current_user: &str,
        message_id: i64,
    ) -> Result<Message, MessagingError> {
        let mut message = self.load_pending(current_user, message_id).await?;
        let patch = MessagePatch::accept_request();
        match self.store.update(message_id, &patch).await {
            Ok(()) => {}
            // The row vanished between the check and the patch.
            Err(StoreError::MessageNotFound(id)) => {
                return Err(MessagingError::RequestNotFound(id))
            }
            Err(err) => return Err(err.into()),
        }
        patch.apply(&mut message);
        info!(id = message_id, sender = %message.sender_id, "message request accepted");
        Ok(message)
    }

    /// Reject the request with `message_id`, deleting exactly that row.
    ///
    /// # Errors
    ///
    /// [`MessagingError::RequestNotFound`] unless the row exists, is
    /// addressed to `current_user`, and is still a pending request.
    pub async fn reject(&self, current_user: &str, message_id: i64) -> Result<(), MessagingError> {
        self.load_pending(current_user, message_id).await?;
        match self.store.delete(message_id).await {
            Ok(()) => {}
            Err(StoreError::MessageNotFound(id)) => {
                return Err(MessagingError::RequestNotFound(id))
            }
            Err(err) => return Err(err.into()),
        }
        info!(id = message_id, "message request rejected");
        Ok(())
    }

    /// Fetch the row and verify it is a pending request for `current_user`.
    async fn load_pending(
        &self,
        current_user: &str,
        message_id: i64,
    ) -> Result<Message, MessagingError> {
        let rows = self
            .store
            .query(&MessageFilter::by_id(message_id), MessageOrder::CreatedAsc)
            .await?;
        match rows.into_iter().next() {
            Some(message) if message.is_pending_request_for(current_user) => Ok(message),
            _ => Err(MessagingError::RequestNotFound(message_id)),
        }
    }
}
