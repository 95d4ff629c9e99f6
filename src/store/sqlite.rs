//! SQLite store adapter.
//!
//! Persists the message log and profile directory in a local database
//! file. The schema is applied on open, so a fresh path works without a
//! separate migration step. Inserted rows are fanned out over a broadcast
//! channel to feed [`Subscription`]s, mirroring the remote adapter's
//! behavior for code that must run against either.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    MessageFilter, MessageOrder, MessagePatch, MessageStore, ProfileDirectory, StoreError,
    Subscription, SUBSCRIPTION_BUFFER,
};
use crate::types::{Message, PrivacySettings, Profile};

const SCHEMA: &str = include_str!("../../migrations/001_messaging.sql");

const MESSAGE_COLUMNS: &str = "id, sender_id, recipient_id, content, created_at, read, is_request";

/// `(id, sender_id, recipient_id, content, created_at, read, is_request)`
type MessageRow = (i64, String, String, String, String, bool, bool);

/// `(id, full_name, avatar_url, is_verified, privacy_settings)`
type ProfileRow = (String, String, Option<String>, bool, Option<String>);

fn message_from_row(row: MessageRow) -> Result<Message, StoreError> {
    let (id, sender_id, recipient_id, content, created_at, read, is_request) = row;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|_| StoreError::InvalidRow {
            field: "created_at",
            value: created_at.clone(),
        })?
        .with_timezone(&Utc);
    Ok(Message {
        id: Some(id),
        sender_id,
        recipient_id,
        content,
        created_at,
        read,
        is_request,
    })
}

fn profile_from_row(row: ProfileRow) -> Result<Profile, StoreError> {
    let (id, full_name, avatar_url, is_verified, privacy) = row;
    let privacy_settings = match privacy {
        Some(raw) => {
            serde_json::from_str::<PrivacySettings>(&raw).map_err(|_| StoreError::InvalidRow {
                field: "privacy_settings",
                value: raw,
            })?
        }
        None => PrivacySettings::default(),
    };
    Ok(Profile {
        id,
        full_name,
        avatar_url,
        is_verified,
        privacy_settings,
    })
}

/// Fixed-width timestamp text so lexicographic order matches instant order.
fn timestamp_text(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Message log and profile directory in a local SQLite database.
pub struct SqliteStore {
    db: SqlitePool,
    events: broadcast::Sender<Message>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (creating if missing) a database file and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns a database error if the file cannot be opened or the
    /// schema fails to apply.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        info!(path = %path.display(), "message database opened");
        Self::from_pool(pool).await
    }

    /// Open a throwaway in-memory database, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns a database error if the schema fails to apply.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        // A second connection would see a different empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        let (events, _) = broadcast::channel(SUBSCRIPTION_BUFFER);
        Ok(Self { db: pool, events })
    }

    /// The underlying pool, for callers that share the database file.
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Add or replace a profile row.
    ///
    /// Profiles are owned by the wider platform; this exists for seeding
    /// local databases and tests.
    ///
    /// # Errors
    ///
    /// Returns a database error if the write fails.
    pub async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let privacy = serde_json::to_string(&profile.privacy_settings)
            .map_err(|e| StoreError::Unavailable(format!("privacy settings encode: {e}")))?;
        sqlx::query(
            "INSERT OR REPLACE INTO profiles (id, full_name, avatar_url, is_verified, privacy_settings) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&profile.id)
        .bind(&profile.full_name)
        .bind(&profile.avatar_url)
        .bind(profile.is_verified)
        .bind(&privacy)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn fetch_by_id(&self, id: i64) -> Result<Message, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, sender_id, recipient_id, content, created_at, read, is_request \
             FROM user_messages WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        match row {
            Some(row) => message_from_row(row),
            None => Err(StoreError::MessageNotFound(id)),
        }
    }
}

/// Append the filter's populated fields as `WHERE`/`AND` clauses.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &MessageFilter) {
    let mut first = true;
    let mut sep = |qb: &mut QueryBuilder<'_, Sqlite>| {
        if first {
            qb.push(" WHERE ");
            first = false;
        } else {
            qb.push(" AND ");
        }
    };
    if let Some(user) = &filter.involving {
        sep(qb);
        qb.push("(sender_id = ")
            .push_bind(user.clone())
            .push(" OR recipient_id = ")
            .push_bind(user.clone())
            .push(")");
    }
    if let Some((a, b)) = &filter.pair {
        sep(qb);
        qb.push("((sender_id = ")
            .push_bind(a.clone())
            .push(" AND recipient_id = ")
            .push_bind(b.clone())
            .push(") OR (sender_id = ")
            .push_bind(b.clone())
            .push(" AND recipient_id = ")
            .push_bind(a.clone())
            .push("))");
    }
    if let Some(sender) = &filter.sender {
        sep(qb);
        qb.push("sender_id = ").push_bind(sender.clone());
    }
    if let Some(recipient) = &filter.recipient {
        sep(qb);
        qb.push("recipient_id = ").push_bind(recipient.clone());
    }
    if let Some(is_request) = filter.is_request {
        sep(qb);
        qb.push("is_request = ").push_bind(is_request);
    }
    if let Some(read) = filter.read {
        sep(qb);
        qb.push("read = ").push_bind(read);
    }
    if let Some(id) = filter.id {
        sep(qb);
        qb.push("id = ").push_bind(id);
    }
    if let Some(floor) = filter.id_above {
        sep(qb);
        qb.push("id > ").push_bind(floor);
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn query(
        &self,
        filter: &MessageFilter,
        order: MessageOrder,
    ) -> Result<Vec<Message>, StoreError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {MESSAGE_COLUMNS} FROM user_messages"));
        push_filter(&mut qb, filter);
        qb.push(match order {
            MessageOrder::CreatedAsc => " ORDER BY created_at ASC, id ASC",
            MessageOrder::CreatedDesc => " ORDER BY created_at DESC, id DESC",
        });
        let rows: Vec<MessageRow> = qb.build_query_as().fetch_all(&self.db).await?;
        let mut messages = rows
            .into_iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // Stored text ordering is advisory; the shared comparator decides.
        order.sort(&mut messages);
        Ok(messages)
    }

    async fn insert(&self, draft: Message) -> Result<Message, StoreError> {
        let created_at = timestamp_text(&draft.created_at);
        let result = sqlx::query(
            "INSERT INTO user_messages (sender_id, recipient_id, content, created_at, read, is_request) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&draft.sender_id)
        .bind(&draft.recipient_id)
        .bind(&draft.content)
        .bind(&created_at)
        .bind(draft.read)
        .bind(draft.is_request)
        .execute(&self.db)
        .await?;

        let mut stored = draft;
        stored.id = Some(result.last_insert_rowid());
        // Echo the microsecond precision that was written, so this row
        // compares equal to a later read of itself.
        stored.created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(stored.created_at);
        debug!(
            id = result.last_insert_rowid(),
            recipient = %stored.recipient_id,
            "message inserted"
        );
        // No receivers is fine; events are best-effort.
        let _ = self.events.send(stored.clone());
        Ok(stored)
    }

    async fn update(&self, id: i64, patch: &MessagePatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            // Nothing to write, but unknown ids must still fail.
            return self.fetch_by_id(id).await.map(|_| ());
        }
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE user_messages SET ");
        let mut first = true;
        if let Some(read) = patch.read {
            qb.push("read = ").push_bind(read);
            first = false;
        }
        if let Some(is_request) = patch.is_request {
            if !first {
                qb.push(", ");
            }
            qb.push("is_request = ").push_bind(is_request);
        }
        qb.push(" WHERE id = ").push_bind(id);
        let result = qb.build().execute(&self.db).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM user_messages WHERE id = ?1")
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
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
impl ProfileDirectory for SqliteStore {
    async fn get(&self, user_id: &str) -> Result<Profile, StoreError> {
        let row: Option<ProfileRow> = sqlx::query_as(
            "SELECT id, full_name, avatar_url, is_verified, privacy_settings \
             FROM profiles WHERE id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        match row {
            Some(row) => profile_from_row(row),
            None => Err(StoreError::ProfileNotFound(user_id.to_string())),
        }
    }

    async fn search(&self, name_fragment: &str, limit: usize) -> Result<Vec<Profile>, StoreError> {
        let pattern = format!("%{name_fragment}%");
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<ProfileRow> = sqlx::query_as(
            "SELECT id, full_name, avatar_url, is_verified, privacy_settings \
             FROM profiles WHERE full_name LIKE ?1 ORDER BY full_name ASC LIMIT ?2",
        )
        .bind(&pattern)
        .bind(limit_i64)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(profile_from_row).collect()
    }
}
