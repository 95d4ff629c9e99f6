//! Tests for the SQLite store adapter.

use chrono::{DateTime, Duration, TimeZone, Utc};
use cubiz_messaging::store::sqlite::SqliteStore;
use cubiz_messaging::store::{
    MessageFilter, MessageOrder, MessagePatch, MessageStore, ProfileDirectory, StoreError,
};
use cubiz_messaging::types::{Message, MessagePolicy, Profile};

async fn open_store() -> SqliteStore {
    SqliteStore::open_in_memory()
        .await
        .expect("in-memory store should open")
}

fn at(offset_secs: i64) -> DateTime<Utc> {
    let base = Utc
        .with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
        .single()
        .expect("valid base instant");
    base + Duration::seconds(offset_secs)
}

fn draft(sender: &str, recipient: &str, content: &str, offset_secs: i64) -> Message {
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

#[tokio::test]
async fn insert_then_query_round_trips() {
    let store = open_store().await;

    let mut submitted = draft("alice", "bob", "hello from sqlite", 0);
    submitted.created_at = Utc::now();
    let stored = store
        .insert(submitted)
        .await
        .expect("insert should succeed");
    assert_eq!(stored.id, Some(1));

    let rows = store
        .query(&MessageFilter::by_id(1), MessageOrder::CreatedAsc)
        .await
        .expect("query should succeed");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0], stored);
}

#[tokio::test]
async fn reopen_keeps_rows_and_schema_is_idempotent() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("messages.db");

    {
        let store = SqliteStore::open(&path).await.expect("store should open");
        store
            .insert(draft("alice", "bob", "durable", 0))
            .await
            .expect("insert should succeed");
    }

    let reopened = SqliteStore::open(&path).await.expect("reopen should apply schema");
    let rows = reopened
        .query(&MessageFilter::involving("bob"), MessageOrder::CreatedAsc)
        .await
        .expect("query should succeed");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "durable");
}

#[tokio::test]
async fn ordering_breaks_timestamp_ties_by_id() {
    let store = open_store().await;
    store
        .insert(draft("alice", "bob", "first", 0))
        .await
        .expect("insert should succeed");
    store
        .insert(draft("bob", "alice", "second, same instant", 0))
        .await
        .expect("insert should succeed");

    let ascending = store
        .query(&MessageFilter::pair("alice", "bob"), MessageOrder::CreatedAsc)
        .await
        .expect("query should succeed");
    let ids: Vec<_> = ascending.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![Some(1), Some(2)]);

    let descending = store
        .query(&MessageFilter::pair("alice", "bob"), MessageOrder::CreatedDesc)
        .await
        .expect("query should succeed");
    let ids: Vec<_> = descending.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![Some(2), Some(1)]);
}

#[tokio::test]
async fn filters_narrow_rows_in_sql() {
    let store = open_store().await;
    let mut request = draft("stranger", "bob", "let me in", 0);
    request.is_request = true;
    store.insert(request).await.expect("insert should succeed");
    store
        .insert(draft("alice", "bob", "normal", 1))
        .await
        .expect("insert should succeed");
    store
        .insert(draft("bob", "alice", "reply", 2))
        .await
        .expect("insert should succeed");

    let pending = store
        .query(&MessageFilter::requests_for("bob"), MessageOrder::CreatedDesc)
        .await
        .expect("query should succeed");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].sender_id, "stranger");

    let from_bob = store
        .query(
            &MessageFilter {
                sender: Some("bob".to_owned()),
                ..MessageFilter::default()
            },
            MessageOrder::CreatedAsc,
        )
        .await
        .expect("query should succeed");
    assert_eq!(from_bob.len(), 1);
    assert_eq!(from_bob[0].content, "reply");

    let above = store
        .query(
            &MessageFilter {
                id_above: Some(1),
                ..MessageFilter::default()
            },
            MessageOrder::CreatedAsc,
        )
        .await
        .expect("query should succeed");
    let ids: Vec<_> = above.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![Some(2), Some(3)]);
}

#[tokio::test]
async fn update_patches_flags_and_rejects_unknown_ids() {
    let store = open_store().await;
    let mut request = draft("stranger", "bob", "hello", 0);
    request.is_request = true;
    let stored = store.insert(request).await.expect("insert should succeed");
    let id = stored.id.expect("stored row should have an id");

    store
        .update(id, &MessagePatch::accept_request())
        .await
        .expect("update should succeed");
    let rows = store
        .query(&MessageFilter::by_id(id), MessageOrder::CreatedAsc)
        .await
        .expect("query should succeed");
    assert!(rows[0].read);
    assert!(!rows[0].is_request);

    let err = store
        .update(404, &MessagePatch::mark_read())
        .await
        .expect_err("unknown id should fail");
    assert!(matches!(err, StoreError::MessageNotFound(404)));
}

#[tokio::test]
async fn empty_patch_still_validates_the_id() {
    let store = open_store().await;
    let stored = store
        .insert(draft("alice", "bob", "hi", 0))
        .await
        .expect("insert should succeed");
    let id = stored.id.expect("stored row should have an id");

    store
        .update(id, &MessagePatch::default())
        .await
        .expect("empty patch on a known id should succeed");

    let err = store
        .update(404, &MessagePatch::default())
        .await
        .expect_err("empty patch on an unknown id should fail");
    assert!(matches!(err, StoreError::MessageNotFound(404)));
}

#[tokio::test]
async fn delete_removes_the_row() {
    let store = open_store().await;
    let stored = store
        .insert(draft("alice", "bob", "fleeting", 0))
        .await
        .expect("insert should succeed");
    let id = stored.id.expect("stored row should have an id");

    store.delete(id).await.expect("delete should succeed");
    let rows = store
        .query(&MessageFilter::by_id(id), MessageOrder::CreatedAsc)
        .await
        .expect("query should succeed");
    assert!(rows.is_empty());

    let err = store.delete(id).await.expect_err("second delete should fail");
    assert!(matches!(err, StoreError::MessageNotFound(_)));
}

#[tokio::test]
async fn subscription_delivers_only_matching_future_inserts() {
    let store = open_store().await;
    store
        .insert(draft("alice", "bob", "before subscribe", 0))
        .await
        .expect("insert should succeed");

    let mut subscription = store
        .subscribe(MessageFilter::involving("bob"))
        .await
        .expect("subscribe should succeed");

    store
        .insert(draft("alice", "carol", "filtered out", 1))
        .await
        .expect("insert should succeed");
    store
        .insert(draft("alice", "bob", "delivered", 2))
        .await
        .expect("insert should succeed");

    let event = subscription.next().await.expect("feed should stay open");
    assert_eq!(event.content, "delivered");
    assert_eq!(event.id, Some(3));
}

#[tokio::test]
async fn upsert_profile_replaces_and_search_filters() {
    let store = open_store().await;
    store
        .upsert_profile(&Profile::new("u1", "Alice Anderson"))
        .await
        .expect("upsert should succeed");
    store
        .upsert_profile(&Profile::new("u2", "Alina"))
        .await
        .expect("upsert should succeed");
    store
        .upsert_profile(&Profile::new("u3", "Bob"))
        .await
        .expect("upsert should succeed");

    let mut renamed = Profile::new("u3", "Bobby");
    renamed.is_verified = true;
    store
        .upsert_profile(&renamed)
        .await
        .expect("second upsert should replace");
    let fetched = store.get("u3").await.expect("profile should exist");
    assert_eq!(fetched.full_name, "Bobby");
    assert!(fetched.is_verified);

    let hits = store.search("ali", 10).await.expect("search should succeed");
    let names: Vec<_> = hits.iter().map(|p| p.full_name.as_str()).collect();
    assert_eq!(names, vec!["Alice Anderson", "Alina"]);

    let limited = store.search("ali", 1).await.expect("search should succeed");
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn privacy_settings_survive_the_json_column() {
    let store = open_store().await;
    let mut guarded = Profile::new("dana", "Dana");
    guarded.privacy_settings.messages = MessagePolicy::None;
    store
        .upsert_profile(&guarded)
        .await
        .expect("upsert should succeed");

    let fetched = store.get("dana").await.expect("profile should exist");
    assert_eq!(fetched.privacy_settings.messages, MessagePolicy::None);
}

#[tokio::test]
async fn missing_profile_is_not_found() {
    let store = open_store().await;
    let err = store.get("ghost").await.expect_err("missing profile");
    assert!(matches!(err, StoreError::ProfileNotFound(id) if id == "ghost"));
}
