//! Remote store adapter for the hosted REST backend.
//!
//! The platform exposes its tables through a PostgREST-style gateway:
//! filters ride in query parameters (`recipient_id=eq.alice`,
//! `or=(...)`), writes answer with the affected rows when asked via
//! `Prefer: return=representation`. The gateway has no push channel here,
//! so [`RemoteStore::subscribe`] polls for rows above a high-water id.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    MessageFilter, MessageOrder, MessagePatch, MessageStore, ProfileDirectory, StoreError,
    Subscription,
};
use crate::config::RemoteConfig;
use crate::types::{Message, Profile};

const MESSAGES_TABLE: &str = "user_messages";
const PROFILES_TABLE: &str = "profiles";

/// Default pause between subscription polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum backoff between failed subscription polls (milliseconds).
const MAX_BACKOFF_MS: u64 = 60_000;

/// Longest error body kept in a [`StoreError::HttpStatus`].
const MAX_ERROR_BODY_CHARS: usize = 256;

// ---------------------------------------------------------------------------
// Query-parameter encoding (pub for integration testing)
// ---------------------------------------------------------------------------

/// Quote a value for use inside an `or=(...)` tree.
///
/// The gateway splits those trees on commas and parentheses, so any value
/// containing grammar characters must ride in double quotes.
fn literal(value: &str) -> String {
    if value.contains([',', '.', ':', '(', ')', '"', ' ']) {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        value.to_string()
    }
}

/// Translate a [`MessageFilter`] into gateway query parameters.
#[doc(hidden)]
pub fn filter_to_params(filter: &MessageFilter) -> Vec<(String, String)> {
    let mut params = Vec::new();
    if let Some(user) = &filter.involving {
        let user = literal(user);
        params.push((
            "or".to_string(),
            format!("(sender_id.eq.{user},recipient_id.eq.{user})"),
        ));
    }
    if let Some((a, b)) = &filter.pair {
        let a = literal(a);
        let b = literal(b);
        params.push((
            "or".to_string(),
            format!(
                "(and(sender_id.eq.{a},recipient_id.eq.{b}),and(sender_id.eq.{b},recipient_id.eq.{a}))"
            ),
        ));
    }
    if let Some(sender) = &filter.sender {
        params.push(("sender_id".to_string(), format!("eq.{sender}")));
    }
    if let Some(recipient) = &filter.recipient {
        params.push(("recipient_id".to_string(), format!("eq.{recipient}")));
    }
    if let Some(is_request) = filter.is_request {
        params.push(("is_request".to_string(), format!("eq.{is_request}")));
    }
    if let Some(read) = filter.read {
        params.push(("read".to_string(), format!("eq.{read}")));
    }
    if let Some(id) = filter.id {
        params.push(("id".to_string(), format!("eq.{id}")));
    }
    if let Some(floor) = filter.id_above {
        params.push(("id".to_string(), format!("gt.{floor}")));
    }
    params
}

fn order_param(order: MessageOrder) -> &'static str {
    match order {
        MessageOrder::CreatedAsc => "created_at.asc,id.asc",
        MessageOrder::CreatedDesc => "created_at.desc,id.desc",
    }
}

/// Read the body, failing on non-success statuses with a truncated excerpt.
async fn check_response(response: reqwest::Response) -> Result<String, StoreError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        let mut body: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
        if body.chars().count() > MAX_ERROR_BODY_CHARS {
            body = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            body.push_str("...");
        }
        return Err(StoreError::HttpStatus {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

fn parse_rows<T: for<'de> Deserialize<'de>>(body: &str) -> Result<Vec<T>, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Unavailable(format!("bad response: {e}")))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Message log and profile directory behind the hosted REST gateway.
#[derive(Clone)]
pub struct RemoteStore {
    client: reqwest::Client,
    base: Url,
    poll_interval: Duration,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl RemoteStore {
    /// Connect to a gateway at `base_url`, authenticating with `api_key`.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidUrl`] if `base_url` does not parse, or an
    /// HTTP error if the client cannot be built.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, StoreError> {
        Self::build(base_url, api_key, DEFAULT_TIMEOUT)
    }

    fn build(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, StoreError> {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let base =
            Url::parse(&base_url).map_err(|_| StoreError::InvalidUrl(base_url.clone()))?;

        let mut headers = HeaderMap::new();
        let key_value = HeaderValue::from_str(api_key)
            .map_err(|_| StoreError::Unavailable("api key is not header-safe".to_string()))?;
        headers.insert("apikey", key_value);
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| StoreError::Unavailable("api key is not header-safe".to_string()))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        info!(base = %base, "remote message store configured");
        Ok(Self {
            client,
            base,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Build from config, reading the API key from the named env var.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] when the env var is unset, plus
    /// everything [`RemoteStore::new`] can return.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, StoreError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            StoreError::Unavailable(format!("env var {} is not set", config.api_key_env))
        })?;
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let mut store = Self::build(&config.base_url, &api_key, timeout)?;
        store.poll_interval = Duration::from_secs(config.poll_interval_secs);
        Ok(store)
    }

    /// Override the subscription poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn table_url(&self, table: &str) -> Result<Url, StoreError> {
        self.base
            .join(table)
            .map_err(|_| StoreError::InvalidUrl(format!("{}{table}", self.base)))
    }

    /// Highest message id currently matching `filter`, or 0.
    async fn high_water_id(&self, filter: &MessageFilter) -> Result<i64, StoreError> {
        #[derive(Deserialize)]
        struct IdRow {
            id: i64,
        }
        let url = self.table_url(MESSAGES_TABLE)?;
        let mut params = filter_to_params(filter);
        params.push(("select".to_string(), "id".to_string()));
        params.push(("order".to_string(), "id.desc".to_string()));
        params.push(("limit".to_string(), "1".to_string()));
        let response = self.client.get(url).query(&params).send().await?;
        let body = check_response(response).await?;
        let rows: Vec<IdRow> = parse_rows(&body)?;
        Ok(rows.first().map_or(0, |row| row.id))
    }

    async fn fetch_above(
        &self,
        filter: &MessageFilter,
        floor: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let mut poll_filter = filter.clone();
        poll_filter.id_above = Some(floor);
        self.query(&poll_filter, MessageOrder::CreatedAsc).await
    }
}

#[async_trait]
impl MessageStore for RemoteStore {
    async fn query(
        &self,
        filter: &MessageFilter,
        order: MessageOrder,
    ) -> Result<Vec<Message>, StoreError> {
        let url = self.table_url(MESSAGES_TABLE)?;
        let mut params = filter_to_params(filter);
        params.push(("select".to_string(), "*".to_string()));
        params.push(("order".to_string(), order_param(order).to_string()));
        let response = self.client.get(url).query(&params).send().await?;
        let body = check_response(response).await?;
        let mut messages: Vec<Message> = parse_rows(&body)?;
        // Gateway ordering is advisory; the shared comparator decides.
        order.sort(&mut messages);
        Ok(messages)
    }

    async fn insert(&self, draft: Message) -> Result<Message, StoreError> {
        let url = self.table_url(MESSAGES_TABLE)?;
        let response = self
            .client
            .post(url)
            .header("Prefer", "return=representation")
            .json(&draft)
            .send()
            .await?;
        let body = check_response(response).await?;
        let mut rows: Vec<Message> = parse_rows(&body)?;
        match rows.pop() {
            Some(stored) => {
                debug!(id = ?stored.id, recipient = %stored.recipient_id, "message inserted");
                Ok(stored)
            }
            None => Err(StoreError::Unavailable(
                "insert returned no representation".to_string(),
            )),
        }
    }

    async fn update(&self, id: i64, patch: &MessagePatch) -> Result<(), StoreError> {
        let url = self.table_url(MESSAGES_TABLE)?;
        let mut body = serde_json::Map::new();
        if let Some(read) = patch.read {
            body.insert("read".to_string(), serde_json::Value::Bool(read));
        }
        if let Some(is_request) = patch.is_request {
            body.insert("is_request".to_string(), serde_json::Value::Bool(is_request));
        }
        let response = self
            .client
            .patch(url)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        let text = check_response(response).await?;
        let rows: Vec<Message> = parse_rows(&text)?;
        if rows.is_empty() {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let url = self.table_url(MESSAGES_TABLE)?;
        let response = self
            .client
            .delete(url)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let text = check_response(response).await?;
        let rows: Vec<Message> = parse_rows(&text)?;
        if rows.is_empty() {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn subscribe(&self, filter: MessageFilter) -> Result<Subscription, StoreError> {
        let mut floor = self.high_water_id(&filter).await?;
        let store = self.clone();
        let (tx, subscription) = Subscription::channel();
        let base_delay = self.poll_interval;
        tokio::spawn(async move {
            let mut delay = base_delay;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                match store.fetch_above(&filter, floor).await {
                    Ok(rows) => {
                        delay = base_delay;
                        for message in rows {
                            if let Some(id) = message.id {
                                floor = floor.max(id);
                            }
                            if tx.send(message).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                        warn!(error = %err, delay_ms, "subscription poll failed, backing off");
                        delay =
                            Duration::from_millis(delay_ms.saturating_mul(2).min(MAX_BACKOFF_MS));
                    }
                }
            }
        });
        Ok(subscription)
    }
}

#[async_trait]
impl ProfileDirectory for RemoteStore {
    async fn get(&self, user_id: &str) -> Result<Profile, StoreError> {
        let url = self.table_url(PROFILES_TABLE)?;
        let response = self
            .client
            .get(url)
            .query(&[("select", "*"), ("id", &format!("eq.{user_id}"))])
            .send()
            .await?;
        let body = check_response(response).await?;
        let mut rows: Vec<Profile> = parse_rows(&body)?;
        rows.pop()
            .ok_or_else(|| StoreError::ProfileNotFound(user_id.to_string()))
    }

    async fn search(&self, name_fragment: &str, limit: usize) -> Result<Vec<Profile>, StoreError> {
        let url = self.table_url(PROFILES_TABLE)?;
        let response = self
            .client
            .get(url)
            .query(&[
                ("select", "*"),
                ("full_name", &format!("ilike.*{name_fragment}*")),
                ("order", "full_name.asc"),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await?;
        let body = check_response(response).await?;
        parse_rows(&body)
    }
}
