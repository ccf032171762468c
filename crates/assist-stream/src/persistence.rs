//! Message store boundary.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::errors::{ConfigError, PersistError};
use crate::policy::RetryPolicy;
use crate::state::Role;

/// A message as held by the store. The core never mutates one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub id: String,
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// External message store.
///
/// A write that times out may still have been committed, so a retried
/// `persist` can reach the store twice. Every attempt for one logical message
/// carries the same `idempotency_key`; implementations should return the
/// original id when they see a key again.
#[async_trait::async_trait]
pub trait MessagePersistenceGateway: Send + Sync {
    /// Stores one message and returns its id.
    async fn persist(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
        idempotency_key: &str,
    ) -> Result<String, PersistError>;

    /// Authoritative history for a thread, oldest first.
    async fn fetch_canonical(&self, thread_id: &str) -> Result<Vec<PersistedMessage>, PersistError>;
}

/// Process-local store, keyed by thread.
pub struct InMemoryMessageStore {
    threads: Mutex<HashMap<String, Vec<PersistedMessage>>>,
    /// Idempotency key to the id it produced.
    keys: Mutex<HashMap<String, String>>,
    dedupe_window: chrono::Duration,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            dedupe_window: chrono::Duration::seconds(5),
        }
    }

    /// Identical `(role, content)` writes within `window` of each other
    /// collapse into one message. A zero window disables deduplication.
    pub fn with_dedupe_window(mut self, window: std::time::Duration) -> Self {
        self.dedupe_window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        self
    }

    /// Seeds a thread, e.g. with the user message that started the run.
    pub fn insert(&self, message: PersistedMessage) {
        self.lock()
            .entry(message.thread_id.clone())
            .or_default()
            .push(message);
    }

    pub fn messages(&self, thread_id: &str) -> Vec<PersistedMessage> {
        self.lock().get(thread_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<PersistedMessage>>> {
        self.threads.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl MessagePersistenceGateway for InMemoryMessageStore {
    async fn persist(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
        idempotency_key: &str,
    ) -> Result<String, PersistError> {
        let mut keys = self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(id) = keys.get(idempotency_key) {
            debug!(
                event = "persist.replayed",
                domain = "persist",
                thread_id,
                message_id = %id
            );
            return Ok(id.clone());
        }
        let now = Utc::now();
        let mut threads = self.lock();
        let messages = threads.entry(thread_id.to_string()).or_default();
        if !self.dedupe_window.is_zero()
            && let Some(existing) = messages.iter().rev().find(|m| {
                m.role == role && m.content == content && now - m.created_at <= self.dedupe_window
            })
        {
            debug!(
                event = "persist.deduplicated",
                domain = "persist",
                thread_id,
                message_id = %existing.id
            );
            keys.insert(idempotency_key.to_string(), existing.id.clone());
            return Ok(existing.id.clone());
        }
        let id = format!("msg_{}", Uuid::new_v4().simple());
        keys.insert(idempotency_key.to_string(), id.clone());
        messages.push(PersistedMessage {
            id: id.clone(),
            thread_id: thread_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
        });
        Ok(id)
    }

    async fn fetch_canonical(&self, thread_id: &str) -> Result<Vec<PersistedMessage>, PersistError> {
        Ok(self.messages(thread_id))
    }
}

/// REST-backed store: `POST` and `GET {base}/threads/{thread_id}/messages`.
pub struct HttpMessageStore {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpMessageStore {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        if config.base_url.trim().is_empty() {
            return Err(ConfigError::Missing("message store base url".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn messages_url(&self, thread_id: &str) -> String {
        format!(
            "{}/threads/{thread_id}/messages",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.api_key.as_deref() {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn read_success(response: reqwest::Response) -> Result<String, PersistError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PersistError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(PersistError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl MessagePersistenceGateway for HttpMessageStore {
    async fn persist(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
        idempotency_key: &str,
    ) -> Result<String, PersistError> {
        let req = self
            .client
            .post(self.messages_url(thread_id))
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "role": role,
                "content": content,
                "clientMessageId": idempotency_key,
            }));
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| PersistError::Request(e.to_string()))?;
        parse_persist_response(&Self::read_success(response).await?)
    }

    async fn fetch_canonical(&self, thread_id: &str) -> Result<Vec<PersistedMessage>, PersistError> {
        let req = self.client.get(self.messages_url(thread_id));
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| PersistError::Request(e.to_string()))?;
        parse_history(&Self::read_success(response).await?)
    }
}

/// Accepts `{"id": ...}` or `{"message": {"id": ...}}`.
fn parse_persist_response(body: &str) -> Result<String, PersistError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| PersistError::InvalidResponse(e.to_string()))?;
    value
        .get("id")
        .or_else(|| value.get("message").and_then(|m| m.get("id")))
        .and_then(|id| id.as_str())
        .map(str::to_string)
        .ok_or_else(|| PersistError::InvalidResponse("response has no message id".into()))
}

/// Accepts a bare array or `{"messages": [...]}`.
fn parse_history(body: &str) -> Result<Vec<PersistedMessage>, PersistError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| PersistError::InvalidResponse(e.to_string()))?;
    let list = match value {
        serde_json::Value::Object(mut map) => map
            .remove("messages")
            .ok_or_else(|| PersistError::InvalidResponse("response has no messages".into()))?,
        other => other,
    };
    serde_json::from_value(list).map_err(|e| PersistError::InvalidResponse(e.to_string()))
}

/// Persists with retries for transient failures. One idempotency key is
/// minted per call and reused by every attempt.
pub async fn persist_with_retry(
    gateway: &dyn MessagePersistenceGateway,
    policy: &RetryPolicy,
    thread_id: &str,
    role: Role,
    content: &str,
) -> Result<String, PersistError> {
    let idempotency_key = Uuid::new_v4().to_string();
    let mut retries_done = 0;
    loop {
        match gateway.persist(thread_id, role, content, &idempotency_key).await {
            Ok(id) => return Ok(id),
            Err(err) if err.is_retryable() && policy.can_retry(retries_done) => {
                let delay = policy.backoff_duration(retries_done);
                warn!(
                    event = "persist.retry",
                    domain = "persist",
                    thread_id,
                    retry = retries_done + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err
                );
                tokio::time::sleep(delay).await;
                retries_done += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyGateway {
        failures_left: AtomicU32,
        calls: AtomicU32,
        error: PersistError,
    }

    /// Commits to the inner store, then reports a timeout once.
    struct CommitThenTimeout {
        inner: InMemoryMessageStore,
        timed_out: AtomicU32,
        keys: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl MessagePersistenceGateway for CommitThenTimeout {
        async fn persist(
            &self,
            thread_id: &str,
            role: Role,
            content: &str,
            idempotency_key: &str,
        ) -> Result<String, PersistError> {
            self.keys.lock().expect("keys").push(idempotency_key.to_string());
            let id = self.inner.persist(thread_id, role, content, idempotency_key).await?;
            if self.timed_out.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(PersistError::Request("operation timed out".into()));
            }
            Ok(id)
        }

        async fn fetch_canonical(&self, thread_id: &str) -> Result<Vec<PersistedMessage>, PersistError> {
            self.inner.fetch_canonical(thread_id).await
        }
    }

    impl FlakyGateway {
        fn failing(times: u32, error: PersistError) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                calls: AtomicU32::new(0),
                error,
            }
        }
    }

    #[async_trait::async_trait]
    impl MessagePersistenceGateway for FlakyGateway {
        async fn persist(&self, _: &str, _: Role, _: &str, _: &str) -> Result<String, PersistError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok("msg_ok".into())
        }

        async fn fetch_canonical(&self, _: &str) -> Result<Vec<PersistedMessage>, PersistError> {
            Ok(Vec::new())
        }
    }

    fn fast_retries(max_retries: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_retries, 1, 1.0)
    }

    #[tokio::test]
    async fn in_memory_store_collapses_duplicate_writes() {
        let store = InMemoryMessageStore::new();
        let first = store.persist("t1", Role::Assistant, "Hello", "k1").await.expect("persist");
        let again = store.persist("t1", Role::Assistant, "Hello", "k2").await.expect("persist");
        let other = store.persist("t1", Role::Assistant, "Bye", "k3").await.expect("persist");
        assert_eq!(first, again);
        assert_ne!(first, other);

        let history = store.fetch_canonical("t1").await.expect("history");
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hello", "Bye"]);
        assert!(store.fetch_canonical("t2").await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn zero_window_keeps_every_write() {
        let store = InMemoryMessageStore::new().with_dedupe_window(std::time::Duration::ZERO);
        store.persist("t1", Role::User, "hi", "k1").await.expect("persist");
        store.persist("t1", Role::User, "hi", "k2").await.expect("persist");
        assert_eq!(store.messages("t1").len(), 2);
    }

    #[tokio::test]
    async fn repeated_key_returns_original_message() {
        let store = InMemoryMessageStore::new().with_dedupe_window(std::time::Duration::ZERO);
        let first = store.persist("t1", Role::Assistant, "hi", "k1").await.expect("persist");
        let again = store.persist("t1", Role::Assistant, "hi", "k1").await.expect("persist");
        assert_eq!(first, again);
        assert_eq!(store.messages("t1").len(), 1);
    }

    #[tokio::test]
    async fn retry_after_committed_timeout_reuses_key() {
        let gateway = CommitThenTimeout {
            inner: InMemoryMessageStore::new().with_dedupe_window(std::time::Duration::ZERO),
            timed_out: AtomicU32::new(0),
            keys: Mutex::new(Vec::new()),
        };
        persist_with_retry(&gateway, &fast_retries(3), "t1", Role::Assistant, "answer")
            .await
            .expect("persisted");

        let keys = gateway.keys.lock().expect("keys").clone();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], keys[1]);
        assert_eq!(gateway.inner.messages("t1").len(), 1);
    }

    #[tokio::test]
    async fn separate_persists_use_distinct_keys() {
        let gateway = CommitThenTimeout {
            inner: InMemoryMessageStore::new().with_dedupe_window(std::time::Duration::ZERO),
            timed_out: AtomicU32::new(1),
            keys: Mutex::new(Vec::new()),
        };
        for _ in 0..2 {
            persist_with_retry(&gateway, &fast_retries(0), "t1", Role::Assistant, "same")
                .await
                .expect("persisted");
        }
        let keys = gateway.keys.lock().expect("keys").clone();
        assert_ne!(keys[0], keys[1]);
        assert_eq!(gateway.inner.messages("t1").len(), 2);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let gateway = FlakyGateway::failing(2, PersistError::Request("reset".into()));
        let id = persist_with_retry(&gateway, &fast_retries(3), "t1", Role::Assistant, "x")
            .await
            .expect("persisted");
        assert_eq!(id, "msg_ok");
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_policy_is_exhausted() {
        let gateway = FlakyGateway::failing(10, PersistError::Request("down".into()));
        let err = persist_with_retry(&gateway, &fast_retries(2), "t1", Role::Assistant, "x")
            .await
            .expect_err("exhausted");
        assert_eq!(err, PersistError::Request("down".into()));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let gateway = FlakyGateway::failing(
            1,
            PersistError::Status {
                status: 422,
                body: "empty content".into(),
            },
        );
        assert!(
            persist_with_retry(&gateway, &fast_retries(3), "t1", Role::Assistant, "x")
                .await
                .is_err()
        );
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persist_response_shapes() {
        assert_eq!(parse_persist_response(r#"{"id":"m1"}"#), Ok("m1".to_string()));
        assert_eq!(
            parse_persist_response(r#"{"message":{"id":"m2","content":"x"}}"#),
            Ok("m2".to_string())
        );
        assert!(matches!(
            parse_persist_response("{}"),
            Err(PersistError::InvalidResponse(_))
        ));
    }

    #[test]
    fn history_accepts_array_or_envelope() {
        let message = r#"{"id":"m1","threadId":"t1","role":"assistant","content":"Hi","createdAt":"2024-05-01T10:00:00Z"}"#;
        let bare = parse_history(&format!("[{message}]")).expect("bare");
        let wrapped = parse_history(&format!(r#"{{"messages":[{message}]}}"#)).expect("wrapped");
        assert_eq!(bare, wrapped);
        assert_eq!(bare[0].role, Role::Assistant);
        assert_eq!(bare[0].thread_id, "t1");
    }
}
