//! Upstream run endpoints.
//!
//! [`RunApi`] is the seam between the session and the network. [`HttpRunApi`]
//! talks to the real service; [`ScriptedRunApi`] replays canned byte streams
//! for tests and offline demos.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Mutex;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt as _};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::{ConfigError, TransportError};

const EVENT_STREAM: &str = "text/event-stream";

/// Raw body of an event-stream response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send + 'static>>;

/// One tool result as submitted upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// What the submit endpoint answered with.
pub enum SubmitResponse {
    /// The run resumed on a new event stream.
    Continuation(ByteStream),
    /// Plain acknowledgment; the original stream carries on.
    Ack { accepted: bool },
}

impl fmt::Debug for SubmitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continuation(_) => f.write_str("Continuation(..)"),
            Self::Ack { accepted } => f.debug_struct("Ack").field("accepted", accepted).finish(),
        }
    }
}

#[async_trait::async_trait]
pub trait RunApi: Send + Sync {
    /// `POST /run/stream`.
    async fn open_stream(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<ByteStream, TransportError>;

    /// `POST /run/{run_id}/submit-tool-outputs` with every output of one batch.
    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<SubmitResponse, TransportError>;

    /// `POST /run/{run_id}/cancel`. Returns whether upstream acknowledged.
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<bool, TransportError>;
}

/// reqwest-backed [`RunApi`].
pub struct HttpRunApi {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpRunApi {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        if config.base_url.trim().is_empty() {
            return Err(ConfigError::Missing("run api base url".into()));
        }
        // No overall timeout: event streams are long-lived. Short calls get
        // `request_timeout` individually.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Builds a client from `ASSIST_API_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(url);
        match self.config.api_key.as_deref() {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send_bounded(
        &self,
        endpoint: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        // Bounds the wait for response headers only, so a continuation body
        // may stream for as long as the run lasts.
        let response = tokio::time::timeout(self.config.request_timeout, req.send())
            .await
            .map_err(|_| TransportError::request(endpoint, "timed out waiting for response"))?
            .map_err(|e| TransportError::request(endpoint, e.to_string()))?;
        ensure_success(endpoint, response).await
    }
}

#[async_trait::async_trait]
impl RunApi for HttpRunApi {
    async fn open_stream(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<ByteStream, TransportError> {
        let url = self.config.stream_url();
        debug!(
            event = "api.stream_open",
            domain = "stream",
            thread_id,
            assistant_id,
            url = %url
        );
        let req = self
            .post(&url)
            .header(ACCEPT, EVENT_STREAM)
            .json(&stream_request_body(thread_id, assistant_id));
        let response = self.send_bounded("/run/stream", req).await?;
        if !is_event_stream(response.headers()) && has_content_type(response.headers()) {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::invalid_response(
                "/run/stream",
                format!("expected {EVENT_STREAM}, got body: {body}"),
            ));
        }
        Ok(body_stream(response))
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<SubmitResponse, TransportError> {
        let endpoint = format!("/run/{run_id}/submit-tool-outputs");
        debug!(
            event = "api.submit_tool_outputs",
            domain = "tool",
            thread_id,
            run_id,
            outputs = outputs.len()
        );
        let req = self
            .post(&self.config.submit_url(run_id))
            .header(ACCEPT, format!("{EVENT_STREAM}, application/json"))
            .json(&submit_request_body(thread_id, outputs));
        let response = self.send_bounded(&endpoint, req).await?;
        if is_event_stream(response.headers()) {
            return Ok(SubmitResponse::Continuation(body_stream(response)));
        }
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::read(e.to_string()))?;
        let accepted = parse_flag(&body, "accepted")
            .map_err(|message| TransportError::invalid_response(&endpoint, message))?;
        Ok(SubmitResponse::Ack { accepted })
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<bool, TransportError> {
        let endpoint = format!("/run/{run_id}/cancel");
        let req = self
            .post(&self.config.cancel_url(run_id))
            .timeout(self.config.request_timeout)
            .json(&serde_json::json!({ "threadId": thread_id }));
        let response = self.send_bounded(&endpoint, req).await?;
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::read(e.to_string()))?;
        parse_flag(&body, "cancelled").map_err(|message| TransportError::invalid_response(&endpoint, message))
    }
}

async fn ensure_success(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(TransportError::status(endpoint, status.as_u16(), body))
}

fn body_stream(response: reqwest::Response) -> ByteStream {
    Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::read(e.to_string()))),
    )
}

fn has_content_type(headers: &HeaderMap) -> bool {
    headers.contains_key(CONTENT_TYPE)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with(EVENT_STREAM))
}

pub(crate) fn stream_request_body(thread_id: &str, assistant_id: &str) -> serde_json::Value {
    serde_json::json!({
        "threadId": thread_id,
        "assistantId": assistant_id,
    })
}

pub(crate) fn submit_request_body(thread_id: &str, outputs: &[ToolOutput]) -> serde_json::Value {
    serde_json::json!({
        "threadId": thread_id,
        "toolOutputs": outputs,
    })
}

/// Reads a boolean acknowledgment field. An empty body or a missing field
/// counts as `true`, since the status code already signalled success.
pub(crate) fn parse_flag(body: &str, field: &str) -> Result<bool, String> {
    if body.trim().is_empty() {
        return Ok(true);
    }
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| format!("response is not JSON: {e}"))?;
    match value.get(field) {
        None | Some(serde_json::Value::Null) => Ok(true),
        Some(serde_json::Value::Bool(flag)) => Ok(*flag),
        Some(other) => Err(format!("`{field}` must be a boolean, got {other}")),
    }
}

/// Canned event-stream body for [`ScriptedRunApi`].
#[derive(Clone, Debug)]
pub struct ScriptedStream {
    chunks: Vec<Bytes>,
    ending: ScriptedEnding,
}

#[derive(Clone, Debug)]
enum ScriptedEnding {
    Close,
    Hold,
    ReadError(String),
}

impl ScriptedStream {
    /// Whole body delivered in one chunk, then closed.
    pub fn body(body: impl Into<String>) -> Self {
        Self::chunked([body.into()])
    }

    /// Body delivered chunk by chunk, then closed.
    pub fn chunked<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks
                .into_iter()
                .map(|c| Bytes::from(c.into().into_bytes()))
                .collect(),
            ending: ScriptedEnding::Close,
        }
    }

    /// Keep the connection open after the last chunk.
    pub fn hold_open(mut self) -> Self {
        self.ending = ScriptedEnding::Hold;
        self
    }

    /// Fail the read after the last chunk.
    pub fn then_read_error(mut self, message: impl Into<String>) -> Self {
        self.ending = ScriptedEnding::ReadError(message.into());
        self
    }

    pub fn into_byte_stream(self) -> ByteStream {
        let head = stream::iter(self.chunks.into_iter().map(Ok::<Bytes, TransportError>));
        match self.ending {
            ScriptedEnding::Close => Box::pin(head),
            ScriptedEnding::Hold => Box::pin(head.chain(stream::pending())),
            ScriptedEnding::ReadError(message) => Box::pin(
                head.chain(stream::once(async move { Err(TransportError::read(message)) })),
            ),
        }
    }
}

/// Submit reply for [`ScriptedRunApi`].
#[derive(Clone, Debug)]
pub enum ScriptedSubmit {
    Continuation(ScriptedStream),
    Ack { accepted: bool },
}

/// A submission captured by [`ScriptedRunApi`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedSubmission {
    pub thread_id: String,
    pub run_id: String,
    pub outputs: Vec<ToolOutput>,
}

#[derive(Default)]
struct Script {
    streams: VecDeque<Result<ScriptedStream, TransportError>>,
    submits: VecDeque<Result<ScriptedSubmit, TransportError>>,
    opened: Vec<(String, String)>,
    submissions: Vec<RecordedSubmission>,
    cancels: Vec<String>,
}

/// In-process [`RunApi`] that replays queued responses in order and records
/// every call.
#[derive(Default)]
pub struct ScriptedRunApi {
    script: Mutex<Script>,
}

impl ScriptedRunApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues the response for the next `open_stream`.
    pub fn with_stream(self, stream: ScriptedStream) -> Self {
        self.script().streams.push_back(Ok(stream));
        self
    }

    pub fn with_open_error(self, error: TransportError) -> Self {
        self.script().streams.push_back(Err(error));
        self
    }

    /// Queues the response for the next `submit_tool_outputs`.
    pub fn with_submit(self, reply: ScriptedSubmit) -> Self {
        self.script().submits.push_back(Ok(reply));
        self
    }

    pub fn with_submit_error(self, error: TransportError) -> Self {
        self.script().submits.push_back(Err(error));
        self
    }

    /// `(thread_id, assistant_id)` of every opened stream.
    pub fn opened_streams(&self) -> Vec<(String, String)> {
        self.script().opened.clone()
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.script().submissions.clone()
    }

    /// Run ids passed to `cancel_run`.
    pub fn cancel_calls(&self) -> Vec<String> {
        self.script().cancels.clone()
    }
}

#[async_trait::async_trait]
impl RunApi for ScriptedRunApi {
    async fn open_stream(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<ByteStream, TransportError> {
        let mut script = self.script();
        script
            .opened
            .push((thread_id.to_string(), assistant_id.to_string()));
        match script.streams.pop_front() {
            Some(Ok(stream)) => Ok(stream.into_byte_stream()),
            Some(Err(error)) => Err(error),
            None => Err(TransportError::request("/run/stream", "no scripted stream left")),
        }
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<SubmitResponse, TransportError> {
        let mut script = self.script();
        script.submissions.push(RecordedSubmission {
            thread_id: thread_id.to_string(),
            run_id: run_id.to_string(),
            outputs: outputs.to_vec(),
        });
        match script.submits.pop_front() {
            Some(Ok(ScriptedSubmit::Continuation(stream))) => {
                Ok(SubmitResponse::Continuation(stream.into_byte_stream()))
            }
            Some(Ok(ScriptedSubmit::Ack { accepted })) => Ok(SubmitResponse::Ack { accepted }),
            Some(Err(error)) => Err(error),
            None => Ok(SubmitResponse::Ack { accepted: true }),
        }
    }

    async fn cancel_run(&self, _thread_id: &str, run_id: &str) -> Result<bool, TransportError> {
        self.script().cancels.push(run_id.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn request_bodies_use_camel_case() {
        assert_eq!(
            stream_request_body("t1", "a1"),
            serde_json::json!({"threadId": "t1", "assistantId": "a1"})
        );
        let outputs = vec![ToolOutput {
            tool_call_id: "tc1".into(),
            output: "{\"status\":\"ok\"}".into(),
        }];
        assert_eq!(
            submit_request_body("t1", &outputs),
            serde_json::json!({
                "threadId": "t1",
                "toolOutputs": [{"toolCallId": "tc1", "output": "{\"status\":\"ok\"}"}]
            })
        );
    }

    #[test]
    fn ack_flags_default_to_true() {
        assert_eq!(parse_flag("", "accepted"), Ok(true));
        assert_eq!(parse_flag("{}", "accepted"), Ok(true));
        assert_eq!(parse_flag(r#"{"accepted":false}"#, "accepted"), Ok(false));
        assert_eq!(parse_flag(r#"{"cancelled":true}"#, "cancelled"), Ok(true));
        assert!(parse_flag(r#"{"accepted":"yes"}"#, "accepted").is_err());
        assert!(parse_flag("<html>", "accepted").is_err());
    }

    #[test]
    fn event_stream_detection_ignores_parameters_and_case() {
        let mut headers = HeaderMap::new();
        assert!(!is_event_stream(&headers));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("Text/Event-Stream; charset=utf-8"),
        );
        assert!(is_event_stream(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!is_event_stream(&headers));
    }

    #[test]
    fn http_api_requires_base_url() {
        assert!(matches!(
            HttpRunApi::new(ClientConfig::new("  ")),
            Err(ConfigError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn scripted_api_replays_in_order_and_records_calls() {
        let api = ScriptedRunApi::new()
            .with_stream(ScriptedStream::chunked(["data: 1\n", "\n"]))
            .with_submit(ScriptedSubmit::Ack { accepted: false });

        let chunks: Vec<_> = api
            .open_stream("t1", "a1")
            .await
            .expect("stream")
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert!(api.open_stream("t1", "a1").await.is_err());
        assert_eq!(api.opened_streams().len(), 2);

        let outputs = vec![ToolOutput {
            tool_call_id: "tc1".into(),
            output: "ok".into(),
        }];
        let reply = api.submit_tool_outputs("t1", "r1", &outputs).await.expect("submit");
        assert!(matches!(reply, SubmitResponse::Ack { accepted: false }));
        assert_eq!(api.submissions()[0].outputs, outputs);

        assert_eq!(api.cancel_run("t1", "r1").await, Ok(true));
        assert_eq!(api.cancel_calls(), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn scripted_read_error_follows_chunks() {
        let items: Vec<_> = ScriptedStream::body("data: {}\n\n")
            .then_read_error("reset by peer")
            .into_byte_stream()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Err(TransportError::read("reset by peer")));
    }

    #[tokio::test]
    async fn env_gated_smoke_open_stream_if_base_url_present() {
        if std::env::var("ASSIST_API_BASE_URL")
            .unwrap_or_default()
            .trim()
            .is_empty()
            || std::env::var("ASSIST_SMOKE_THREAD_ID").is_err()
            || std::env::var("ASSIST_SMOKE_ASSISTANT_ID").is_err()
        {
            eprintln!("skipping run api smoke test (ASSIST_API_BASE_URL or smoke ids missing)");
            return;
        }
        let api = HttpRunApi::from_env().expect("api");
        let thread_id = std::env::var("ASSIST_SMOKE_THREAD_ID").expect("thread id");
        let assistant_id = std::env::var("ASSIST_SMOKE_ASSISTANT_ID").expect("assistant id");
        let mut stream = api
            .open_stream(&thread_id, &assistant_id)
            .await
            .expect("open stream");
        let first = tokio::time::timeout(std::time::Duration::from_secs(30), stream.next())
            .await
            .expect("first chunk in time");
        assert!(matches!(first, Some(Ok(_))), "unexpected first chunk: {first:?}");
    }
}
