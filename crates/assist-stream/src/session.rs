//! Connection lifecycle for one assistant run at a time.
//!
//! [`StreamSession::start`] opens the event stream and drives a single
//! pipeline: bytes go through the [`SseDecoder`], each decoded event goes
//! through [`reducer::reduce`], and the resulting intents are executed before
//! the next chunk is read. State is published on a `watch` channel so any
//! number of observers can follow along; [`StreamSession::cancel`] may be
//! called from any task.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt as _;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::api::{ByteStream, RunApi, SubmitResponse};
use crate::config::SessionOptions;
use crate::errors::{SessionError, TransportError};
use crate::event::{StreamEvent, ToolCallDescriptor};
use crate::persistence::{MessagePersistenceGateway, PersistedMessage, persist_with_retry};
use crate::reducer::{self, Intent};
use crate::sse::{SseDecoder, SseItem};
use crate::state::{Role, RunSession, RunStatus};
use crate::tools::{ToolCallDispatcher, ToolRegistry};

/// Fires cancellation into the running pipeline.
struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    fn abort(&self) {
        self.tx.send_replace(true);
    }
}

/// Present while a run is in flight. The handle is taken on the first cancel
/// so it fires at most once.
struct ActiveRun {
    abort: Option<AbortHandle>,
}

struct SessionInner {
    api: Arc<dyn RunApi>,
    gateway: Arc<dyn MessagePersistenceGateway>,
    dispatcher: ToolCallDispatcher,
    options: SessionOptions,
    state: watch::Sender<RunSession>,
    history: watch::Sender<Vec<PersistedMessage>>,
    active: Mutex<Option<ActiveRun>>,
}

impl SessionInner {
    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, f: impl FnOnce(RunSession) -> RunSession) {
        self.state.send_modify(|state| *state = f(std::mem::take(state)));
    }

    /// Runs one event through the reducer and returns its intents.
    fn apply(&self, event: StreamEvent) -> Vec<Intent> {
        let mut intents = Vec::new();
        self.state.send_modify(|state| {
            let reduction = reducer::reduce(std::mem::take(state), event);
            *state = reduction.state;
            intents = reduction.intents;
        });
        intents
    }

    fn warn_user(&self, warning: String) {
        self.update(|state| reducer::record_warning(state, warning));
    }
}

/// Clears the active slot however `start` exits, including when its future
/// is dropped mid-run.
struct ActiveGuard<'a> {
    inner: &'a SessionInner,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.inner.lock_active();
        slot.take();
        if !self.inner.state.borrow().is_terminal() {
            self.inner.update(reducer::cancel);
        }
    }
}

/// Builder for [`StreamSession`].
pub struct StreamSessionBuilder {
    api: Arc<dyn RunApi>,
    gateway: Arc<dyn MessagePersistenceGateway>,
    tools: ToolRegistry,
    options: SessionOptions,
}

impl StreamSessionBuilder {
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> StreamSession {
        let (state, _) = watch::channel(RunSession::default());
        let (history, _) = watch::channel(Vec::new());
        StreamSession {
            inner: Arc::new(SessionInner {
                dispatcher: ToolCallDispatcher::new(self.tools, self.api.clone()),
                api: self.api,
                gateway: self.gateway,
                options: self.options,
                state,
                history,
                active: Mutex::new(None),
            }),
        }
    }
}

/// Owns the lifecycle of one run at a time. Cheap to clone; clones share the
/// same run.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<SessionInner>,
}

impl StreamSession {
    pub fn builder(
        api: Arc<dyn RunApi>,
        gateway: Arc<dyn MessagePersistenceGateway>,
    ) -> StreamSessionBuilder {
        StreamSessionBuilder {
            api,
            gateway,
            tools: ToolRegistry::new(),
            options: SessionOptions::default(),
        }
    }

    /// Runs `assistant_id` on `thread_id` until the run reaches a terminal
    /// state, and returns that state.
    ///
    /// Failures after the connection attempt (transport errors, upstream run
    /// failures) are reported through the returned [`RunSession`], not as
    /// `Err`.
    pub async fn start(&self, thread_id: &str, assistant_id: &str) -> Result<RunSession, SessionError> {
        let abort_rx = {
            let mut slot = self.inner.lock_active();
            if slot.is_some() {
                warn!(
                    event = "session.start_rejected",
                    domain = "session",
                    thread_id,
                    reason = "already_active"
                );
                return Err(SessionError::AlreadyActive);
            }
            if let Some(message) = invalid_ids(thread_id, assistant_id) {
                let failed = reducer::reduce(
                    reducer::begin(thread_id, assistant_id),
                    StreamEvent::ErrorOccurred {
                        message: message.clone(),
                    },
                );
                self.inner.state.send_replace(failed.state);
                return Err(SessionError::InvalidArgument(message));
            }
            let (tx, rx) = watch::channel(false);
            *slot = Some(ActiveRun {
                abort: Some(AbortHandle { tx }),
            });
            // Published under the slot lock so a concurrent cancel sees this
            // run, not the previous one.
            self.inner
                .state
                .send_replace(reducer::begin(thread_id, assistant_id));
            rx
        };
        let guard = ActiveGuard { inner: &self.inner };
        info!(event = "session.start", domain = "session", thread_id, assistant_id);

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(persist_worker(
            self.inner.clone(),
            thread_id.to_string(),
            persist_rx,
        ));

        let mut pipeline = Pipeline {
            inner: &self.inner,
            thread_id: thread_id.to_string(),
            abort_rx,
            persist_tx,
            tool_rounds: 0,
        };
        pipeline.run(assistant_id).await;
        drop(pipeline);

        if let Err(err) = worker.await {
            warn!(event = "session.persist_worker_failed", domain = "session", error = %err);
        }
        drop(guard);

        let finished = self.snapshot();
        info!(
            event = "session.finished",
            domain = "session",
            thread_id,
            run_id = finished.run_id.as_deref().unwrap_or(""),
            status = %finished.status,
            warnings = finished.warnings.len()
        );
        Ok(finished)
    }

    /// Aborts the in-flight run. Idempotent; a no-op when nothing is running
    /// or the run already finished.
    ///
    /// Upstream is told about the cancellation on a background task when a
    /// tokio runtime is available; failure to notify is only logged.
    pub fn cancel(&self) {
        let mut slot = self.inner.lock_active();
        let Some(handle) = slot.as_mut().and_then(|active| active.abort.take()) else {
            debug!(event = "session.cancel_ignored", domain = "session");
            return;
        };

        let mut notify = None;
        self.inner.state.send_modify(|state| {
            let was_terminal = state.is_terminal();
            *state = reducer::cancel(std::mem::take(state));
            if !was_terminal && let Some(run_id) = state.run_id.clone() {
                notify = Some((state.thread_id.clone(), run_id));
            }
        });
        handle.abort();
        drop(slot);

        info!(
            event = "session.cancelled",
            domain = "session",
            upstream_notified = notify.is_some()
        );
        if let Some((thread_id, run_id)) = notify {
            self.notify_upstream_cancel(thread_id, run_id);
        }
    }

    fn notify_upstream_cancel(&self, thread_id: String, run_id: String) {
        let api = self.inner.api.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                event = "session.cancel_notify_skipped",
                domain = "session",
                run_id = %run_id,
                reason = "no_runtime"
            );
            return;
        };
        runtime.spawn(async move {
            match api.cancel_run(&thread_id, &run_id).await {
                Ok(acknowledged) => debug!(
                    event = "session.cancel_notified",
                    domain = "session",
                    run_id = %run_id,
                    acknowledged
                ),
                Err(err) => warn!(
                    event = "session.cancel_notify_failed",
                    domain = "session",
                    run_id = %run_id,
                    error = %err
                ),
            }
        });
    }

    /// Follows every state change.
    pub fn subscribe(&self) -> watch::Receiver<RunSession> {
        self.inner.state.subscribe()
    }

    /// Canonical message history, replaced after each refetch.
    pub fn subscribe_history(&self) -> watch::Receiver<Vec<PersistedMessage>> {
        self.inner.history.subscribe()
    }

    pub fn status(&self) -> RunStatus {
        self.inner.state.borrow().status
    }

    pub fn snapshot(&self) -> RunSession {
        self.inner.state.borrow().clone()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }
}

fn invalid_ids(thread_id: &str, assistant_id: &str) -> Option<String> {
    if thread_id.trim().is_empty() {
        Some("thread_id must not be empty".to_string())
    } else if assistant_id.trim().is_empty() {
        Some("assistant_id must not be empty".to_string())
    } else {
        None
    }
}

enum PersistJob {
    Message { role: Role, content: String },
    Refetch,
}

/// Applies persistence intents in FIFO order off the read path.
async fn persist_worker(
    inner: Arc<SessionInner>,
    thread_id: String,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            PersistJob::Message { role, content } => {
                match persist_with_retry(
                    inner.gateway.as_ref(),
                    &inner.options.persist_retry,
                    &thread_id,
                    role,
                    &content,
                )
                .await
                {
                    Ok(message_id) => debug!(
                        event = "persist.stored",
                        domain = "persist",
                        thread_id = %thread_id,
                        message_id = %message_id,
                        role = %role
                    ),
                    Err(err) => {
                        warn!(
                            event = "persist.failed",
                            domain = "persist",
                            thread_id = %thread_id,
                            role = %role,
                            error = %err
                        );
                        inner.warn_user(format!("message could not be saved: {err}"));
                    }
                }
            }
            PersistJob::Refetch => match inner.gateway.fetch_canonical(&thread_id).await {
                Ok(messages) => {
                    debug!(
                        event = "persist.refetched",
                        domain = "persist",
                        thread_id = %thread_id,
                        messages = messages.len()
                    );
                    inner.history.send_replace(messages);
                }
                Err(err) => {
                    warn!(
                        event = "persist.refetch_failed",
                        domain = "persist",
                        thread_id = %thread_id,
                        error = %err
                    );
                    inner.warn_user(format!("message history could not be refreshed: {err}"));
                }
            },
        }
    }
}

enum Read {
    Chunk(Bytes),
    Failed(TransportError),
    Closed,
    Idle,
}

async fn read_next(stream: &mut ByteStream, idle: Option<Duration>) -> Read {
    let next = match idle {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Read::Idle,
        },
        None => stream.next().await,
    };
    match next {
        Some(Ok(chunk)) => Read::Chunk(chunk),
        Some(Err(err)) => Read::Failed(err),
        None => Read::Closed,
    }
}

/// Resolves once cancellation is requested; never resolves otherwise.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    let sender_gone = rx.wait_for(|flag| *flag).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

/// What the read loop does next.
enum Flow {
    Continue,
    /// Upstream resumed the run on a new stream.
    Switch(ByteStream),
    Stop,
}

struct Pipeline<'a> {
    inner: &'a SessionInner,
    thread_id: String,
    abort_rx: watch::Receiver<bool>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    tool_rounds: u32,
}

impl Pipeline<'_> {
    async fn run(&mut self, assistant_id: &str) {
        let opened = tokio::select! {
            biased;
            _ = aborted(&mut self.abort_rx) => return,
            opened = self.inner.api.open_stream(&self.thread_id, assistant_id) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        let idle = self.inner.options.idle_timeout_duration();
        let mut decoder = SseDecoder::new();

        loop {
            let read = tokio::select! {
                biased;
                _ = aborted(&mut self.abort_rx) => return,
                read = read_next(&mut stream, idle) => read,
            };
            let (items, closed) = match read {
                Read::Chunk(chunk) => (decoder.push_chunk(&chunk), false),
                Read::Closed => (decoder.finish(), true),
                Read::Idle => {
                    warn!(
                        event = "stream.idle_timeout",
                        domain = "stream",
                        thread_id = %self.thread_id,
                        idle_ms = idle.map(|d| d.as_millis() as u64).unwrap_or_default()
                    );
                    (decoder.finish(), true)
                }
                Read::Failed(err) => {
                    self.fail(err);
                    return;
                }
            };

            match self.process(items).await {
                Flow::Continue => {}
                Flow::Stop => return,
                Flow::Switch(next) => {
                    debug!(event = "stream.continuation", domain = "stream", thread_id = %self.thread_id);
                    stream = next;
                    decoder = SseDecoder::new();
                    continue;
                }
            }

            if closed {
                debug!(
                    event = "stream.closed",
                    domain = "stream",
                    thread_id = %self.thread_id,
                    pending_bytes = decoder.pending_bytes()
                );
                self.execute(StreamEvent::StreamDone).await;
                return;
            }
        }
    }

    async fn process(&mut self, items: Vec<SseItem>) -> Flow {
        for item in items {
            let event = match item {
                SseItem::Payload { event, value } => StreamEvent::from_frame(event.as_deref(), &value),
                SseItem::Done => StreamEvent::StreamDone,
                SseItem::Malformed { error, data } => {
                    warn!(
                        event = "stream.frame_malformed",
                        domain = "stream",
                        thread_id = %self.thread_id,
                        error = %error,
                        data_len = data.len()
                    );
                    continue;
                }
            };
            match self.execute(event).await {
                Flow::Continue => {}
                other => return other,
            }
            if *self.abort_rx.borrow() || self.inner.state.borrow().is_terminal() {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Applies one event and carries out its intents.
    async fn execute(&mut self, event: StreamEvent) -> Flow {
        trace!(event = "stream.event", domain = "stream", kind = event.kind());
        let mut flow = Flow::Continue;
        for intent in self.inner.apply(event) {
            match intent {
                Intent::ObserveNewMessage { message_id } => debug!(
                    event = "stream.message_started",
                    domain = "stream",
                    thread_id = %self.thread_id,
                    message_id = %message_id
                ),
                Intent::UpdateObservableText { text } => trace!(
                    event = "stream.text_updated",
                    domain = "stream",
                    chars = text.chars().count()
                ),
                Intent::PersistMessage { role, content } => {
                    self.enqueue(PersistJob::Message { role, content });
                }
                Intent::DispatchToolCalls { run_id, tool_calls } => {
                    flow = self.dispatch(&run_id, &tool_calls).await;
                }
                Intent::SurfaceError { message } => warn!(
                    event = "stream.run_failed",
                    domain = "stream",
                    thread_id = %self.thread_id,
                    error = %message
                ),
                Intent::FinalizeAndRefetch => self.enqueue(PersistJob::Refetch),
                Intent::LogUnhandled { event_type } => debug!(
                    event = "stream.event_unhandled",
                    domain = "stream",
                    event_type = %event_type
                ),
            }
        }
        flow
    }

    fn enqueue(&self, job: PersistJob) {
        if self.persist_tx.send(job).is_err() {
            warn!(event = "persist.worker_gone", domain = "persist", thread_id = %self.thread_id);
        }
    }

    async fn dispatch(&mut self, run_id: &str, tool_calls: &[ToolCallDescriptor]) -> Flow {
        let limit = self.inner.options.max_tool_rounds;
        if self.tool_rounds >= limit {
            warn!(
                event = "tool.round_limit",
                domain = "tool",
                run_id,
                limit
            );
            self.inner.apply(StreamEvent::ErrorOccurred {
                message: format!("tool call limit of {limit} round trips exceeded"),
            });
            return Flow::Stop;
        }
        self.tool_rounds += 1;

        let submitted = tokio::select! {
            biased;
            _ = aborted(&mut self.abort_rx) => return Flow::Stop,
            submitted = self.inner.dispatcher.submit_batch(&self.thread_id, run_id, tool_calls) => submitted,
        };
        let batch = match submitted {
            Ok(batch) => batch,
            Err(err) => {
                self.fail(err);
                return Flow::Stop;
            }
        };
        let ids = batch.resolved_ids();
        self.inner
            .update(|state| reducer::resolve_tool_calls(state, &ids));

        match batch.response {
            SubmitResponse::Continuation(stream) => Flow::Switch(stream),
            SubmitResponse::Ack { accepted: true } => Flow::Continue,
            SubmitResponse::Ack { accepted: false } => {
                self.inner.apply(StreamEvent::ErrorOccurred {
                    message: "tool outputs were rejected by upstream".to_string(),
                });
                Flow::Stop
            }
        }
    }

    /// Transport failures end the run; they are not retried.
    fn fail(&self, err: TransportError) {
        warn!(
            event = "stream.transport_failed",
            domain = "stream",
            thread_id = %self.thread_id,
            error = %err
        );
        self.inner.apply(StreamEvent::ErrorOccurred {
            message: err.to_string(),
        });
    }
}
