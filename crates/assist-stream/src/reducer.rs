//! Pure state transitions for a run.
//!
//! [`reduce`] takes the current [`RunSession`] and one [`StreamEvent`] and
//! returns the next state plus the side effects to perform, as data. Nothing
//! here does I/O, so every transition is testable without a network.

use tracing::trace;

use crate::event::{StreamEvent, ToolCallDescriptor, UpstreamRunStatus};
use crate::state::{Role, RunSession, RunStatus};

/// A side effect requested by a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Intent {
    ObserveNewMessage {
        message_id: String,
    },
    UpdateObservableText {
        text: String,
    },
    PersistMessage {
        role: Role,
        content: String,
    },
    DispatchToolCalls {
        run_id: String,
        tool_calls: Vec<ToolCallDescriptor>,
    },
    SurfaceError {
        message: String,
    },
    /// Re-fetch the canonical history in case a completion event was missed.
    FinalizeAndRefetch,
    LogUnhandled {
        event_type: String,
    },
}

/// Result of one transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reduction {
    pub state: RunSession,
    pub intents: Vec<Intent>,
}

impl Reduction {
    fn new(state: RunSession, intents: Vec<Intent>) -> Self {
        Self { state, intents }
    }
}

/// Fresh state for a run that is about to connect.
pub fn begin(thread_id: &str, assistant_id: &str) -> RunSession {
    RunSession {
        status: RunStatus::Connecting,
        ..RunSession::new(thread_id, assistant_id)
    }
}

/// Applies one event. Terminal states absorb every event without intents.
pub fn reduce(mut state: RunSession, event: StreamEvent) -> Reduction {
    if state.is_terminal() {
        trace!(
            event = "reducer.event_after_terminal",
            domain = "stream",
            kind = event.kind(),
            status = %state.status
        );
        return Reduction::new(state, Vec::new());
    }

    let mut intents = Vec::new();
    match event {
        StreamEvent::MessageCreated { message_id } => {
            mark_streaming(&mut state);
            state.current_message_id = Some(message_id.clone());
            state.accumulated_text.clear();
            intents.push(Intent::ObserveNewMessage { message_id });
        }
        StreamEvent::TextDelta { text } => {
            mark_streaming(&mut state);
            if state.current_message_id.is_none() {
                state.provisional_seq += 1;
                let message_id = format!("provisional-{}", state.provisional_seq);
                state.current_message_id = Some(message_id.clone());
                intents.push(Intent::ObserveNewMessage { message_id });
            }
            state.accumulated_text.push_str(&text);
            intents.push(Intent::UpdateObservableText {
                text: state.accumulated_text.clone(),
            });
        }
        StreamEvent::MessageCompleted { final_text } => {
            let accumulated = std::mem::take(&mut state.accumulated_text);
            let content = if final_text.is_empty() {
                accumulated
            } else {
                final_text
            };
            state.current_message_id = None;
            if !content.is_empty() {
                intents.push(Intent::PersistMessage {
                    role: Role::Assistant,
                    content,
                });
            }
        }
        StreamEvent::RunCreated { run_id } => {
            state.run_id = Some(run_id);
            state.status = RunStatus::Streaming;
        }
        StreamEvent::RunStatusChanged { run_id, status } => {
            if state.run_id.is_none() && !run_id.is_empty() {
                state.run_id = Some(run_id);
            }
            apply_run_status(&mut state, &status, &mut intents);
        }
        StreamEvent::RequiresAction { run_id, tool_calls } => {
            if state.run_id.is_none() {
                state.run_id = Some(run_id.clone());
            }
            let mut fresh: Vec<ToolCallDescriptor> = Vec::new();
            for call in tool_calls {
                if state.is_tool_call_known(&call.id) || fresh.iter().any(|c| c.id == call.id) {
                    continue;
                }
                fresh.push(call);
            }
            if !fresh.is_empty() || !state.pending_tool_calls.is_empty() {
                state.status = RunStatus::AwaitingToolOutput;
            }
            if !fresh.is_empty() {
                state.pending_tool_calls.extend(fresh.iter().cloned());
                intents.push(Intent::DispatchToolCalls {
                    run_id,
                    tool_calls: fresh,
                });
            }
        }
        StreamEvent::ErrorOccurred { message } => fail(&mut state, message, &mut intents),
        StreamEvent::StreamDone => finalize(&mut state, &mut intents),
        StreamEvent::Unhandled { event_type } => {
            intents.push(Intent::LogUnhandled { event_type });
        }
    }
    Reduction::new(state, intents)
}

/// Content arriving means the run is streaming, unless tool outputs are
/// still owed.
fn mark_streaming(state: &mut RunSession) {
    let idle_or_connecting = matches!(state.status, RunStatus::Idle | RunStatus::Connecting);
    let nothing_owed =
        state.status == RunStatus::AwaitingToolOutput && state.pending_tool_calls.is_empty();
    if idle_or_connecting || nothing_owed {
        state.status = RunStatus::Streaming;
    }
}

fn apply_run_status(state: &mut RunSession, status: &str, intents: &mut Vec<Intent>) {
    match UpstreamRunStatus::parse(status) {
        UpstreamRunStatus::Queued | UpstreamRunStatus::InProgress | UpstreamRunStatus::Cancelling => {
            state.status = RunStatus::Streaming;
        }
        UpstreamRunStatus::RequiresAction => state.status = RunStatus::AwaitingToolOutput,
        UpstreamRunStatus::Completed => finalize(state, intents),
        UpstreamRunStatus::Failed => fail(state, "assistant run failed".to_string(), intents),
        UpstreamRunStatus::Expired => fail(state, "assistant run expired".to_string(), intents),
        UpstreamRunStatus::Cancelled => state.status = RunStatus::Cancelled,
        UpstreamRunStatus::Other(other) => intents.push(Intent::LogUnhandled {
            event_type: format!("run status `{other}`"),
        }),
    }
}

fn fail(state: &mut RunSession, message: String, intents: &mut Vec<Intent>) {
    state.status = RunStatus::Failed;
    state.stream_error = Some(message.clone());
    intents.push(Intent::SurfaceError { message });
}

/// Defensive completion: persist any text whose completion event never
/// arrived, then ask for the canonical history.
fn finalize(state: &mut RunSession, intents: &mut Vec<Intent>) {
    let leftover = std::mem::take(&mut state.accumulated_text);
    state.current_message_id = None;
    if !leftover.is_empty() {
        intents.push(Intent::PersistMessage {
            role: Role::Assistant,
            content: leftover,
        });
    }
    intents.push(Intent::FinalizeAndRefetch);
    state.status = RunStatus::Completed;
}

/// Marks tool calls as submitted. Once the pending set drains, the run is
/// streaming again.
pub fn resolve_tool_calls(mut state: RunSession, ids: &[String]) -> RunSession {
    state.pending_tool_calls.retain(|call| !ids.contains(&call.id));
    state.resolved_tool_calls.extend(ids.iter().cloned());
    if state.status == RunStatus::AwaitingToolOutput && state.pending_tool_calls.is_empty() {
        state.status = RunStatus::Streaming;
    }
    state
}

/// Local cancellation. No effect once terminal.
pub fn cancel(mut state: RunSession) -> RunSession {
    if !state.is_terminal() {
        state.status = RunStatus::Cancelled;
    }
    state
}

pub fn record_warning(mut state: RunSession, warning: String) -> RunSession {
    state.warnings.push(warning);
    state
}
