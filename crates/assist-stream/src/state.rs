use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::ToolCallDescriptor;

/// Lifecycle of one run as seen by the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Connecting,
    Streaming,
    AwaitingToolOutput,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// `completed`, `failed` and `cancelled` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States during which a cancel affordance makes sense.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Streaming | Self::AwaitingToolOutput)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::AwaitingToolOutput => "awaiting_tool_output",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of one run. Only [`crate::reducer`] produces new values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSession {
    pub thread_id: String,
    pub assistant_id: String,
    /// Learned from the first run event; `None` until then.
    pub run_id: Option<String>,
    pub status: RunStatus,
    /// Text of the message being streamed, cleared when a new message begins.
    pub accumulated_text: String,
    /// Provisional (client-side) or upstream id of the message being streamed.
    pub current_message_id: Option<String>,
    /// Tool calls seen but not yet submitted, in arrival order.
    pub pending_tool_calls: Vec<ToolCallDescriptor>,
    /// Tool call ids whose outcome has been submitted.
    pub resolved_tool_calls: BTreeSet<String>,
    /// User-visible error for the UI.
    pub stream_error: Option<String>,
    /// Non-fatal problems, e.g. a message that could not be persisted.
    pub warnings: Vec<String>,
    /// Counter behind synthesized message ids.
    pub provisional_seq: u64,
}

impl RunSession {
    pub fn new(thread_id: impl Into<String>, assistant_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            assistant_id: assistant_id.into(),
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_tool_call_known(&self, id: &str) -> bool {
        self.resolved_tool_calls.contains(id) || self.pending_tool_calls.iter().any(|c| c.id == id)
    }
}
