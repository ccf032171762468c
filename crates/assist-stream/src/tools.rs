//! Tool-call dispatch: resolve each requested function to a local handler,
//! run it, and hand every outcome of a batch back upstream in one call.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::api::{RunApi, SubmitResponse, ToolOutput};
use crate::errors::{ToolError, TransportError};
use crate::event::ToolCallDescriptor;

/// A locally executable function the assistant may call.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Function name as it appears in tool calls.
    fn name(&self) -> &str;

    /// Runs the tool with the raw JSON argument string and returns the output
    /// submitted upstream.
    async fn call(&self, raw_arguments: &str) -> Result<String, ToolError>;
}

/// Function name -> handler.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers under [`ToolHandler::name`], replacing any previous handler.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, function_name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(function_name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Result of running one tool call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolOutcome {
    Output { tool_call_id: String, output: String },
    Error { tool_call_id: String, error: ToolError },
}

impl ToolOutcome {
    pub fn tool_call_id(&self) -> &str {
        match self {
            Self::Output { tool_call_id, .. } | Self::Error { tool_call_id, .. } => tool_call_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Wire form. Errors become `{"error":{"kind":..,"message":..}}` so the
    /// run can react to them.
    pub fn to_tool_output(&self) -> ToolOutput {
        match self {
            Self::Output {
                tool_call_id,
                output,
            } => ToolOutput {
                tool_call_id: tool_call_id.clone(),
                output: output.clone(),
            },
            Self::Error {
                tool_call_id,
                error,
            } => ToolOutput {
                tool_call_id: tool_call_id.clone(),
                output: serde_json::json!({
                    "error": { "kind": error.kind(), "message": error.message() }
                })
                .to_string(),
            },
        }
    }
}

/// Outcomes of a batch plus what upstream answered.
#[derive(Debug)]
pub struct BatchSubmission {
    pub outcomes: Vec<ToolOutcome>,
    pub response: SubmitResponse,
}

impl BatchSubmission {
    /// Every id in the batch, successful or not. A failed tool is a submitted
    /// outcome, not a retryable one.
    pub fn resolved_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .map(|o| o.tool_call_id().to_string())
            .collect()
    }
}

pub struct ToolCallDispatcher {
    registry: ToolRegistry,
    api: Arc<dyn RunApi>,
}

impl ToolCallDispatcher {
    pub fn new(registry: ToolRegistry, api: Arc<dyn RunApi>) -> Self {
        Self { registry, api }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs one call. Never fails: unknown functions and handler errors become
    /// [`ToolOutcome::Error`].
    pub async fn dispatch(&self, call: &ToolCallDescriptor) -> ToolOutcome {
        let Some(handler) = self.registry.get(&call.function_name) else {
            warn!(
                event = "tool.unsupported",
                domain = "tool",
                tool_call_id = %call.id,
                function = %call.function_name
            );
            return ToolOutcome::Error {
                tool_call_id: call.id.clone(),
                error: ToolError::UnsupportedFunction(call.function_name.clone()),
            };
        };
        debug!(
            event = "tool.dispatch",
            domain = "tool",
            tool_call_id = %call.id,
            function = %call.function_name
        );
        match handler.call(&call.raw_arguments).await {
            Ok(output) => ToolOutcome::Output {
                tool_call_id: call.id.clone(),
                output,
            },
            Err(error) => {
                warn!(
                    event = "tool.failed",
                    domain = "tool",
                    tool_call_id = %call.id,
                    function = %call.function_name,
                    kind = error.kind(),
                    error = %error
                );
                ToolOutcome::Error {
                    tool_call_id: call.id.clone(),
                    error,
                }
            }
        }
    }

    /// Dispatches `calls` in order, then submits all outcomes together.
    pub async fn submit_batch(
        &self,
        thread_id: &str,
        run_id: &str,
        calls: &[ToolCallDescriptor],
    ) -> Result<BatchSubmission, TransportError> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            outcomes.push(self.dispatch(call).await);
        }
        let outputs: Vec<ToolOutput> = outcomes.iter().map(ToolOutcome::to_tool_output).collect();
        let response = self
            .api
            .submit_tool_outputs(thread_id, run_id, &outputs)
            .await?;
        info!(
            event = "tool.batch_submitted",
            domain = "tool",
            thread_id,
            run_id,
            calls = outcomes.len(),
            failed = outcomes.iter().filter(|o| o.is_error()).count(),
            continuation = matches!(response, SubmitResponse::Continuation(_))
        );
        Ok(BatchSubmission { outcomes, response })
    }
}
