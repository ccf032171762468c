//! The closed set of run events and the normalization of upstream payloads.
//!
//! Upstream frames arrive as `{type, data}` objects whose `type` is either one
//! of the assistant API's dotted names (`thread.message.delta`, ...) or one of
//! the variant tags below (`TextDelta`, ...). All shape probing happens in
//! [`StreamEvent::from_payload`]; nothing downstream looks at raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool call the run wants the client to execute.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallDescriptor {
    pub id: String,
    pub function_name: String,
    pub raw_arguments: String,
}

impl ToolCallDescriptor {
    pub fn new(
        id: impl Into<String>,
        function_name: impl Into<String>,
        raw_arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            function_name: function_name.into(),
            raw_arguments: raw_arguments.into(),
        }
    }
}

/// One normalized stream event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    MessageCreated {
        message_id: String,
    },
    TextDelta {
        text: String,
    },
    MessageCompleted {
        final_text: String,
    },
    RunCreated {
        run_id: String,
    },
    RunStatusChanged {
        run_id: String,
        status: String,
    },
    RequiresAction {
        run_id: String,
        tool_calls: Vec<ToolCallDescriptor>,
    },
    ErrorOccurred {
        message: String,
    },
    StreamDone,
    /// Unknown `type`, or a known type missing the fields it needs.
    Unhandled {
        event_type: String,
    },
}

/// Upstream run status vocabulary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamRunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Other(String),
}

impl UpstreamRunStatus {
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "queued" => Self::Queued,
            "in_progress" => Self::InProgress,
            "requires_action" => Self::RequiresAction,
            "cancelling" => Self::Cancelling,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "expired" => Self::Expired,
            _ => Self::Other(status.to_string()),
        }
    }
}

const MISSING_TYPE: &str = "<missing type>";

impl StreamEvent {
    /// Normalizes one parsed frame payload.
    ///
    /// Never fails: shapes that cannot be mapped become [`StreamEvent::Unhandled`].
    pub fn from_payload(payload: &Value) -> Self {
        let Some(event_type) = payload
            .get("type")
            .or_else(|| payload.get("event"))
            .and_then(Value::as_str)
        else {
            return Self::Unhandled {
                event_type: MISSING_TYPE.to_string(),
            };
        };
        let data = payload.get("data").unwrap_or(payload);
        normalize(event_type, data).unwrap_or_else(|| Self::Unhandled {
            event_type: event_type.to_string(),
        })
    }

    /// Like [`from_payload`](Self::from_payload), but falls back to the SSE
    /// `event:` name when the payload carries no type of its own.
    pub fn from_frame(event_name: Option<&str>, payload: &Value) -> Self {
        let untyped = payload.get("type").is_none() && payload.get("event").is_none();
        match event_name.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) if untyped => normalize(name, payload).unwrap_or_else(|| Self::Unhandled {
                event_type: name.to_string(),
            }),
            _ => Self::from_payload(payload),
        }
    }

    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageCreated { .. } => "MessageCreated",
            Self::TextDelta { .. } => "TextDelta",
            Self::MessageCompleted { .. } => "MessageCompleted",
            Self::RunCreated { .. } => "RunCreated",
            Self::RunStatusChanged { .. } => "RunStatusChanged",
            Self::RequiresAction { .. } => "RequiresAction",
            Self::ErrorOccurred { .. } => "ErrorOccurred",
            Self::StreamDone => "StreamDone",
            Self::Unhandled { .. } => "Unhandled",
        }
    }
}

fn normalize(event_type: &str, data: &Value) -> Option<StreamEvent> {
    match event_type {
        "MessageCreated" | "thread.message.created" => Some(StreamEvent::MessageCreated {
            message_id: string_field(data, &["messageId", "message_id", "id"])?,
        }),
        "TextDelta" | "thread.message.delta" => Some(StreamEvent::TextDelta {
            text: delta_text(data)?,
        }),
        "MessageCompleted" | "thread.message.completed" => Some(StreamEvent::MessageCompleted {
            final_text: completed_text(data),
        }),
        "RunCreated" | "thread.run.created" => Some(StreamEvent::RunCreated {
            run_id: string_field(data, &["runId", "run_id", "id"])?,
        }),
        "RunStatusChanged" => Some(StreamEvent::RunStatusChanged {
            run_id: string_field(data, &["runId", "run_id", "id"]).unwrap_or_default(),
            status: string_field(data, &["status"])?,
        }),
        "RequiresAction" | "thread.run.requires_action" => Some(StreamEvent::RequiresAction {
            run_id: string_field(data, &["runId", "run_id", "id"])?,
            tool_calls: tool_calls(data),
        }),
        "ErrorOccurred" | "error" => Some(StreamEvent::ErrorOccurred {
            message: error_message(data),
        }),
        "StreamDone" | "done" => Some(StreamEvent::StreamDone),
        dotted if dotted.starts_with("thread.run.") && !dotted.starts_with("thread.run.step.") => {
            let suffix = dotted.trim_start_matches("thread.run.");
            let status = string_field(data, &["status"]).unwrap_or_else(|| suffix.to_string());
            Some(StreamEvent::RunStatusChanged {
                run_id: string_field(data, &["runId", "run_id", "id"]).unwrap_or_default(),
                status,
            })
        }
        _ => None,
    }
}

fn string_field(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| data.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Collects `content[*].text.value` (assistant API message shape).
fn content_text(content: &Value) -> Option<String> {
    let parts = content.as_array()?;
    let mut out = String::new();
    let mut found = false;
    for part in parts {
        let text = part
            .get("text")
            .and_then(|t| t.get("value").and_then(Value::as_str).or_else(|| t.as_str()));
        if let Some(text) = text {
            out.push_str(text);
            found = true;
        }
    }
    found.then_some(out)
}

fn delta_text(data: &Value) -> Option<String> {
    if let Some(text) = data.get("text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    if let Some(text) = data.get("value").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    data.get("delta")
        .and_then(|delta| delta.get("content"))
        .and_then(content_text)
}

fn completed_text(data: &Value) -> String {
    string_field(data, &["finalText", "final_text", "text"])
        .or_else(|| data.get("content").and_then(content_text))
        .unwrap_or_default()
}

fn error_message(data: &Value) -> String {
    if let Some(message) = data.as_str() {
        return message.to_string();
    }
    string_field(data, &["message"])
        .or_else(|| data.get("error").and_then(|e| string_field(e, &["message"])))
        .unwrap_or_else(|| "unknown stream error".to_string())
}

fn tool_calls(data: &Value) -> Vec<ToolCallDescriptor> {
    let calls = data
        .get("toolCalls")
        .or_else(|| data.get("tool_calls"))
        .or_else(|| {
            data.get("required_action")
                .and_then(|r| r.get("submit_tool_outputs"))
                .and_then(|s| s.get("tool_calls"))
        })
        .and_then(Value::as_array);
    let Some(calls) = calls else {
        return Vec::new();
    };
    calls.iter().filter_map(tool_call).collect()
}

fn tool_call(value: &Value) -> Option<ToolCallDescriptor> {
    let id = string_field(value, &["id", "toolCallId"])?;
    let function = value.get("function");
    let function_name = string_field(value, &["functionName", "function_name"])
        .or_else(|| function.and_then(|f| string_field(f, &["name"])))?;
    let arguments = value
        .get("rawArguments")
        .or_else(|| value.get("raw_arguments"))
        .or_else(|| function.and_then(|f| f.get("arguments")));
    let raw_arguments = match arguments {
        Some(Value::String(raw)) => raw.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    };
    Some(ToolCallDescriptor {
        id,
        function_name,
        raw_arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalized_tags_map_directly() {
        assert_eq!(
            StreamEvent::from_payload(&json!({"type":"RunCreated","data":{"runId":"r1"}})),
            StreamEvent::RunCreated { run_id: "r1".into() }
        );
        assert_eq!(
            StreamEvent::from_payload(&json!({"type":"TextDelta","data":{"text":"Hel"}})),
            StreamEvent::TextDelta { text: "Hel".into() }
        );
        assert_eq!(
            StreamEvent::from_payload(&json!({"type":"MessageCompleted","data":{"finalText":"Hello"}})),
            StreamEvent::MessageCompleted {
                final_text: "Hello".into()
            }
        );
        assert_eq!(
            StreamEvent::from_payload(&json!({"type":"StreamDone"})),
            StreamEvent::StreamDone
        );
    }

    #[test]
    fn assistant_api_message_events_are_normalized() {
        let created = json!({"type":"thread.message.created","data":{"id":"msg_1","role":"assistant"}});
        assert_eq!(
            StreamEvent::from_payload(&created),
            StreamEvent::MessageCreated {
                message_id: "msg_1".into()
            }
        );

        let delta = json!({
            "type":"thread.message.delta",
            "data":{"id":"msg_1","delta":{"content":[{"index":0,"type":"text","text":{"value":"Hi "}}]}}
        });
        assert_eq!(
            StreamEvent::from_payload(&delta),
            StreamEvent::TextDelta { text: "Hi ".into() }
        );

        let completed = json!({
            "type":"thread.message.completed",
            "data":{"id":"msg_1","content":[{"type":"text","text":{"value":"Hi there","annotations":[]}}]}
        });
        assert_eq!(
            StreamEvent::from_payload(&completed),
            StreamEvent::MessageCompleted {
                final_text: "Hi there".into()
            }
        );
    }

    #[test]
    fn assistant_api_run_events_are_normalized() {
        let queued = json!({"type":"thread.run.queued","data":{"id":"run_1","status":"queued"}});
        assert_eq!(
            StreamEvent::from_payload(&queued),
            StreamEvent::RunStatusChanged {
                run_id: "run_1".into(),
                status: "queued".into()
            }
        );

        let expired = json!({"type":"thread.run.expired","data":{"id":"run_1"}});
        assert_eq!(
            StreamEvent::from_payload(&expired),
            StreamEvent::RunStatusChanged {
                run_id: "run_1".into(),
                status: "expired".into()
            }
        );

        let step = json!({"type":"thread.run.step.created","data":{"id":"step_1"}});
        assert_eq!(
            StreamEvent::from_payload(&step),
            StreamEvent::Unhandled {
                event_type: "thread.run.step.created".into()
            }
        );
    }

    #[test]
    fn requires_action_reads_nested_tool_calls() {
        let payload = json!({
            "type":"thread.run.requires_action",
            "data":{
                "id":"run_1",
                "required_action":{"type":"submit_tool_outputs","submit_tool_outputs":{"tool_calls":[
                    {"id":"call_1","type":"function","function":{"name":"GeneratePDFForm","arguments":"{\"formKey\":\"x\"}"}}
                ]}}
            }
        });
        assert_eq!(
            StreamEvent::from_payload(&payload),
            StreamEvent::RequiresAction {
                run_id: "run_1".into(),
                tool_calls: vec![ToolCallDescriptor::new(
                    "call_1",
                    "GeneratePDFForm",
                    "{\"formKey\":\"x\"}"
                )],
            }
        );
    }

    #[test]
    fn requires_action_accepts_object_arguments() {
        let payload = json!({
            "type":"RequiresAction",
            "data":{"runId":"r1","toolCalls":[{"id":"tc1","functionName":"GetFormFields","rawArguments":{"formKey":"patient_intake"}}]}
        });
        let StreamEvent::RequiresAction { tool_calls, .. } = StreamEvent::from_payload(&payload)
        else {
            panic!("expected RequiresAction");
        };
        let args: Value = serde_json::from_str(&tool_calls[0].raw_arguments).expect("json");
        assert_eq!(args, json!({"formKey":"patient_intake"}));
    }

    #[test]
    fn error_payload_variants() {
        assert_eq!(
            StreamEvent::from_payload(&json!({"type":"error","data":{"error":{"message":"rate limited"}}})),
            StreamEvent::ErrorOccurred {
                message: "rate limited".into()
            }
        );
        assert_eq!(
            StreamEvent::from_payload(&json!({"type":"ErrorOccurred","data":"boom"})),
            StreamEvent::ErrorOccurred {
                message: "boom".into()
            }
        );
    }

    #[test]
    fn unknown_and_incomplete_shapes_are_unhandled() {
        assert_eq!(
            StreamEvent::from_payload(&json!({"type":"thread.created","data":{}})),
            StreamEvent::Unhandled {
                event_type: "thread.created".into()
            }
        );
        assert_eq!(
            StreamEvent::from_payload(&json!({"type":"RunCreated","data":{}})),
            StreamEvent::Unhandled {
                event_type: "RunCreated".into()
            }
        );
        assert_eq!(
            StreamEvent::from_payload(&json!({"data":{"text":"orphan"}})),
            StreamEvent::Unhandled {
                event_type: MISSING_TYPE.into()
            }
        );
    }

    #[test]
    fn upstream_status_parse_is_case_insensitive() {
        assert_eq!(UpstreamRunStatus::parse("IN_PROGRESS"), UpstreamRunStatus::InProgress);
        assert_eq!(
            UpstreamRunStatus::parse("incomplete"),
            UpstreamRunStatus::Other("incomplete".into())
        );
    }

    #[test]
    fn sse_event_name_types_untyped_payloads() {
        assert_eq!(
            StreamEvent::from_frame(Some("thread.run.created"), &json!({"id":"run_9","status":"queued"})),
            StreamEvent::RunCreated {
                run_id: "run_9".into()
            }
        );
        assert_eq!(
            StreamEvent::from_frame(Some("thread.message.created"), &json!({"type":"RunCreated","data":{"runId":"r1"}})),
            StreamEvent::RunCreated { run_id: "r1".into() }
        );
        assert_eq!(
            StreamEvent::from_frame(Some("ping"), &json!({})),
            StreamEvent::Unhandled {
                event_type: "ping".into()
            }
        );
    }
}
