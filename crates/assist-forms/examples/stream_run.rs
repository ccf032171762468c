//! Streams one assistant run with the form tools registered.
//!
//! With `ASSIST_API_BASE_URL`, `ASSIST_THREAD_ID` and `ASSIST_ASSISTANT_ID`
//! set (a `.env` file works), the run goes to the real service. Otherwise a
//! scripted run that asks for an intake form is replayed offline.
//! Generated documents land in `./generated-forms`.

use std::error::Error;
use std::sync::Arc;

use assist_forms::{DirectorySink, TemplatePreviewRenderer, default_registry};
use assist_stream::prelude::*;
use assist_stream::{ScriptedRunApi, ScriptedStream, ScriptedSubmit, init_observability};
use serde_json::json;

fn offline_api() -> ScriptedRunApi {
    let frame = |value: serde_json::Value| format!("data: {value}\n\n");
    let arguments = json!({
        "formKey": "patient_intake",
        "formData": {
            "patientName": "Dana Reyes",
            "dateOfBirth": "1990-04-02",
            "reasonForVisit": "Trouble sleeping"
        }
    });
    let first = [
        frame(json!({"type": "thread.run.created", "data": {"id": "run_demo", "status": "queued"}})),
        frame(json!({"type": "MessageCreated", "data": {"messageId": "msg_1"}})),
        frame(json!({"type": "TextDelta", "data": {"text": "Let me prepare that form. "}})),
        frame(json!({"type": "MessageCompleted", "data": {"finalText": "Let me prepare that form."}})),
        frame(json!({
            "type": "thread.run.requires_action",
            "data": {"id": "run_demo", "required_action": {"submit_tool_outputs": {"tool_calls": [
                {"id": "call_1", "type": "function",
                 "function": {"name": "GeneratePDFForm", "arguments": arguments.to_string()}}
            ]}}}
        })),
    ];
    let resumed = [
        frame(json!({"type": "MessageCreated", "data": {"messageId": "msg_2"}})),
        frame(json!({"type": "TextDelta", "data": {"text": "Your intake form "}})),
        frame(json!({"type": "TextDelta", "data": {"text": "is ready."}})),
        frame(json!({"type": "MessageCompleted", "data": {"finalText": "Your intake form is ready."}})),
        "data: [DONE]\n\n".to_string(),
    ];
    ScriptedRunApi::new()
        .with_stream(ScriptedStream::chunked(first))
        .with_submit(ScriptedSubmit::Continuation(ScriptedStream::chunked(resumed)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = dotenvy::dotenv();
    init_observability();

    let (api, thread_id, assistant_id): (Arc<dyn RunApi>, String, String) =
        match HttpRunApi::from_env() {
            Ok(api) => (
                Arc::new(api),
                std::env::var("ASSIST_THREAD_ID")?,
                std::env::var("ASSIST_ASSISTANT_ID")?,
            ),
            Err(err) => {
                eprintln!("{err}; replaying a scripted run");
                (Arc::new(offline_api()), "thread_demo".into(), "asst_demo".into())
            }
        };

    let tools = default_registry(
        Arc::new(TemplatePreviewRenderer::new()),
        Arc::new(DirectorySink::new("generated-forms")),
    );
    let session = StreamSession::builder(api, Arc::new(InMemoryMessageStore::new()))
        .tools(tools)
        .options(SessionOptions::from_env()?)
        .build();

    let mut updates = session.subscribe();
    let printer = tokio::spawn(async move {
        let mut last = RunStatus::Idle;
        while updates.changed().await.is_ok() {
            let state = updates.borrow_and_update().clone();
            if state.status != last {
                println!("[{}]", state.status);
                last = state.status;
            }
            if !state.accumulated_text.is_empty() {
                println!("  {}", state.accumulated_text);
            }
        }
    });

    let finished = session.start(&thread_id, &assistant_id).await?;
    drop(session);
    let _ = printer.await;

    println!("run ended as {}", finished.status);
    if let Some(error) = &finished.stream_error {
        println!("error: {error}");
    }
    for warning in &finished.warnings {
        println!("warning: {warning}");
    }
    Ok(())
}
