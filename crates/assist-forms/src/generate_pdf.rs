//! `GeneratePDFForm`: fills a catalog form from the assistant's arguments,
//! renders it through the injected [`PdfRenderer`] and stores the result.

use std::sync::Arc;

use assist_stream::{ToolError, ToolHandler};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::FormCatalog;
use crate::render::{DocumentSink, PdfRenderer};

pub const GENERATE_PDF_FORM: &str = "GeneratePDFForm";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateArgs {
    form_key: String,
    #[serde(default)]
    form_data: Value,
}

pub struct GeneratePdfFormTool {
    catalog: Arc<FormCatalog>,
    renderer: Arc<dyn PdfRenderer>,
    sink: Arc<dyn DocumentSink>,
}

impl GeneratePdfFormTool {
    pub fn new(
        catalog: Arc<FormCatalog>,
        renderer: Arc<dyn PdfRenderer>,
        sink: Arc<dyn DocumentSink>,
    ) -> Self {
        Self {
            catalog,
            renderer,
            sink,
        }
    }
}

/// `formData` arrives either as an object or as a JSON-encoded object string.
fn form_data_object(value: Value) -> Result<Map<String, Value>, ToolError> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::String(raw) if raw.trim().is_empty() => Ok(Map::new()),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ToolError::InvalidArguments(
                "formData must be a JSON object".into(),
            )),
            Err(e) => Err(ToolError::InvalidArguments(format!(
                "formData is not valid JSON: {e}"
            ))),
        },
        _ => Err(ToolError::InvalidArguments(
            "formData must be a JSON object".into(),
        )),
    }
}

/// `{form}_{timestamp}_{random}.{ext}`; the random part keeps documents
/// generated within the same second apart.
fn document_name(form_key: &str, extension: &str) -> String {
    format!(
        "{}_{}_{}.{}",
        form_key,
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        Uuid::new_v4().simple(),
        extension
    )
}

#[async_trait::async_trait]
impl ToolHandler for GeneratePdfFormTool {
    fn name(&self) -> &str {
        GENERATE_PDF_FORM
    }

    async fn call(&self, raw_arguments: &str) -> Result<String, ToolError> {
        let args: GenerateArgs = serde_json::from_str(raw_arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let schema = self.catalog.get(&args.form_key).ok_or_else(|| {
            ToolError::InvalidArguments(format!(
                "unknown form `{}`; known forms: {}",
                args.form_key,
                self.catalog.list().join(", ")
            ))
        })?;
        let data = form_data_object(args.form_data)?;
        let filled = schema
            .fill(&data)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        if !filled.ignored.is_empty() {
            warn!(
                event = "forms.fields_ignored",
                domain = "tool",
                form_key = %filled.form_key,
                ignored = ?filled.ignored,
                "form data contains fields the form does not define"
            );
        }

        let bytes = self
            .renderer
            .render(&filled)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let file_name = document_name(&filled.form_key, self.renderer.extension());
        let location = self
            .sink
            .store(&file_name, &bytes)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        info!(
            event = "forms.generated",
            domain = "tool",
            form_key = %filled.form_key,
            file_name = %file_name,
            byte_size = bytes.len(),
            "form generated"
        );
        Ok(json!({
            "status": "generated",
            "formKey": filled.form_key,
            "fileName": file_name,
            "location": location,
            "byteSize": bytes.len(),
            "filledFields": filled.filled(),
            "defaultedFields": filled.defaulted(),
            "ignoredFields": filled.ignored,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{DirectorySink, FilledForm, MemorySink, RenderError, TemplatePreviewRenderer};

    struct BrokenRenderer;

    #[async_trait::async_trait]
    impl PdfRenderer for BrokenRenderer {
        async fn render(&self, _form: &FilledForm) -> Result<Vec<u8>, RenderError> {
            Err(RenderError::Render("engine offline".into()))
        }
    }

    fn tool(renderer: Arc<dyn PdfRenderer>, sink: Arc<MemorySink>) -> GeneratePdfFormTool {
        GeneratePdfFormTool::new(Arc::new(FormCatalog::builtin()), renderer, sink)
    }

    #[tokio::test]
    async fn generates_and_stores_document() {
        let sink = Arc::new(MemorySink::new());
        let tool = tool(Arc::new(TemplatePreviewRenderer::new()), sink.clone());
        let out = tool
            .call(
                r#"{"formKey":"patient_intake","formData":{"patientName":"Dana Reyes","dateOfBirth":"1990-04-02","reasonForVisit":"Anxiety","shoeSize":9}}"#,
            )
            .await
            .expect("generated");

        let ack: Value = serde_json::from_str(&out).expect("json");
        assert_eq!(ack["status"], "generated");
        assert_eq!(ack["formKey"], "patient_intake");
        assert_eq!(ack["defaultedFields"], json!(["preferredLanguage"]));
        assert_eq!(
            ack["filledFields"],
            json!(["patientName", "dateOfBirth", "reasonForVisit"])
        );
        assert_eq!(ack["ignoredFields"], json!(["shoeSize"]));

        let docs = sink.documents();
        assert_eq!(docs.len(), 1);
        let (name, bytes) = &docs[0];
        assert!(name.starts_with("patient_intake_") && name.ends_with(".txt"), "{name}");
        assert_eq!(ack["fileName"], name.as_str());
        assert_eq!(ack["byteSize"], bytes.len());
        assert_eq!(ack["location"], format!("memory://{name}"));
    }

    struct FixedPdfRenderer;

    #[async_trait::async_trait]
    impl PdfRenderer for FixedPdfRenderer {
        async fn render(&self, _form: &FilledForm) -> Result<Vec<u8>, RenderError> {
            Ok(b"%PDF-1.7".to_vec())
        }
    }

    #[tokio::test]
    async fn same_form_twice_writes_two_documents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = GeneratePdfFormTool::new(
            Arc::new(FormCatalog::builtin()),
            Arc::new(TemplatePreviewRenderer::new()),
            Arc::new(DirectorySink::new(dir.path())),
        );
        let consent = |patient: &str| {
            json!({
                "formKey": "treatment_consent",
                "formData": {"patientName": patient, "clinicianName": "Dr. Okafor", "consentDate": "2024-05-01"}
            })
            .to_string()
        };

        let first: Value = serde_json::from_str(&tool.call(&consent("Alice")).await.expect("alice"))
            .expect("json");
        let second: Value = serde_json::from_str(&tool.call(&consent("Bob")).await.expect("bob"))
            .expect("json");
        assert_ne!(first["location"], second["location"]);

        let written = std::fs::read_dir(dir.path()).expect("read_dir").count();
        assert_eq!(written, 2);
        let alice = std::fs::read_to_string(first["location"].as_str().expect("location"))
            .expect("alice document");
        assert!(alice.contains("Alice"), "{alice}");
    }

    #[tokio::test]
    async fn file_name_uses_renderer_extension() {
        let sink = Arc::new(MemorySink::new());
        let tool = tool(Arc::new(FixedPdfRenderer), sink.clone());
        let out = tool
            .call(r#"{"formKey":"treatment_consent","formData":{"patientName":"Dana","clinicianName":"Dr. Okafor","consentDate":"2024-05-01"}}"#)
            .await
            .expect("generated");
        let ack: Value = serde_json::from_str(&out).expect("json");
        let name = ack["fileName"].as_str().expect("fileName");
        assert!(name.starts_with("treatment_consent_") && name.ends_with(".pdf"), "{name}");
        assert_eq!(sink.documents()[0].1, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn accepts_form_data_as_json_string() {
        let sink = Arc::new(MemorySink::new());
        let tool = tool(Arc::new(TemplatePreviewRenderer::new()), sink.clone());
        let args = json!({
            "formKey": "treatment_consent",
            "formData": r#"{"patientName":"Dana","clinicianName":"Dr. Okafor","consentDate":"2024-05-01"}"#
        });
        tool.call(&args.to_string()).await.expect("generated");
        assert_eq!(sink.documents().len(), 1);
    }

    #[tokio::test]
    async fn unknown_form_lists_known_keys() {
        let sink = Arc::new(MemorySink::new());
        let tool = tool(Arc::new(TemplatePreviewRenderer::new()), sink.clone());
        let err = tool
            .call(r#"{"formKey":"x","formData":{}}"#)
            .await
            .expect_err("unknown form");
        assert_eq!(err.kind(), "InvalidArguments");
        assert!(err.message().contains("unknown form `x`"), "{err}");
        assert!(err.message().contains("patient_intake"), "{err}");
        assert!(sink.documents().is_empty());
    }

    #[tokio::test]
    async fn missing_required_fields_are_rejected() {
        let sink = Arc::new(MemorySink::new());
        let tool = tool(Arc::new(TemplatePreviewRenderer::new()), sink.clone());
        let err = tool
            .call(r#"{"formKey":"patient_intake","formData":{"patientName":"Dana"}}"#)
            .await
            .expect_err("missing");
        assert_eq!(
            err,
            ToolError::InvalidArguments(
                "missing required fields: dateOfBirth, reasonForVisit".into()
            )
        );
        assert!(sink.documents().is_empty());
    }

    #[tokio::test]
    async fn malformed_arguments_are_invalid() {
        let sink = Arc::new(MemorySink::new());
        let tool = tool(Arc::new(TemplatePreviewRenderer::new()), sink);
        for raw in ["not json", r#"{"formData":{}}"#, r#"{"formKey":"patient_intake","formData":[1]}"#] {
            let err = tool.call(raw).await.expect_err(raw);
            assert_eq!(err.kind(), "InvalidArguments", "{raw}");
        }
    }

    #[tokio::test]
    async fn renderer_failure_is_execution_failure() {
        let sink = Arc::new(MemorySink::new());
        let tool = tool(Arc::new(BrokenRenderer), sink.clone());
        let err = tool
            .call(r#"{"formKey":"treatment_consent","formData":{"patientName":"Dana","clinicianName":"Dr. Okafor","consentDate":"2024-05-01"}}"#)
            .await
            .expect_err("render failure");
        assert_eq!(
            err,
            ToolError::ExecutionFailed("render failed: engine offline".into())
        );
        assert!(sink.documents().is_empty());
    }
}
