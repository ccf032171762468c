//! Rendering seam and document storage.
//!
//! Producing the actual PDF is delegated to a [`PdfRenderer`]; the finished
//! bytes go to a [`DocumentSink`]. Both are injected when the form tools are
//! registered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

/// A form with every value resolved, in schema order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilledForm {
    pub form_key: String,
    pub title: String,
    pub fields: Vec<FilledField>,
    /// Keys supplied by the caller that the form does not define.
    pub ignored: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilledField {
    pub key: String,
    pub label: String,
    pub value: Value,
    /// `true` when the value came from the schema default.
    pub defaulted: bool,
}

impl FilledForm {
    pub fn filled(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| !f.defaulted)
            .map(|f| f.key.as_str())
            .collect()
    }

    pub fn defaulted(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.defaulted)
            .map(|f| f.key.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("render failed: {0}")]
    Render(String),
    #[error("storing document failed: {0}")]
    Store(String),
}

/// Turns a filled form into document bytes.
#[async_trait::async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, form: &FilledForm) -> Result<Vec<u8>, RenderError>;

    /// File extension of the produced documents, without the dot.
    fn extension(&self) -> &str {
        "pdf"
    }
}

/// Destination for rendered documents. Returns where the document ended up.
pub trait DocumentSink: Send + Sync {
    fn store(&self, file_name: &str, bytes: &[u8]) -> Result<String, RenderError>;
}

/// Writes documents into a directory, creating it when needed.
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DocumentSink for DirectorySink {
    fn store(&self, file_name: &str, bytes: &[u8]) -> Result<String, RenderError> {
        let name = Path::new(file_name)
            .file_name()
            .ok_or_else(|| RenderError::Store(format!("invalid file name `{file_name}`")))?;
        std::fs::create_dir_all(&self.root)
            .map_err(|e| RenderError::Store(format!("create_dir_all {}: {e}", self.root.display())))?;
        let path = self.root.join(name);
        std::fs::write(&path, bytes).map_err(|e| RenderError::Store(format!("{}: {e}", path.display())))?;
        Ok(path.display().to_string())
    }
}

/// Keeps documents in memory, in arrival order.
#[derive(Default)]
pub struct MemorySink {
    documents: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> Vec<(String, Vec<u8>)> {
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl DocumentSink for MemorySink {
    fn store(&self, file_name: &str, bytes: &[u8]) -> Result<String, RenderError> {
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((file_name.to_string(), bytes.to_vec()));
        Ok(format!("memory://{file_name}"))
    }
}

const PREVIEW_TEMPLATE: &str = "{{title}}\n\n{{#each fields}}{{label}}: {{value}}\n{{/each}}";

/// Plain-text preview built from handlebars templates, for environments
/// without a PDF engine. Forms without their own template use a generic
/// `label: value` layout.
pub struct TemplatePreviewRenderer {
    templates: HashMap<String, String>,
}

impl Default for TemplatePreviewRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplatePreviewRenderer {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Template for one form. Sees `title`, `formKey` and `fields` (each with
    /// `key`, `label`, `value`, `defaulted`).
    pub fn with_template(mut self, form_key: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates.insert(form_key.into(), template.into());
        self
    }

    fn render_text(&self, form: &FilledForm) -> Result<String, RenderError> {
        let template = self
            .templates
            .get(&form.form_key)
            .map(String::as_str)
            .unwrap_or(PREVIEW_TEMPLATE);
        let mut reg = handlebars::Handlebars::new();
        reg.register_escape_fn(handlebars::no_escape);
        let data = serde_json::to_value(form).map_err(|e| RenderError::Render(e.to_string()))?;
        reg.render_template(template, &data)
            .map_err(|e| RenderError::Render(e.to_string()))
    }
}

#[async_trait::async_trait]
impl PdfRenderer for TemplatePreviewRenderer {
    async fn render(&self, form: &FilledForm) -> Result<Vec<u8>, RenderError> {
        self.render_text(form).map(String::into_bytes)
    }

    fn extension(&self) -> &str {
        "txt"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form() -> FilledForm {
        FilledForm {
            form_key: "patient_intake".into(),
            title: "Patient Intake".into(),
            fields: vec![
                FilledField {
                    key: "patientName".into(),
                    label: "Patient name".into(),
                    value: json!("Dana <Reyes>"),
                    defaulted: false,
                },
                FilledField {
                    key: "preferredLanguage".into(),
                    label: "Preferred language".into(),
                    value: json!("English"),
                    defaulted: true,
                },
            ],
            ignored: Vec::new(),
        }
    }

    #[tokio::test]
    async fn preview_uses_generic_layout_without_escaping() {
        let bytes = TemplatePreviewRenderer::new().render(&form()).await.expect("render");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.starts_with("Patient Intake\n"), "{text}");
        assert!(text.contains("Patient name: Dana <Reyes>\n"), "{text}");
        assert!(text.contains("Preferred language: English"), "{text}");
    }

    #[test]
    fn preview_documents_are_plain_text() {
        assert_eq!(TemplatePreviewRenderer::new().extension(), "txt");
    }

    #[tokio::test]
    async fn per_form_template_wins() {
        let renderer = TemplatePreviewRenderer::new()
            .with_template("patient_intake", "{{formKey}}:{{#each fields}}{{#if defaulted}}*{{/if}}{{key}} {{/each}}");
        let bytes = renderer.render(&form()).await.expect("render");
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            "patient_intake:patientName *preferredLanguage "
        );
    }

    #[test]
    fn filled_and_defaulted_partition_fields() {
        let form = form();
        assert_eq!(form.filled(), vec!["patientName"]);
        assert_eq!(form.defaulted(), vec!["preferredLanguage"]);
    }

    #[test]
    fn directory_sink_writes_file_and_strips_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = DirectorySink::new(dir.path().join("forms"));
        let location = sink.store("../escape.pdf", b"%PDF").expect("stored");
        let written = dir.path().join("forms").join("escape.pdf");
        assert_eq!(location, written.display().to_string());
        assert_eq!(std::fs::read(&written).expect("read"), b"%PDF");
    }

    #[test]
    fn memory_sink_keeps_documents() {
        let sink = MemorySink::new();
        assert_eq!(sink.store("a.pdf", b"1"), Ok("memory://a.pdf".to_string()));
        assert_eq!(sink.documents(), vec![("a.pdf".to_string(), b"1".to_vec())]);
    }
}
