//! Built-in form tools for assistant runs. Use with [`default_registry`] or
//! [`register_form_tools`].

mod catalog;
mod form_fields;
mod generate_pdf;
mod render;

use std::sync::Arc;

pub use catalog::{CatalogError, FieldSpec, FillError, FormCatalog, FormSchema};
pub use form_fields::{GET_FORM_FIELDS, GetFormFieldsTool};
pub use generate_pdf::{GENERATE_PDF_FORM, GeneratePdfFormTool};
pub use render::{
    DirectorySink, DocumentSink, FilledField, FilledForm, MemorySink, PdfRenderer, RenderError,
    TemplatePreviewRenderer,
};

pub use assist_stream::ToolRegistry;

/// Registers `GeneratePDFForm` and `GetFormFields` against one catalog.
pub fn register_form_tools(
    registry: &mut ToolRegistry,
    catalog: Arc<FormCatalog>,
    renderer: Arc<dyn PdfRenderer>,
    sink: Arc<dyn DocumentSink>,
) {
    registry.register(Arc::new(GeneratePdfFormTool::new(
        catalog.clone(),
        renderer,
        sink,
    )));
    registry.register(Arc::new(GetFormFieldsTool::new(catalog)));
}

/// Registry with both form tools over [`FormCatalog::builtin`].
pub fn default_registry(renderer: Arc<dyn PdfRenderer>, sink: Arc<dyn DocumentSink>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    register_form_tools(&mut registry, Arc::new(FormCatalog::builtin()), renderer, sink);
    registry
}
