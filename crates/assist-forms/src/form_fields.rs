//! `GetFormFields`: lets the assistant look up what a form needs before it
//! asks for one to be generated.

use std::sync::Arc;

use assist_stream::{ToolError, ToolHandler};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::catalog::FormCatalog;

pub const GET_FORM_FIELDS: &str = "GetFormFields";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupArgs {
    form_key: Option<String>,
    /// Older assistants send the key under this name.
    form_type: Option<String>,
}

pub struct GetFormFieldsTool {
    catalog: Arc<FormCatalog>,
}

impl GetFormFieldsTool {
    pub fn new(catalog: Arc<FormCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait::async_trait]
impl ToolHandler for GetFormFieldsTool {
    fn name(&self) -> &str {
        GET_FORM_FIELDS
    }

    async fn call(&self, raw_arguments: &str) -> Result<String, ToolError> {
        let args: LookupArgs = serde_json::from_str(raw_arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let key = args
            .form_key
            .or(args.form_type)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("formKey is required".into()))?;
        let schema = self.catalog.get(&key).ok_or_else(|| {
            ToolError::InvalidArguments(format!(
                "unknown form `{key}`; known forms: {}",
                self.catalog.list().join(", ")
            ))
        })?;
        debug!(event = "forms.fields_listed", domain = "tool", form_key = %key);
        Ok(json!({
            "formKey": schema.key,
            "title": schema.title,
            "fields": schema.fields,
        })
        .to_string())
    }
}
