//! Known forms and their fields.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::render::{FilledField, FilledForm};

/// One field of a form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    /// Used when the caller leaves the field out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required(key: &str, label: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            required: true,
            default: None,
        }
    }

    pub fn optional(key: &str, label: &str) -> Self {
        Self {
            required: false,
            ..Self::required(key, label)
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSchema {
    pub key: String,
    pub title: String,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid form catalog: {0}")]
    Parse(String),
    #[error("form key must not be empty")]
    EmptyKey,
    #[error("form `{0}` is defined twice")]
    DuplicateForm(String),
    #[error("form `{form}` defines field `{field}` twice")]
    DuplicateField { form: String, field: String },
}

/// Why form data could not be filled into a schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FillError {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
}

impl FormSchema {
    /// Merges caller data with field defaults, in schema order.
    ///
    /// Null and blank-string values count as absent. Keys the schema does not
    /// know are reported in [`FilledForm::ignored`] rather than rejected.
    pub fn fill(&self, data: &Map<String, Value>) -> Result<FilledForm, FillError> {
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut missing = Vec::new();
        for spec in &self.fields {
            let supplied = data.get(&spec.key).filter(|v| is_present(v));
            match (supplied, &spec.default) {
                (Some(value), _) => fields.push(FilledField {
                    key: spec.key.clone(),
                    label: spec.label.clone(),
                    value: value.clone(),
                    defaulted: false,
                }),
                (None, Some(default)) => fields.push(FilledField {
                    key: spec.key.clone(),
                    label: spec.label.clone(),
                    value: default.clone(),
                    defaulted: true,
                }),
                (None, None) if spec.required => missing.push(spec.key.clone()),
                (None, None) => {}
            }
        }
        if !missing.is_empty() {
            return Err(FillError::MissingRequired(missing));
        }
        let known: BTreeSet<&str> = self.fields.iter().map(|f| f.key.as_str()).collect();
        let ignored = data
            .keys()
            .filter(|k| !known.contains(k.as_str()))
            .cloned()
            .collect();
        Ok(FilledForm {
            form_key: self.key.clone(),
            title: self.title.clone(),
            fields,
            ignored,
        })
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// Form key -> schema.
#[derive(Clone, Debug, Default)]
pub struct FormCatalog {
    forms: BTreeMap<String, FormSchema>,
}

impl FormCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intake, consent and discharge forms for an outpatient behavioral
    /// health practice.
    pub fn builtin() -> Self {
        let forms = [
            FormSchema {
                key: "patient_intake".into(),
                title: "Patient Intake".into(),
                fields: vec![
                    FieldSpec::required("patientName", "Patient name"),
                    FieldSpec::required("dateOfBirth", "Date of birth"),
                    FieldSpec::optional("phone", "Phone"),
                    FieldSpec::optional("emergencyContact", "Emergency contact"),
                    FieldSpec::required("reasonForVisit", "Reason for visit"),
                    FieldSpec::optional("preferredLanguage", "Preferred language").with_default("English"),
                ],
            },
            FormSchema {
                key: "treatment_consent".into(),
                title: "Consent to Treatment".into(),
                fields: vec![
                    FieldSpec::required("patientName", "Patient name"),
                    FieldSpec::required("clinicianName", "Clinician"),
                    FieldSpec::required("treatmentType", "Treatment").with_default("Outpatient psychotherapy"),
                    FieldSpec::required("consentDate", "Date"),
                    FieldSpec::optional("guardianName", "Parent or guardian"),
                ],
            },
            FormSchema {
                key: "discharge_summary".into(),
                title: "Discharge Summary".into(),
                fields: vec![
                    FieldSpec::required("patientName", "Patient name"),
                    FieldSpec::required("admissionDate", "Admission date"),
                    FieldSpec::required("dischargeDate", "Discharge date"),
                    FieldSpec::required("diagnosis", "Diagnosis"),
                    FieldSpec::optional("medications", "Medications at discharge"),
                    FieldSpec::required("followUpPlan", "Follow-up plan")
                        .with_default("Follow up with primary clinician within 7 days"),
                ],
            },
        ];
        Self {
            forms: forms.into_iter().map(|f| (f.key.clone(), f)).collect(),
        }
    }

    /// Parses a JSON array of [`FormSchema`] objects.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let schemas: Vec<FormSchema> =
            serde_json::from_str(json).map_err(|e| CatalogError::Parse(e.to_string()))?;
        let mut catalog = Self::new();
        for schema in schemas {
            if catalog.forms.contains_key(&schema.key) {
                return Err(CatalogError::DuplicateForm(schema.key));
            }
            catalog.insert(schema)?;
        }
        Ok(catalog)
    }

    /// Adds or replaces a form.
    pub fn insert(&mut self, schema: FormSchema) -> Result<(), CatalogError> {
        if schema.key.trim().is_empty() {
            return Err(CatalogError::EmptyKey);
        }
        let mut seen = BTreeSet::new();
        for field in &schema.fields {
            if !seen.insert(field.key.as_str()) {
                return Err(CatalogError::DuplicateField {
                    form: schema.key.clone(),
                    field: field.key.clone(),
                });
            }
        }
        self.forms.insert(schema.key.clone(), schema);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&FormSchema> {
        self.forms.get(key)
    }

    /// Known form keys, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.forms.keys().map(String::as_str).collect()
    }
}
