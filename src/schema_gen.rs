use crate::catalog::{FieldKind, FieldMetadata, FieldType};
use crate::errors::{AppError, AppResult};
use jsonschema::error::ValidationErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};

const DATETIME_PATTERN: &str =
    r"^\d{4}-\d{2}-\d{2}([T ]\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?)?$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaMode {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldIssue {
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<FieldIssue>,
}

impl ValidationReport {
    pub fn into_result(self) -> AppResult<()> {
        if self.valid {
            return Ok(());
        }
        let summary = self
            .issues
            .iter()
            .map(|issue| match &issue.field {
                Some(field) => format!("{}: {}", field, issue.message),
                None => issue.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        Err(AppError::Validation(summary))
    }
}

/// Whether a field must be supplied when creating a record.
pub fn is_required_on_create(field: &FieldMetadata) -> bool {
    field.is_required
        && !field.has_default_value
        && !field.is_generated
        && !field.is_updated_at
        && !(field.is_id && field.field_type == FieldType::String)
}

fn accepts_field(field: &FieldMetadata, mode: SchemaMode) -> bool {
    field.is_writable() && !(mode == SchemaMode::Update && field.is_id)
}

fn base_schema(field: &FieldMetadata) -> Value {
    if field.kind == FieldKind::Enum {
        if let Some(options) = field.options.as_ref().filter(|options| !options.is_empty()) {
            return json!({ "enum": options });
        }
    }
    match field.field_type {
        FieldType::String | FieldType::BigInt | FieldType::Decimal | FieldType::Bytes | FieldType::Enum => {
            json!({ "type": "string" })
        }
        FieldType::Int => json!({ "type": "integer" }),
        FieldType::Float => json!({ "type": "number" }),
        FieldType::Boolean => json!({ "type": "boolean" }),
        FieldType::DateTime => json!({ "type": "string", "pattern": DATETIME_PATTERN }),
        FieldType::Json | FieldType::Unsupported | FieldType::Model(_) => json!({}),
    }
}

fn field_schema(field: &FieldMetadata) -> Value {
    let mut schema = base_schema(field);
    if field.is_list {
        let mut list = json!({ "type": "array", "items": schema });
        if field.is_required && field.field_type == FieldType::String {
            list["minItems"] = json!(1);
        }
        schema = list;
    }
    if !field.is_required {
        schema = json!({ "anyOf": [schema, { "type": "null" }] });
    }
    schema
}

/// Builds a JSON Schema for the writable fields of a model.
pub fn generate_schema(fields: &[FieldMetadata], mode: SchemaMode) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for field in fields.iter().filter(|field| accepts_field(field, mode)) {
        properties.insert(field.name.clone(), field_schema(field));
        if mode == SchemaMode::Create && is_required_on_create(field) {
            required.push(Value::String(field.name.clone()));
        }
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Coerces HTML-form style input (strings everywhere) into typed JSON values.
pub fn normalize_input(fields: &[FieldMetadata], payload: &Value) -> AppResult<Map<String, Value>> {
    let Some(object) = payload.as_object() else {
        return Err(AppError::Validation("Record data must be a JSON object".to_string()));
    };

    let mut normalized = Map::with_capacity(object.len());
    for (key, value) in object {
        let coerced = match fields.iter().find(|field| &field.name == key) {
            Some(field) => coerce_field_value(field, value.clone()),
            None => value.clone(),
        };
        normalized.insert(key.clone(), coerced);
    }
    Ok(normalized)
}

fn coerce_field_value(field: &FieldMetadata, value: Value) -> Value {
    if field.is_list {
        return match value {
            Value::String(raw) if raw.trim().is_empty() && !field.is_required => Value::Null,
            Value::String(raw) if !raw.trim_start().starts_with('[') => Value::Array(
                raw.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| coerce_scalar(field, Value::String(item.to_string())))
                    .collect(),
            ),
            Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            Value::Array(items) => Value::Array(items.into_iter().map(|item| coerce_scalar(field, item)).collect()),
            other => other,
        };
    }

    if let Value::String(raw) = &value {
        if raw.trim().is_empty() && !field.is_required {
            return Value::Null;
        }
    }
    coerce_scalar(field, value)
}

fn coerce_scalar(field: &FieldMetadata, value: Value) -> Value {
    match (&field.field_type, value) {
        (FieldType::Int, Value::String(raw)) => match raw.trim().parse::<i64>() {
            Ok(parsed) => Value::Number(parsed.into()),
            Err(_) => Value::String(raw),
        },
        (FieldType::Float, Value::String(raw)) => match raw.trim().parse::<f64>().ok().and_then(Number::from_f64) {
            Some(parsed) => Value::Number(parsed),
            None => Value::String(raw),
        },
        (FieldType::Boolean, Value::String(raw)) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "1" | "yes" => Value::Bool(true),
            "false" | "off" | "0" | "no" => Value::Bool(false),
            _ => Value::String(raw),
        },
        (FieldType::Boolean, Value::Number(number)) => match number.as_i64() {
            Some(0) => Value::Bool(false),
            Some(1) => Value::Bool(true),
            _ => Value::Number(number),
        },
        (FieldType::BigInt | FieldType::Decimal, Value::Number(number)) => Value::String(number.to_string()),
        (FieldType::Json, Value::String(raw)) => {
            let trimmed = raw.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(&raw).unwrap_or(Value::String(raw))
            } else {
                Value::String(raw)
            }
        }
        (_, other) => other,
    }
}

/// Validates an already normalized payload against the model's generated schema.
pub fn validate_payload(fields: &[FieldMetadata], payload: &Map<String, Value>, mode: SchemaMode) -> AppResult<ValidationReport> {
    let schema = generate_schema(fields, mode);
    let compiled = jsonschema::JSONSchema::compile(&schema)
        .map_err(|error| AppError::Internal(format!("Failed to compile validation schema: {}", error)))?;

    let instance = Value::Object(payload.clone());
    let issues: Vec<FieldIssue> = match compiled.validate(&instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|error| {
                let field = match &error.kind {
                    ValidationErrorKind::Required { property } => property.as_str().map(ToString::to_string),
                    ValidationErrorKind::AdditionalProperties { unexpected } => unexpected.first().cloned(),
                    _ => error
                        .instance_path
                        .to_string()
                        .trim_start_matches('/')
                        .split('/')
                        .next()
                        .filter(|segment| !segment.is_empty())
                        .map(ToString::to_string),
                };
                FieldIssue {
                    field,
                    message: describe_issue(&error.kind, error.to_string()),
                }
            })
            .collect(),
    };

    Ok(ValidationReport {
        valid: issues.is_empty(),
        issues,
    })
}

fn describe_issue(kind: &ValidationErrorKind, fallback: String) -> String {
    match kind {
        ValidationErrorKind::MinItems { .. } => "At least one value is required".to_string(),
        ValidationErrorKind::Pattern { .. } => "Invalid datetime format".to_string(),
        ValidationErrorKind::AdditionalProperties { .. } => "Unknown or read-only field".to_string(),
        _ => fallback,
    }
}

/// Normalizes and validates in one step; returns the clean payload.
pub fn prepare_payload(fields: &[FieldMetadata], payload: &Value, mode: SchemaMode) -> AppResult<Map<String, Value>> {
    let normalized = normalize_input(fields, payload)?;
    validate_payload(fields, &normalized, mode)?.into_result()?;
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::{generate_schema, normalize_input, prepare_payload, validate_payload, SchemaMode};
    use crate::catalog::{introspect, FieldMetadata};
    use rusqlite::Connection;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn post_fields() -> Vec<FieldMetadata> {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE Post (
               id TEXT PRIMARY KEY,
               title TEXT NOT NULL,
               views INTEGER NOT NULL DEFAULT 0,
               score REAL,
               published BOOLEAN NOT NULL,
               status TEXT NOT NULL CHECK (status IN ('draft', 'live')),
               tags TEXT LIST NOT NULL,
               publishedAt DATETIME,
               meta JSON,
               updatedAt DATETIME NOT NULL
             );",
        )
        .expect("schema");
        let catalog = introspect(&conn, &BTreeMap::new()).expect("catalog");
        catalog.editable_fields("Post").expect("fields")
    }

    #[test]
    fn create_schema_requires_fields_without_defaults() {
        let schema = generate_schema(&post_fields(), SchemaMode::Create);
        let required: Vec<&str> = schema["required"]
            .as_array()
            .expect("required")
            .iter()
            .filter_map(|value| value.as_str())
            .collect();
        assert_eq!(required, vec!["title", "published", "status", "tags"]);
        assert_eq!(schema["additionalProperties"], json!(false));
        assert_eq!(schema["properties"]["status"]["enum"], json!(["draft", "live"]));
        assert_eq!(schema["properties"]["tags"]["minItems"], json!(1));
    }

    #[test]
    fn update_schema_requires_nothing_and_drops_primary_key() {
        let schema = generate_schema(&post_fields(), SchemaMode::Update);
        assert!(schema["required"].as_array().expect("required").is_empty());
        assert!(schema["properties"].get("id").is_none());
    }

    #[test]
    fn form_strings_are_coerced_by_field_type() {
        let normalized = normalize_input(
            &post_fields(),
            &json!({
                "views": "42",
                "score": "",
                "published": "on",
                "tags": "a, b,,c",
                "meta": "{\"k\":1}",
                "title": "Hello"
            }),
        )
        .expect("normalize");
        assert_eq!(normalized["views"], json!(42));
        assert_eq!(normalized["score"], json!(null));
        assert_eq!(normalized["published"], json!(true));
        assert_eq!(normalized["tags"], json!(["a", "b", "c"]));
        assert_eq!(normalized["meta"], json!({"k": 1}));
        assert_eq!(normalized["title"], json!("Hello"));
    }

    #[test]
    fn valid_create_payload_passes() {
        let payload = prepare_payload(
            &post_fields(),
            &json!({
                "title": "Hello",
                "published": false,
                "status": "draft",
                "tags": ["x"],
                "publishedAt": "2024-05-01T10:30"
            }),
            SchemaMode::Create,
        )
        .expect("valid");
        assert_eq!(payload["status"], json!("draft"));
    }

    #[test]
    fn invalid_payload_reports_each_field() {
        let fields = post_fields();
        let normalized = normalize_input(
            &fields,
            &json!({
                "title": "Hello",
                "published": "maybe",
                "status": "archived",
                "tags": [],
                "publishedAt": "yesterday",
                "ghost": 1
            }),
        )
        .expect("normalize");
        let report = validate_payload(&fields, &normalized, SchemaMode::Create).expect("report");
        assert!(!report.valid);
        let fields_with_issues: Vec<String> = report.issues.iter().filter_map(|issue| issue.field.clone()).collect();
        for expected in ["published", "status", "tags", "publishedAt", "ghost"] {
            assert!(
                fields_with_issues.iter().any(|field| field == expected),
                "missing issue for {}: {:?}",
                expected,
                report.issues
            );
        }
        let tags_issue = report
            .issues
            .iter()
            .find(|issue| issue.field.as_deref() == Some("tags"))
            .expect("tags issue");
        assert_eq!(tags_issue.message, "At least one value is required");
    }

    #[test]
    fn missing_required_field_is_named() {
        let error = prepare_payload(&post_fields(), &json!({ "title": "x" }), SchemaMode::Create)
            .expect_err("missing fields");
        let message = error.to_string();
        assert!(message.starts_with("VALIDATION_FAILED"));
        assert!(message.contains("published"));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert!(normalize_input(&post_fields(), &json!(["title"])).is_err());
    }
}
