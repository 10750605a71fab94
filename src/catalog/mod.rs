pub mod introspect;

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use introspect::introspect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Scalar,
    Enum,
    Object,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    DateTime,
    String,
    Boolean,
    Int,
    Float,
    BigInt,
    Decimal,
    Json,
    Bytes,
    Enum,
    Unsupported,
    /// Target model of an object (relation) field.
    #[serde(untagged)]
    Model(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMetadata {
    pub name: String,
    pub kind: FieldKind,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Picker values: enum members, or preloaded foreign key targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub options_truncated: bool,
    pub is_list: bool,
    pub is_required: bool,
    pub is_unique: bool,
    pub is_id: bool,
    pub is_read_only: bool,
    pub has_default_value: bool,
    pub native_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub enum_name: Option<String>,
    pub relation_name: Option<String>,
    pub relation_from_fields: Vec<String>,
    pub relation_to_fields: Vec<String>,
    pub is_generated: bool,
    pub is_updated_at: bool,
}

impl FieldMetadata {
    pub fn is_object(&self) -> bool {
        self.kind == FieldKind::Object
    }

    /// Scalar text columns take part in list search.
    pub fn is_searchable(&self) -> bool {
        self.kind == FieldKind::Scalar && self.field_type == FieldType::String && !self.is_list
    }

    pub fn is_writable(&self) -> bool {
        !self.is_object() && !self.is_read_only && !self.is_generated_column()
    }

    /// Generated (computed) columns, as opposed to auto-assigned rowid keys.
    pub fn is_generated_column(&self) -> bool {
        self.is_generated && !self.is_id
    }

    pub fn target_model(&self) -> Option<&str> {
        match (&self.kind, &self.field_type) {
            (FieldKind::Object, FieldType::Model(name)) => Some(name.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub name: String,
    pub db_name: Option<String>,
    pub primary_key: Option<String>,
    pub unique_fields: Vec<String>,
    pub fields: Vec<FieldMetadata>,
}

impl ModelMetadata {
    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn scalar_fields(&self) -> impl Iterator<Item = &FieldMetadata> {
        self.fields.iter().filter(|field| !field.is_object())
    }

    pub fn object_fields(&self) -> impl Iterator<Item = &FieldMetadata> {
        self.fields.iter().filter(|field| field.is_object())
    }

    pub fn primary_key_field(&self) -> Option<&FieldMetadata> {
        self.primary_key.as_deref().and_then(|name| self.field(name))
    }

    pub fn require_primary_key(&self) -> AppResult<&FieldMetadata> {
        self.primary_key_field().ok_or_else(|| {
            AppError::Policy(format!(
                "Model {} has no single-column primary key and is read-only",
                self.name
            ))
        })
    }

    /// Column used for the default newest-first ordering.
    pub fn created_at_field(&self) -> Option<&FieldMetadata> {
        ["createdAt", "created_at"]
            .iter()
            .find_map(|name| self.field(name))
            .filter(|field| !field.is_object())
    }

    pub fn table_name(&self) -> &str {
        self.db_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumValue {
    pub name: String,
    pub db_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumMetadata {
    pub values: Vec<EnumValue>,
    pub db_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCatalog {
    pub models: BTreeMap<String, ModelMetadata>,
    pub enums: BTreeMap<String, EnumMetadata>,
}

impl ModelCatalog {
    /// Resolves a model name received from a client. Every dynamic query goes
    /// through here, so an unknown name never reaches SQL.
    pub fn model(&self, name: &str) -> AppResult<&ModelMetadata> {
        self.models
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("Invalid model: {}", name)))
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn enum_values(&self, enum_name: &str) -> Option<Vec<String>> {
        self.enums
            .get(enum_name)
            .map(|meta| meta.values.iter().map(|value| value.name.clone()).collect())
    }

    /// Non-relation fields with enum members filled into `options`.
    pub fn editable_fields(&self, model: &str) -> AppResult<Vec<FieldMetadata>> {
        let meta = self.model(model)?;
        Ok(meta
            .scalar_fields()
            .cloned()
            .map(|mut field| {
                if field.kind == FieldKind::Enum {
                    field.options = field
                        .enum_name
                        .as_deref()
                        .and_then(|enum_name| self.enum_values(enum_name))
                        .map(|values| values.into_iter().map(serde_json::Value::String).collect());
                }
                field
            })
            .collect())
    }

    /// Models holding a relation field that points at `model`.
    pub fn related_models(&self, model: &str) -> Vec<String> {
        self.models
            .values()
            .filter(|candidate| {
                candidate
                    .object_fields()
                    .any(|field| field.target_model() == Some(model))
            })
            .map(|candidate| candidate.name.clone())
            .collect()
    }
}
