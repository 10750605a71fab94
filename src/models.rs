use crate::catalog::FieldMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanResponse {
    pub success: bool,
}

// ─── Records ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRecordsRequest {
    pub page: Option<i64>,
    pub take: Option<i64>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total_count: i64,
    pub page: i64,
    pub take: i64,
    pub total_pages: i64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
}

impl Pagination {
    pub fn new(total_count: i64, page: i64, take: i64) -> Self {
        let total_pages = if take > 0 {
            (total_count + take - 1) / take
        } else {
            0
        };
        Self {
            total_count,
            page,
            take,
            total_pages,
            has_next_page: page < total_pages,
            has_prev_page: page > 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelView {
    pub model_name: String,
    pub primary_key: Option<String>,
    pub records: Vec<Record>,
    pub model_fields: Vec<FieldMetadata>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationDirection {
    Parent,
    Children,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedModelLink {
    pub name: String,
    pub fields: Vec<String>,
    pub id: Value,
    pub direction: RelationDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDetail {
    pub item: Record,
    pub model_name: String,
    pub model_fields: Vec<FieldMetadata>,
    pub related_models: Vec<RelatedModelLink>,
}

/// Form actions posted from the model list and detail screens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "kebab-case")]
pub enum RecordAction {
    Create { data: Value },
    Update { id: Value, data: Value },
    DeleteSingle { id: Value },
    DeleteBulk { ids: Vec<Value> },
    ExportCsv { search: Option<String> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordActionResponse {
    pub success: bool,
    pub message: Option<String>,
    pub data: Option<Record>,
    pub deleted_count: Option<usize>,
    pub export: Option<ExportResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    pub path: String,
    pub row_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsRequest {
    pub model_name: String,
    pub model_field: String,
    #[serde(default)]
    pub search: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsResponse {
    pub options: Vec<Value>,
    pub model_field: String,
    pub model_name: String,
}

// ─── Query console ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConsoleResponse {
    pub success: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
    pub truncated: bool,
    pub error: Option<String>,
}

// ─── Allowed users ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSet {
    pub create: bool,
    pub read: bool,
    pub update: bool,
    pub delete: bool,
}

impl PermissionSet {
    pub fn allows(&self, action: ModelAction) -> bool {
        match action {
            ModelAction::Create => self.create,
            ModelAction::Read => self.read,
            ModelAction::Update => self.update,
            ModelAction::Delete => self.delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelAction {
    Create,
    Read,
    Update,
    Delete,
}

impl ModelAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPermissionRecord {
    pub id: String,
    pub allowed_user_id: String,
    pub model: String,
    pub can_create: bool,
    pub can_read: bool,
    pub can_update: bool,
    pub can_delete: bool,
}

impl ModelPermissionRecord {
    pub fn as_set(&self) -> PermissionSet {
        PermissionSet {
            create: self.can_create,
            read: self.can_read,
            update: self.can_update,
            delete: self.can_delete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySummary {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedUserRecord {
    pub id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub permissions: Vec<ModelPermissionRecord>,
    pub identity: Option<IdentitySummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "kebab-case")]
pub enum UserAction {
    Create {
        email: String,
        #[serde(default)]
        permissions: BTreeMap<String, PermissionSet>,
    },
    Update {
        id: String,
        email: String,
        #[serde(default)]
        permissions: BTreeMap<String, PermissionSet>,
    },
    DeleteSingle {
        id: String,
    },
    DeleteBulk {
        ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActionResponse {
    pub success: bool,
    pub message: String,
    pub data: Option<AllowedUserRecord>,
    pub deleted_count: Option<usize>,
}

// ─── Auth ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginPayload {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub is_root_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: SessionUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationState {
    pub is_super_admin_registration: bool,
}

// ─── Dashboards ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WidgetKind {
    Chart,
    Stats,
    List,
}

impl WidgetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chart => "chart",
            Self::Stats => "stats",
            Self::List => "list",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "chart" => Some(Self::Chart),
            "stats" => Some(Self::Stats),
            "list" => Some(Self::List),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardWidget {
    pub id: String,
    pub dashboard_id: String,
    pub title: String,
    pub kind: WidgetKind,
    pub position: i32,
    pub grid_x: i32,
    pub grid_y: i32,
    pub grid_w: i32,
    pub grid_h: i32,
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardDetail {
    pub dashboard: DashboardRecord,
    pub widgets: Vec<DashboardWidget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddWidgetPayload {
    pub dashboard_id: String,
    pub title: String,
    pub kind: WidgetKind,
    pub config: Option<Value>,
    pub grid_x: Option<i32>,
    pub grid_y: Option<i32>,
    pub grid_w: Option<i32>,
    pub grid_h: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetLayoutItem {
    pub widget_id: String,
    pub grid_x: i32,
    pub grid_y: i32,
    pub grid_w: i32,
    pub grid_h: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDashboardLayoutPayload {
    pub dashboard_id: String,
    pub layouts: Vec<WidgetLayoutItem>,
}

// ─── Settings & landing ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub theme: String,
    pub default_take: Option<u32>,
    pub nav_order: Option<Vec<String>>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            theme: "system".to_string(),
            default_take: None,
            nav_order: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub models_count: usize,
    pub allowed_users_count: i64,
    pub dashboards_count: i64,
}
