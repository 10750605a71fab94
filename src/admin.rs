use crate::auth::{self, Principal};
use crate::catalog::ModelCatalog;
use crate::config::AdminConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AddWidgetPayload, AllowedUserRecord, AppSettings, BooleanResponse, DashboardDetail, DashboardRecord,
    DashboardWidget, ListRecordsRequest, LoginPayload, ModelAction, ModelView, OptionsRequest, OptionsResponse,
    Overview, QueryConsoleResponse, RecordAction, RecordActionResponse, RecordDetail, RegisterPayload,
    RegistrationState, SessionResponse, SessionUser, UpdateDashboardLayoutPayload, UserAction, UserActionResponse,
};
use crate::schema_gen::{self, SchemaMode, ValidationReport};
use crate::target::TargetDatabase;
use crate::{console, dashboards, options, records, users, views};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Entry point for every console operation. Each call takes the caller's
/// session token and checks access before touching either database.
#[derive(Clone)]
pub struct AdminCore {
    db: Arc<Database>,
    target: Arc<TargetDatabase>,
    config: Arc<AdminConfig>,
    data_dir: PathBuf,
}

impl AdminCore {
    pub fn new(data_dir: PathBuf, config: AdminConfig) -> AppResult<Self> {
        std::fs::create_dir_all(&data_dir)?;
        let db = Database::new(&config.admin_database_path(&data_dir))?;
        let target = TargetDatabase::open(&config.target_database_path(&data_dir), config.enum_overrides())?;
        let catalog = target.catalog()?;
        tracing::info!(
            target = %target.path().display(),
            admin = %db.path().display(),
            models = catalog.models.len(),
            "admin console ready"
        );

        Ok(Self {
            db: Arc::new(db),
            target: Arc::new(target),
            config: Arc::new(config),
            data_dir,
        })
    }

    pub fn target(&self) -> &TargetDatabase {
        &self.target
    }

    fn principal(&self, token: &str) -> AppResult<Principal> {
        auth::resolve_principal(&self.db, token)
    }

    fn authorized_catalog(&self, token: &str, model: &str, action: ModelAction) -> AppResult<Arc<ModelCatalog>> {
        let principal = self.principal(token)?;
        principal.authorize(model, action)?;
        let catalog = self.target.catalog()?;
        catalog.model(model)?;
        Ok(catalog)
    }

    fn default_take(&self) -> AppResult<Option<u32>> {
        Ok(self.db.get_settings()?.default_take)
    }

    // ─── Auth ───────────────────────────────────────────────────────────────

    pub fn registration_state(&self) -> AppResult<RegistrationState> {
        auth::registration_state(&self.db)
    }

    pub fn register(&self, payload: RegisterPayload) -> AppResult<SessionResponse> {
        auth::register(&self.db, &payload, &self.config.session)
    }

    pub fn login(&self, payload: LoginPayload) -> AppResult<SessionResponse> {
        auth::login(&self.db, &payload, &self.config.session)
    }

    pub fn logout(&self, token: &str) -> AppResult<BooleanResponse> {
        Ok(BooleanResponse {
            success: auth::logout(&self.db, token)?,
        })
    }

    pub fn session(&self, token: &str) -> AppResult<SessionUser> {
        Ok(self.principal(token)?.user().clone())
    }

    // ─── Models & records ───────────────────────────────────────────────────

    pub fn list_models(&self, token: &str) -> AppResult<Vec<String>> {
        let principal = self.principal(token)?;
        let catalog = self.target.catalog()?;
        let mut models = principal.visible_models(&catalog);

        if let Some(order) = self.db.get_settings()?.nav_order {
            models.sort_by_key(|model| order.iter().position(|name| name == model).unwrap_or(usize::MAX));
        }
        Ok(models)
    }

    pub fn overview(&self, token: &str) -> AppResult<Overview> {
        let principal = self.principal(token)?;
        let catalog = self.target.catalog()?;
        views::overview(&self.db, principal.visible_models(&catalog).len())
    }

    pub fn model_view(&self, token: &str, model: &str, request: ListRecordsRequest) -> AppResult<ModelView> {
        let catalog = self.authorized_catalog(token, model, ModelAction::Read)?;
        let default_take = self.default_take()?;
        self.target
            .with_conn(|conn| views::model_view(conn, &catalog, model, &request, &self.config, default_take))
    }

    pub fn record_detail(&self, token: &str, model: &str, id: Value) -> AppResult<RecordDetail> {
        let catalog = self.authorized_catalog(token, model, ModelAction::Read)?;
        self.target
            .with_conn(|conn| views::record_detail(conn, &catalog, model, &id, &self.config))
    }

    pub fn generate_schema(&self, token: &str, model: &str, mode: SchemaMode) -> AppResult<Value> {
        let catalog = self.authorized_catalog(token, model, mode_action(mode))?;
        Ok(schema_gen::generate_schema(&catalog.editable_fields(model)?, mode))
    }

    /// Dry-run validation for live form feedback.
    pub fn validate_record(&self, token: &str, model: &str, data: Value, mode: SchemaMode) -> AppResult<ValidationReport> {
        let catalog = self.authorized_catalog(token, model, mode_action(mode))?;
        let fields = catalog.editable_fields(model)?;
        let normalized = schema_gen::normalize_input(&fields, &data)?;
        schema_gen::validate_payload(&fields, &normalized, mode)
    }

    pub fn handle_record_action(&self, token: &str, model: &str, action: RecordAction) -> AppResult<RecordActionResponse> {
        let required = match &action {
            RecordAction::Create { .. } => ModelAction::Create,
            RecordAction::Update { .. } => ModelAction::Update,
            RecordAction::DeleteSingle { .. } | RecordAction::DeleteBulk { .. } => ModelAction::Delete,
            RecordAction::ExportCsv { .. } => ModelAction::Read,
        };
        let catalog = self.authorized_catalog(token, model, required)?;
        let meta = catalog.model(model)?;

        self.target.with_conn(|conn| match action {
            RecordAction::Create { data } => Ok(RecordActionResponse {
                success: true,
                message: Some(format!("{} created successfully", meta.name)),
                data: Some(records::create_record(conn, &catalog, model, &data)?),
                ..RecordActionResponse::default()
            }),
            RecordAction::Update { id, data } => Ok(RecordActionResponse {
                success: true,
                message: Some(format!("{} updated successfully", meta.name)),
                data: Some(records::update_record(conn, &catalog, model, &id, &data)?),
                ..RecordActionResponse::default()
            }),
            RecordAction::DeleteSingle { id } => {
                records::delete_record(conn, meta, &id)?;
                Ok(RecordActionResponse {
                    success: true,
                    message: Some(format!("{} deleted successfully", meta.name)),
                    deleted_count: Some(1),
                    ..RecordActionResponse::default()
                })
            }
            RecordAction::DeleteBulk { ids } => {
                let deleted = records::delete_records(conn, meta, &ids)?;
                Ok(RecordActionResponse {
                    success: true,
                    message: Some(format!("{} records deleted successfully", deleted)),
                    deleted_count: Some(deleted),
                    ..RecordActionResponse::default()
                })
            }
            RecordAction::ExportCsv { search } => {
                let export = records::export_records(conn, meta, search.as_deref(), &self.data_dir.join("exports"))?;
                Ok(RecordActionResponse {
                    success: true,
                    message: Some(format!("Exported {} rows", export.row_count)),
                    export: Some(export),
                    ..RecordActionResponse::default()
                })
            }
        })
    }

    pub fn search_options(&self, token: &str, request: OptionsRequest) -> AppResult<OptionsResponse> {
        let catalog = self.authorized_catalog(token, &request.model_name, ModelAction::Read)?;
        self.target
            .with_conn(|conn| options::search_options(conn, &catalog, &request, &self.config.options))
    }

    // ─── Query console ──────────────────────────────────────────────────────

    pub fn run_query(&self, token: &str, sql: &str) -> AppResult<QueryConsoleResponse> {
        let principal = self.principal(token)?;
        principal.require_root_admin()?;
        let conn = self.target.open_read_only()?;
        tracing::info!(email = %principal.user().email, "console query requested");
        console::execute_query(&conn, sql, self.config.console.max_rows)
    }

    pub fn reload_catalog(&self, token: &str) -> AppResult<Vec<String>> {
        self.principal(token)?.require_root_admin()?;
        Ok(self.target.reload_catalog()?.model_names())
    }

    // ─── Allowed users ──────────────────────────────────────────────────────

    pub fn list_allowed_users(&self, token: &str) -> AppResult<Vec<AllowedUserRecord>> {
        self.principal(token)?.require_root_admin()?;
        self.db.list_allowed_users()
    }

    pub fn handle_user_action(&self, token: &str, action: UserAction) -> AppResult<UserActionResponse> {
        self.principal(token)?.require_root_admin()?;
        let catalog = self.target.catalog()?;
        users::apply_user_action(&self.db, &catalog, action)
    }

    // ─── Dashboards ─────────────────────────────────────────────────────────

    pub fn list_dashboards(&self, token: &str) -> AppResult<Vec<DashboardRecord>> {
        self.principal(token)?;
        self.db.list_dashboards()
    }

    pub fn create_dashboard(&self, token: &str, name: &str) -> AppResult<DashboardRecord> {
        self.principal(token)?;
        dashboards::create_dashboard(&self.db, name)
    }

    pub fn get_dashboard(&self, token: &str, dashboard_id: &str) -> AppResult<DashboardDetail> {
        self.principal(token)?;
        dashboards::get_dashboard(&self.db, dashboard_id)
    }

    pub fn rename_dashboard(&self, token: &str, dashboard_id: &str, name: &str) -> AppResult<DashboardRecord> {
        self.principal(token)?;
        dashboards::rename_dashboard(&self.db, dashboard_id, name)
    }

    pub fn delete_dashboard(&self, token: &str, dashboard_id: &str) -> AppResult<BooleanResponse> {
        self.principal(token)?;
        dashboards::delete_dashboard(&self.db, dashboard_id)?;
        Ok(BooleanResponse { success: true })
    }

    pub fn add_widget(&self, token: &str, payload: AddWidgetPayload) -> AppResult<DashboardWidget> {
        self.principal(token)?;
        dashboards::add_widget(&self.db, &payload)
    }

    pub fn remove_widget(&self, token: &str, widget_id: &str) -> AppResult<DashboardDetail> {
        self.principal(token)?;
        let dashboard_id = dashboards::remove_widget(&self.db, widget_id)?;
        dashboards::get_dashboard(&self.db, &dashboard_id)
    }

    pub fn update_dashboard_layout(&self, token: &str, payload: UpdateDashboardLayoutPayload) -> AppResult<DashboardDetail> {
        self.principal(token)?;
        dashboards::update_layout(&self.db, &payload)
    }

    pub fn reorder_widgets(&self, token: &str, dashboard_id: &str, widget_ids: &[String]) -> AppResult<DashboardDetail> {
        self.principal(token)?;
        dashboards::reorder_widgets(&self.db, dashboard_id, widget_ids)
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub fn get_settings(&self, token: &str) -> AppResult<AppSettings> {
        self.principal(token)?;
        self.db.get_settings()
    }

    pub fn update_settings(&self, token: &str, update: Value) -> AppResult<AppSettings> {
        self.principal(token)?.require_root_admin()?;
        let max_take = self.config.list.max_take;
        if let Some(take) = update.get("defaultTake").filter(|take| !take.is_null()) {
            if !take.as_u64().is_some_and(|take| take >= 1 && take <= u64::from(max_take)) {
                return Err(AppError::Validation(format!("defaultTake must be between 1 and {}", max_take)));
            }
        }
        self.db.update_settings(update)
    }

    // ─── Maintenance ────────────────────────────────────────────────────────

    pub fn run_maintenance(&self) -> AppResult<usize> {
        auth::purge_expired_sessions(&self.db)
    }

    /// Purges expired sessions every `period` until the task is dropped.
    pub async fn maintenance_loop(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(error) = self.run_maintenance() {
                tracing::warn!(error = %error, "session maintenance failed");
            }
        }
    }
}

fn mode_action(mode: SchemaMode) -> ModelAction {
    match mode {
        SchemaMode::Create => ModelAction::Create,
        SchemaMode::Update => ModelAction::Update,
    }
}
