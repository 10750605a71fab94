use crate::admin::AdminCore;
use crate::config::AdminConfig;
use crate::models::{
    AddWidgetPayload, AllowedUserRecord, AppSettings, BooleanResponse, DashboardDetail, DashboardRecord,
    DashboardWidget, ListRecordsRequest, LoginPayload, ModelView, OptionsRequest, OptionsResponse, Overview,
    QueryConsoleResponse, RecordAction, RecordActionResponse, RecordDetail, RegisterPayload, RegistrationState,
    SessionResponse, SessionUser, UpdateDashboardLayoutPayload, UserAction, UserActionResponse,
};
use crate::schema_gen::{SchemaMode, ValidationReport};
use serde_json::Value;
use tauri::Manager;

const MAINTENANCE_PERIOD: std::time::Duration = std::time::Duration::from_secs(3600);

#[derive(Clone)]
struct AppState {
    core: AdminCore,
}

#[tauri::command]
fn registration_state(state: tauri::State<'_, AppState>) -> Result<RegistrationState, String> {
    state.core.registration_state().map_err(to_client_error)
}

#[tauri::command]
fn register(state: tauri::State<'_, AppState>, payload: RegisterPayload) -> Result<SessionResponse, String> {
    state.core.register(payload).map_err(to_client_error)
}

#[tauri::command]
fn login(state: tauri::State<'_, AppState>, payload: LoginPayload) -> Result<SessionResponse, String> {
    state.core.login(payload).map_err(to_client_error)
}

#[tauri::command]
fn logout(state: tauri::State<'_, AppState>, token: String) -> Result<BooleanResponse, String> {
    state.core.logout(&token).map_err(to_client_error)
}

#[tauri::command]
fn session_get(state: tauri::State<'_, AppState>, token: String) -> Result<SessionUser, String> {
    state.core.session(&token).map_err(to_client_error)
}

#[tauri::command]
fn models_list(state: tauri::State<'_, AppState>, token: String) -> Result<Vec<String>, String> {
    state.core.list_models(&token).map_err(to_client_error)
}

#[tauri::command]
fn overview_get(state: tauri::State<'_, AppState>, token: String) -> Result<Overview, String> {
    state.core.overview(&token).map_err(to_client_error)
}

#[tauri::command]
fn model_view(
    state: tauri::State<'_, AppState>,
    token: String,
    model: String,
    request: ListRecordsRequest,
) -> Result<ModelView, String> {
    state.core.model_view(&token, &model, request).map_err(to_client_error)
}

#[tauri::command]
fn record_detail(
    state: tauri::State<'_, AppState>,
    token: String,
    model: String,
    id: Value,
) -> Result<RecordDetail, String> {
    state.core.record_detail(&token, &model, id).map_err(to_client_error)
}

#[tauri::command]
fn record_action(
    state: tauri::State<'_, AppState>,
    token: String,
    model: String,
    action: RecordAction,
) -> Result<RecordActionResponse, String> {
    state
        .core
        .handle_record_action(&token, &model, action)
        .map_err(to_client_error)
}

#[tauri::command]
fn model_schema(
    state: tauri::State<'_, AppState>,
    token: String,
    model: String,
    mode: SchemaMode,
) -> Result<Value, String> {
    state.core.generate_schema(&token, &model, mode).map_err(to_client_error)
}

#[tauri::command]
fn record_validate(
    state: tauri::State<'_, AppState>,
    token: String,
    model: String,
    data: Value,
    mode: SchemaMode,
) -> Result<ValidationReport, String> {
    state
        .core
        .validate_record(&token, &model, data, mode)
        .map_err(to_client_error)
}

#[tauri::command]
fn options_search(
    state: tauri::State<'_, AppState>,
    token: String,
    request: OptionsRequest,
) -> Result<OptionsResponse, String> {
    state.core.search_options(&token, request).map_err(to_client_error)
}

#[tauri::command]
fn query_run(state: tauri::State<'_, AppState>, token: String, sql: String) -> Result<QueryConsoleResponse, String> {
    state.core.run_query(&token, &sql).map_err(to_client_error)
}

#[tauri::command]
fn catalog_reload(state: tauri::State<'_, AppState>, token: String) -> Result<Vec<String>, String> {
    state.core.reload_catalog(&token).map_err(to_client_error)
}

#[tauri::command]
fn allowed_users_list(state: tauri::State<'_, AppState>, token: String) -> Result<Vec<AllowedUserRecord>, String> {
    state.core.list_allowed_users(&token).map_err(to_client_error)
}

#[tauri::command]
fn allowed_user_action(
    state: tauri::State<'_, AppState>,
    token: String,
    action: UserAction,
) -> Result<UserActionResponse, String> {
    state.core.handle_user_action(&token, action).map_err(to_client_error)
}

#[tauri::command]
fn dashboards_list(state: tauri::State<'_, AppState>, token: String) -> Result<Vec<DashboardRecord>, String> {
    state.core.list_dashboards(&token).map_err(to_client_error)
}

#[tauri::command]
fn dashboard_create(state: tauri::State<'_, AppState>, token: String, name: String) -> Result<DashboardRecord, String> {
    state.core.create_dashboard(&token, &name).map_err(to_client_error)
}

#[tauri::command]
fn dashboard_get(
    state: tauri::State<'_, AppState>,
    token: String,
    dashboard_id: String,
) -> Result<DashboardDetail, String> {
    state.core.get_dashboard(&token, &dashboard_id).map_err(to_client_error)
}

#[tauri::command]
fn dashboard_rename(
    state: tauri::State<'_, AppState>,
    token: String,
    dashboard_id: String,
    name: String,
) -> Result<DashboardRecord, String> {
    state
        .core
        .rename_dashboard(&token, &dashboard_id, &name)
        .map_err(to_client_error)
}

#[tauri::command]
fn dashboard_delete(
    state: tauri::State<'_, AppState>,
    token: String,
    dashboard_id: String,
) -> Result<BooleanResponse, String> {
    state.core.delete_dashboard(&token, &dashboard_id).map_err(to_client_error)
}

#[tauri::command]
fn dashboard_widget_add(
    state: tauri::State<'_, AppState>,
    token: String,
    payload: AddWidgetPayload,
) -> Result<DashboardWidget, String> {
    state.core.add_widget(&token, payload).map_err(to_client_error)
}

#[tauri::command]
fn dashboard_widget_remove(
    state: tauri::State<'_, AppState>,
    token: String,
    widget_id: String,
) -> Result<DashboardDetail, String> {
    state.core.remove_widget(&token, &widget_id).map_err(to_client_error)
}

#[tauri::command]
fn dashboard_layout_update(
    state: tauri::State<'_, AppState>,
    token: String,
    payload: UpdateDashboardLayoutPayload,
) -> Result<DashboardDetail, String> {
    state
        .core
        .update_dashboard_layout(&token, payload)
        .map_err(to_client_error)
}

#[tauri::command]
fn dashboard_widgets_reorder(
    state: tauri::State<'_, AppState>,
    token: String,
    dashboard_id: String,
    widget_ids: Vec<String>,
) -> Result<DashboardDetail, String> {
    state
        .core
        .reorder_widgets(&token, &dashboard_id, &widget_ids)
        .map_err(to_client_error)
}

#[tauri::command]
fn settings_get(state: tauri::State<'_, AppState>, token: String) -> Result<AppSettings, String> {
    state.core.get_settings(&token).map_err(to_client_error)
}

#[tauri::command]
fn settings_update(state: tauri::State<'_, AppState>, token: String, update: Value) -> Result<AppSettings, String> {
    state.core.update_settings(&token, update).map_err(to_client_error)
}

pub fn run() {
    tauri::Builder::default()
        .setup(|app| {
            let app_data_dir = app.path().app_data_dir().map_err(|error| error.to_string())?;
            std::fs::create_dir_all(&app_data_dir).map_err(|error| error.to_string())?;

            let config = AdminConfig::load(&app_data_dir).map_err(|error| format!("{:#}", error))?;
            crate::logging::init_tracing(&app_data_dir, &config.log_level)?;

            let core = AdminCore::new(app_data_dir, config).map_err(|error| error.to_string())?;

            tauri::async_runtime::spawn({
                let core = core.clone();
                async move {
                    core.maintenance_loop(MAINTENANCE_PERIOD).await;
                }
            });

            app.manage(AppState { core });
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            registration_state,
            register,
            login,
            logout,
            session_get,
            models_list,
            overview_get,
            model_view,
            record_detail,
            record_action,
            model_schema,
            record_validate,
            options_search,
            query_run,
            catalog_reload,
            allowed_users_list,
            allowed_user_action,
            dashboards_list,
            dashboard_create,
            dashboard_get,
            dashboard_rename,
            dashboard_delete,
            dashboard_widget_add,
            dashboard_widget_remove,
            dashboard_layout_update,
            dashboard_widgets_reorder,
            settings_get,
            settings_update
        ])
        .run(tauri::generate_context!())
        .expect("failed to run tauri app");
}

fn to_client_error(error: impl std::fmt::Display) -> String {
    error.to_string()
}
