use chrono::{Duration, Utc};
use db_admin_console_lib::db::Database;
use db_admin_console_lib::models::{
    AddWidgetPayload, ListRecordsRequest, LoginPayload, OptionsRequest, RecordAction, RegisterPayload, UserAction,
    WidgetKind,
};
use db_admin_console_lib::schema_gen::SchemaMode;
use db_admin_console_lib::{AdminConfig, AdminCore};
use rusqlite::Connection;
use serde_json::json;
use std::path::Path;

fn seed_target(data_dir: &Path) {
    let conn = Connection::open(data_dir.join("target.db")).expect("open target");
    conn.execute_batch(
        "CREATE TABLE Author (
           id TEXT PRIMARY KEY,
           name TEXT NOT NULL,
           email TEXT NOT NULL UNIQUE,
           createdAt DATETIME NOT NULL
         );
         CREATE TABLE Post (
           id INTEGER PRIMARY KEY,
           title TEXT NOT NULL,
           status TEXT NOT NULL DEFAULT 'draft' CHECK (status IN ('draft', 'published')),
           author_id TEXT REFERENCES Author(id),
           updatedAt DATETIME
         );",
    )
    .expect("seed schema");
}

fn boot() -> (tempfile::TempDir, AdminCore) {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_target(dir.path());
    let core = AdminCore::new(dir.path().to_path_buf(), AdminConfig::default()).expect("core");
    (dir, core)
}

fn register(core: &AdminCore, email: &str) -> String {
    core.register(RegisterPayload {
        email: email.to_string(),
        password: "long enough password".to_string(),
        name: None,
    })
    .expect("register")
    .token
}

#[test]
fn root_admin_manages_records_end_to_end() {
    let (dir, core) = boot();
    assert!(core.registration_state().expect("state").is_super_admin_registration);
    let root = register(&core, "root@example.com");
    assert!(core.session(&root).expect("session").is_root_admin);
    assert_eq!(core.list_models(&root).expect("models"), vec!["Author".to_string(), "Post".to_string()]);

    let create: RecordAction = serde_json::from_value(json!({
        "intent": "create",
        "data": { "name": "Ann", "email": "ann@example.com" }
    }))
    .expect("create action");
    let author = core
        .handle_record_action(&root, "Author", create)
        .expect("create author")
        .data
        .expect("author row");
    let author_id = author["id"].clone();

    let post = core
        .handle_record_action(
            &root,
            "Post",
            RecordAction::Create {
                data: json!({ "title": "Hello world", "author_id": author_id }),
            },
        )
        .expect("create post")
        .data
        .expect("post row");
    assert_eq!(post["status"], json!("draft"));

    let view = core
        .model_view(
            &root,
            "Post",
            ListRecordsRequest {
                page: None,
                take: None,
                search: Some("WORLD".to_string()),
            },
        )
        .expect("view");
    assert_eq!(view.pagination.total_count, 1);
    let status = view.model_fields.iter().find(|field| field.name == "status").expect("status");
    assert_eq!(status.options, Some(vec![json!("draft"), json!("published")]));
    let fk = view.model_fields.iter().find(|field| field.name == "author_id").expect("fk");
    assert_eq!(fk.options, Some(vec![author_id.clone()]));

    let detail = core.record_detail(&root, "Post", post["id"].clone()).expect("detail");
    assert_eq!(detail.related_models[0].name, "Author");

    let bad_update = core
        .handle_record_action(
            &root,
            "Post",
            RecordAction::Update {
                id: post["id"].clone(),
                data: json!({ "status": "archived" }),
            },
        )
        .expect_err("invalid enum");
    assert!(bad_update.to_string().starts_with("VALIDATION_FAILED"));

    let report = core
        .validate_record(&root, "Post", json!({ "status": "published" }), SchemaMode::Create)
        .expect("report");
    assert!(!report.valid);
    assert!(report.issues.iter().any(|issue| issue.field.as_deref() == Some("title")));

    let export = core
        .handle_record_action(&root, "Author", RecordAction::ExportCsv { search: None })
        .expect("export")
        .export
        .expect("export info");
    assert_eq!(export.row_count, 1);
    assert!(Path::new(&export.path).starts_with(dir.path().join("exports")));

    let options = core
        .search_options(
            &root,
            OptionsRequest {
                model_name: "Author".to_string(),
                model_field: "name".to_string(),
                search: "an".to_string(),
            },
        )
        .expect("options");
    assert_eq!(options.options, vec![json!("Ann")]);

    let query = core.run_query(&root, "select title from Post").expect("query");
    assert!(query.success);
    assert_eq!(query.rows[0]["title"], json!("Hello world"));
    assert!(core.run_query(&root, "delete from Post").is_err());

    let deleted = core
        .handle_record_action(
            &root,
            "Post",
            RecordAction::DeleteBulk {
                ids: vec![post["id"].clone()],
            },
        )
        .expect("delete");
    assert_eq!(deleted.deleted_count, Some(1));

    let overview = core.overview(&root).expect("overview");
    assert_eq!(overview.models_count, 2);
}

#[test]
fn allowed_users_are_limited_to_their_permissions() {
    let (_dir, core) = boot();
    let root = register(&core, "root@example.com");

    let action: UserAction = serde_json::from_value(json!({
        "intent": "create",
        "email": "viewer@example.com",
        "permissions": { "Post": { "read": true } }
    }))
    .expect("user action");
    core.handle_user_action(&root, action).expect("allow viewer");

    let stranger = core.register(RegisterPayload {
        email: "stranger@example.com".to_string(),
        password: "long enough password".to_string(),
        name: None,
    });
    assert!(stranger.is_err());

    let viewer = register(&core, "viewer@example.com");
    assert_eq!(core.list_models(&viewer).expect("models"), vec!["Post".to_string()]);
    assert!(core.model_view(&viewer, "Post", ListRecordsRequest::default()).is_ok());

    let denied = core
        .handle_record_action(&viewer, "Post", RecordAction::Create { data: json!({ "title": "x" }) })
        .expect_err("no create permission");
    assert!(denied.to_string().starts_with("POLICY_DENIED"));
    assert!(core.model_view(&viewer, "Author", ListRecordsRequest::default()).is_err());
    let unknown = core
        .model_view(&viewer, "Nope", ListRecordsRequest::default())
        .expect_err("unknown model");
    assert!(unknown.to_string().starts_with("POLICY_DENIED"));
    let root_unknown = core
        .model_view(&root, "Nope", ListRecordsRequest::default())
        .expect_err("unknown model");
    assert!(root_unknown.to_string().starts_with("NOT_FOUND"));
    let form = core
        .validate_record(&viewer, "Post", json!({ "title": "x" }), SchemaMode::Create)
        .expect_err("read-only user cannot build create forms");
    assert!(form.to_string().starts_with("POLICY_DENIED"));
    assert!(core.generate_schema(&viewer, "Post", SchemaMode::Update).is_err());
    assert!(core.run_query(&viewer, "select 1").is_err());
    assert!(core.list_allowed_users(&viewer).is_err());

    let users = core.list_allowed_users(&root).expect("users");
    assert_eq!(users.len(), 1);
    assert!(users[0].identity.is_some());

    core.handle_user_action(&root, UserAction::DeleteSingle { id: users[0].id.clone() })
        .expect("revoke");
    let revoked = core.list_models(&viewer).expect_err("revoked");
    assert!(revoked.to_string().starts_with("POLICY_DENIED"));

    let again = core
        .login(LoginPayload {
            email: "root@example.com".to_string(),
            password: "long enough password".to_string(),
        })
        .expect("login");
    assert!(core.logout(&again.token).expect("logout").success);
    assert!(core.session(&again.token).is_err());
}

#[test]
fn catalog_follows_schema_changes_and_settings() {
    let (_dir, core) = boot();
    let root = register(&core, "root@example.com");

    core.target()
        .with_conn(|conn| {
            conn.execute_batch("CREATE TABLE Tag (id INTEGER PRIMARY KEY, label TEXT NOT NULL);")?;
            Ok(())
        })
        .expect("migrate");
    assert_eq!(core.list_models(&root).expect("models").len(), 3);

    let settings = core
        .update_settings(&root, json!({ "navOrder": ["Tag", "Post"], "defaultTake": 2 }))
        .expect("settings");
    assert_eq!(settings.default_take, Some(2));
    assert_eq!(
        core.list_models(&root).expect("ordered"),
        vec!["Tag".to_string(), "Post".to_string(), "Author".to_string()]
    );
    assert!(core.update_settings(&root, json!({ "defaultTake": 0 })).is_err());

    for index in 0..3 {
        core.handle_record_action(&root, "Tag", RecordAction::Create { data: json!({ "label": format!("t{}", index) }) })
            .expect("tag");
    }
    let view = core.model_view(&root, "Tag", ListRecordsRequest::default()).expect("view");
    assert_eq!(view.records.len(), 2);
    assert_eq!(view.pagination.total_pages, 2);
}

#[test]
fn dashboards_round_trip_through_core() {
    let (_dir, core) = boot();
    let root = register(&core, "root@example.com");

    let dashboard = core.create_dashboard(&root, "Overview").expect("dashboard");
    let widget = core
        .add_widget(
            &root,
            AddWidgetPayload {
                dashboard_id: dashboard.id.clone(),
                title: "Posts".to_string(),
                kind: WidgetKind::Chart,
                config: Some(json!({ "model": "Post" })),
                grid_x: None,
                grid_y: None,
                grid_w: None,
                grid_h: None,
            },
        )
        .expect("widget");
    let detail = core.get_dashboard(&root, &dashboard.id).expect("detail");
    assert_eq!(detail.widgets.len(), 1);
    assert_eq!(detail.widgets[0].config, json!({ "model": "Post" }));
    assert_eq!(core.list_dashboards(&root).expect("list").len(), 1);

    let renamed = core.rename_dashboard(&root, &dashboard.id, "Home").expect("rename");
    assert_eq!(renamed.name, "Home");
    assert!(core.remove_widget(&root, &widget.id).expect("remove").widgets.is_empty());
    assert!(core.delete_dashboard(&root, &dashboard.id).expect("delete").success);
    assert!(core.list_dashboards("bogus-token").is_err());
}

#[tokio::test]
async fn maintenance_loop_purges_expired_sessions() {
    let (dir, core) = boot();
    let response = core
        .register(RegisterPayload {
            email: "root@example.com".to_string(),
            password: "long enough password".to_string(),
            name: Some("Root".to_string()),
        })
        .expect("register");

    let admin_db = Database::new(&dir.path().join("admin.db")).expect("admin db");
    admin_db
        .insert_session("expired-token", &response.user.id, Utc::now() - Duration::minutes(5))
        .expect("expired session");

    let task = tokio::spawn(core.clone().maintenance_loop(std::time::Duration::from_millis(10)));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    task.abort();

    assert_eq!(admin_db.purge_expired_sessions(Utc::now()).expect("purge"), 0);
    assert!(core.session(&response.token).is_ok());
}
