use crate::errors::{AppError, AppResult};
use crate::models::{
    AllowedUserRecord, AppSettings, DashboardRecord, DashboardWidget, IdentitySummary, ModelPermissionRecord,
    PermissionSet, SessionUser, WidgetKind, WidgetLayoutItem,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Identity row including the password hash; never leaves the backend.
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub password_hash: String,
    pub is_root_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredIdentity {
    pub fn session_user(&self) -> SessionUser {
        SessionUser {
            id: self.id.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            is_root_admin: self.is_root_admin,
        }
    }
}

/// Admin state: identities, sessions, allowed users, dashboards and settings.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    // ─── Identities & sessions ──────────────────────────────────────────────

    pub fn count_identities(&self) -> AppResult<i64> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count = conn.query_row("SELECT COUNT(1) FROM identities", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Inserts an identity. `is_root_admin` is only honoured while the table is
    /// empty, checked inside the same transaction.
    pub fn insert_identity(
        &self,
        email: &str,
        name: Option<&str>,
        password_hash: &str,
        claim_root_admin: bool,
    ) -> AppResult<StoredIdentity> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;
        let existing: i64 = tx.query_row("SELECT COUNT(1) FROM identities", [], |row| row.get(0))?;
        let is_root_admin = claim_root_admin && existing == 0;
        let email_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM identities WHERE email = ?1)",
            [email],
            |row| row.get(0),
        )?;
        if email_taken {
            return Err(AppError::Conflict("An account with this email already exists".to_string()));
        }
        tx.execute(
            "INSERT INTO identities (id, email, name, password_hash, is_root_admin, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, email, name, password_hash, is_root_admin, now.to_rfc3339()],
        )?;
        tx.commit()?;

        Ok(StoredIdentity {
            id,
            email: email.to_string(),
            name: name.map(ToString::to_string),
            password_hash: password_hash.to_string(),
            is_root_admin,
            created_at: now,
        })
    }

    pub fn find_identity_by_email(&self, email: &str) -> AppResult<Option<StoredIdentity>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.query_row(
            "SELECT id, email, name, password_hash, is_root_admin, created_at FROM identities WHERE email = ?1",
            [email],
            parse_identity_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn insert_session(&self, token: &str, identity_id: &str, expires_at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO sessions (token, identity_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![token, identity_id, Utc::now().to_rfc3339(), expires_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Resolves a session token to its user, ignoring expired sessions.
    pub fn find_session(&self, token: &str, now: DateTime<Utc>) -> AppResult<Option<(SessionUser, DateTime<Utc>)>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let row = conn
            .query_row(
                "SELECT i.id, i.email, i.name, i.password_hash, i.is_root_admin, i.created_at, s.expires_at
                 FROM sessions s
                 JOIN identities i ON i.id = s.identity_id
                 WHERE s.token = ?1",
                [token],
                |row| {
                    let identity = parse_identity_row(row)?;
                    let expires_at = parse_time(&row.get::<_, String>(6)?)?;
                    Ok((identity, expires_at))
                },
            )
            .optional()?;

        Ok(row
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(identity, expires_at)| (identity.session_user(), expires_at)))
    }

    pub fn delete_session(&self, token: &str) -> AppResult<bool> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let deleted = conn.execute("DELETE FROM sessions WHERE token = ?1", [token])?;
        Ok(deleted > 0)
    }

    pub fn purge_expired_sessions(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let deleted = conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", [now.to_rfc3339()])?;
        Ok(deleted)
    }

    // ─── Allowed users ──────────────────────────────────────────────────────

    pub fn count_allowed_users(&self) -> AppResult<i64> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count = conn.query_row("SELECT COUNT(1) FROM allowed_users", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn list_allowed_users(&self) -> AppResult<Vec<AllowedUserRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, email, created_at, updated_at FROM allowed_users ORDER BY created_at DESC, email ASC",
        )?;
        let users = stmt
            .query_map([], parse_allowed_user_row)?
            .collect::<Result<Vec<_>, _>>()?;

        users
            .into_iter()
            .map(|user| hydrate_allowed_user(&conn, user))
            .collect()
    }

    pub fn get_allowed_user(&self, id: &str) -> AppResult<Option<AllowedUserRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        load_allowed_user(&conn, "id", id)
    }

    pub fn find_allowed_user_by_email(&self, email: &str) -> AppResult<Option<AllowedUserRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        load_allowed_user(&conn, "email", email)
    }

    /// Whether `email` belongs to an allowed user other than `except_id`.
    pub fn allowed_email_taken(&self, email: &str, except_id: Option<&str>) -> AppResult<bool> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let taken = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM allowed_users WHERE email = ?1 AND id IS NOT ?2)",
            params![email, except_id],
            |row| row.get(0),
        )?;
        Ok(taken)
    }

    pub fn insert_allowed_user(
        &self,
        email: &str,
        permissions: &BTreeMap<String, PermissionSet>,
    ) -> AppResult<AllowedUserRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO allowed_users (id, email, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id, email, now],
        )?;
        write_permissions(&tx, &id, permissions)?;
        tx.commit()?;

        load_allowed_user(&conn, "id", &id)?
            .ok_or_else(|| AppError::Internal("allowed user missing after insert".to_string()))
    }

    /// Updates the email and replaces the whole permission map.
    pub fn update_allowed_user(
        &self,
        id: &str,
        email: &str,
        permissions: &BTreeMap<String, PermissionSet>,
    ) -> AppResult<Option<AllowedUserRecord>> {
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE allowed_users SET email = ?1, updated_at = ?2 WHERE id = ?3",
            params![email, Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        tx.execute("DELETE FROM user_model_permissions WHERE allowed_user_id = ?1", [id])?;
        write_permissions(&tx, id, permissions)?;
        tx.commit()?;

        load_allowed_user(&conn, "id", id)
    }

    pub fn delete_allowed_users(&self, ids: &[String]) -> AppResult<usize> {
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for id in ids {
            deleted += tx.execute("DELETE FROM allowed_users WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    // ─── Dashboards ─────────────────────────────────────────────────────────

    pub fn count_dashboards(&self) -> AppResult<i64> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count = conn.query_row("SELECT COUNT(1) FROM dashboards", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn insert_dashboard(&self, name: &str) -> AppResult<DashboardRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO dashboards (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id, name, now.to_rfc3339()],
        )?;
        Ok(DashboardRecord {
            id,
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn list_dashboards(&self) -> AppResult<Vec<DashboardRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, name, created_at, updated_at FROM dashboards ORDER BY created_at ASC, name ASC",
        )?;
        let dashboards = stmt
            .query_map([], parse_dashboard_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dashboards)
    }

    pub fn get_dashboard(&self, id: &str) -> AppResult<Option<DashboardRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.query_row(
            "SELECT id, name, created_at, updated_at FROM dashboards WHERE id = ?1",
            [id],
            parse_dashboard_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn rename_dashboard(&self, id: &str, name: &str) -> AppResult<Option<DashboardRecord>> {
        {
            let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            let changed = conn.execute(
                "UPDATE dashboards SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, Utc::now().to_rfc3339(), id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
        }
        self.get_dashboard(id)
    }

    pub fn delete_dashboard(&self, id: &str) -> AppResult<bool> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let deleted = conn.execute("DELETE FROM dashboards WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    pub fn insert_widget(&self, widget: &DashboardWidget) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO dashboard_widgets (id, dashboard_id, title, kind, position, grid_x, grid_y, grid_w, grid_h, config_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                widget.id,
                widget.dashboard_id,
                widget.title,
                widget.kind.as_str(),
                widget.position,
                widget.grid_x,
                widget.grid_y,
                widget.grid_w,
                widget.grid_h,
                serde_json::to_string(&widget.config)?,
            ],
        )?;
        touch_dashboard(&conn, &widget.dashboard_id)?;
        Ok(())
    }

    pub fn list_widgets(&self, dashboard_id: &str) -> AppResult<Vec<DashboardWidget>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, dashboard_id, title, kind, position, grid_x, grid_y, grid_w, grid_h, config_json
             FROM dashboard_widgets WHERE dashboard_id = ?1
             ORDER BY position ASC, grid_y ASC, grid_x ASC",
        )?;
        let widgets = stmt
            .query_map([dashboard_id], parse_widget_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(widgets)
    }

    /// Removes a widget and returns the dashboard it belonged to.
    pub fn delete_widget(&self, widget_id: &str) -> AppResult<Option<String>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let dashboard_id: Option<String> = conn
            .query_row(
                "SELECT dashboard_id FROM dashboard_widgets WHERE id = ?1",
                [widget_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(dashboard_id) = dashboard_id.as_deref() {
            conn.execute("DELETE FROM dashboard_widgets WHERE id = ?1", [widget_id])?;
            touch_dashboard(&conn, dashboard_id)?;
        }
        Ok(dashboard_id)
    }

    pub fn update_widget_layouts(&self, dashboard_id: &str, layouts: &[WidgetLayoutItem]) -> AppResult<()> {
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;
        for item in layouts {
            let changed = tx.execute(
                "UPDATE dashboard_widgets SET grid_x = ?1, grid_y = ?2, grid_w = ?3, grid_h = ?4
                 WHERE id = ?5 AND dashboard_id = ?6",
                params![item.grid_x, item.grid_y, item.grid_w, item.grid_h, item.widget_id, dashboard_id],
            )?;
            if changed == 0 {
                return Err(AppError::NotFound(format!(
                    "Widget {} not found on dashboard {}",
                    item.widget_id, dashboard_id
                )));
            }
        }
        touch_dashboard(&tx, dashboard_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn reorder_widgets(&self, dashboard_id: &str, widget_ids: &[String]) -> AppResult<()> {
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;
        for (i, widget_id) in widget_ids.iter().enumerate() {
            tx.execute(
                "UPDATE dashboard_widgets SET position = ?1 WHERE id = ?2 AND dashboard_id = ?3",
                params![i as i32, widget_id, dashboard_id],
            )?;
        }
        touch_dashboard(&tx, dashboard_id)?;
        tx.commit()?;
        Ok(())
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'app'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<AppSettings>(&raw).unwrap_or_default()),
            None => Ok(AppSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: AppSettings = serde_json::from_value(merged)
            .map_err(|error| AppError::Validation(format!("Invalid settings: {}", error)))?;

        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('app', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'app'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('app', ?1, ?2)",
                params![
                    serde_json::to_string(&AppSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }
}

fn write_permissions(
    conn: &Connection,
    allowed_user_id: &str,
    permissions: &BTreeMap<String, PermissionSet>,
) -> AppResult<()> {
    for (model, set) in permissions {
        conn.execute(
            "INSERT INTO user_model_permissions (id, allowed_user_id, model, can_create, can_read, can_update, can_delete)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                allowed_user_id,
                model,
                set.create,
                set.read,
                set.update,
                set.delete,
            ],
        )?;
    }
    Ok(())
}

fn load_allowed_user(conn: &Connection, column: &str, value: &str) -> AppResult<Option<AllowedUserRecord>> {
    let sql = match column {
        "id" => "SELECT id, email, created_at, updated_at FROM allowed_users WHERE id = ?1",
        _ => "SELECT id, email, created_at, updated_at FROM allowed_users WHERE email = ?1",
    };
    let user = conn.query_row(sql, [value], parse_allowed_user_row).optional()?;
    user.map(|user| hydrate_allowed_user(conn, user)).transpose()
}

fn hydrate_allowed_user(conn: &Connection, mut user: AllowedUserRecord) -> AppResult<AllowedUserRecord> {
    let mut stmt = conn.prepare(
        "SELECT id, allowed_user_id, model, can_create, can_read, can_update, can_delete
         FROM user_model_permissions WHERE allowed_user_id = ?1 ORDER BY model ASC",
    )?;
    user.permissions = stmt
        .query_map([&user.id], |row| {
            Ok(ModelPermissionRecord {
                id: row.get(0)?,
                allowed_user_id: row.get(1)?,
                model: row.get(2)?,
                can_create: row.get(3)?,
                can_read: row.get(4)?,
                can_update: row.get(5)?,
                can_delete: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    user.identity = conn
        .query_row(
            "SELECT id, email, name, created_at FROM identities WHERE email = ?1",
            [&user.email],
            |row| {
                Ok(IdentitySummary {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    name: row.get(2)?,
                    created_at: parse_time(&row.get::<_, String>(3)?)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

fn touch_dashboard(conn: &Connection, dashboard_id: &str) -> AppResult<()> {
    conn.execute(
        "UPDATE dashboards SET updated_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), dashboard_id],
    )?;
    Ok(())
}

fn parse_identity_row(row: &Row<'_>) -> rusqlite::Result<StoredIdentity> {
    Ok(StoredIdentity {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        password_hash: row.get(3)?,
        is_root_admin: row.get(4)?,
        created_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_allowed_user_row(row: &Row<'_>) -> rusqlite::Result<AllowedUserRecord> {
    Ok(AllowedUserRecord {
        id: row.get(0)?,
        email: row.get(1)?,
        created_at: parse_time(&row.get::<_, String>(2)?)?,
        updated_at: parse_time(&row.get::<_, String>(3)?)?,
        permissions: Vec::new(),
        identity: None,
    })
}

fn parse_dashboard_row(row: &Row<'_>) -> rusqlite::Result<DashboardRecord> {
    Ok(DashboardRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_time(&row.get::<_, String>(2)?)?,
        updated_at: parse_time(&row.get::<_, String>(3)?)?,
    })
}

fn parse_widget_row(row: &Row<'_>) -> rusqlite::Result<DashboardWidget> {
    let kind_raw: String = row.get(3)?;
    let config_raw: String = row.get(9)?;
    Ok(DashboardWidget {
        id: row.get(0)?,
        dashboard_id: row.get(1)?,
        title: row.get(2)?,
        kind: WidgetKind::parse(&kind_raw).unwrap_or(WidgetKind::Stats),
        position: row.get(4)?,
        grid_x: row.get(5)?,
        grid_y: row.get(6)?,
        grid_w: row.get(7)?,
        grid_h: row.get(8)?,
        config: serde_json::from_str(&config_raw).unwrap_or_else(|_| serde_json::json!({})),
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{merge_json, Database};
    use crate::models::PermissionSet;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("admin.db")).expect("db");
        (dir, db)
    }

    #[test]
    fn first_identity_claims_root_admin_only_once() {
        let (_dir, db) = open();
        let first = db.insert_identity("root@example.com", None, "hash", true).expect("first");
        let second = db.insert_identity("other@example.com", None, "hash", true).expect("second");
        assert!(first.is_root_admin);
        assert!(!second.is_root_admin);
        assert!(db.insert_identity("root@example.com", None, "hash", false).is_err());
    }

    #[test]
    fn sessions_expire_and_purge() {
        let (_dir, db) = open();
        let identity = db.insert_identity("root@example.com", Some("Root"), "hash", true).expect("identity");
        let now = Utc::now();
        db.insert_session("live", &identity.id, now + Duration::hours(1)).expect("live");
        db.insert_session("stale", &identity.id, now - Duration::hours(1)).expect("stale");

        let (user, _) = db.find_session("live", now).expect("lookup").expect("live session");
        assert_eq!(user.name.as_deref(), Some("Root"));
        assert!(user.is_root_admin);
        assert!(db.find_session("stale", now).expect("lookup").is_none());

        assert_eq!(db.purge_expired_sessions(now).expect("purge"), 1);
        assert!(db.delete_session("live").expect("delete"));
        assert!(!db.delete_session("live").expect("delete again"));
    }

    #[test]
    fn allowed_user_permissions_are_replaced_on_update() {
        let (_dir, db) = open();
        let mut permissions = BTreeMap::new();
        permissions.insert(
            "Post".to_string(),
            PermissionSet {
                read: true,
                ..PermissionSet::default()
            },
        );
        let user = db.insert_allowed_user("ann@example.com", &permissions).expect("insert");
        assert_eq!(user.permissions.len(), 1);
        assert!(user.identity.is_none());

        let mut replaced = BTreeMap::new();
        replaced.insert(
            "Author".to_string(),
            PermissionSet {
                create: true,
                read: true,
                update: false,
                delete: false,
            },
        );
        let updated = db
            .update_allowed_user(&user.id, "ann@corp.example", &replaced)
            .expect("update")
            .expect("exists");
        assert_eq!(updated.email, "ann@corp.example");
        assert_eq!(updated.permissions.len(), 1);
        assert_eq!(updated.permissions[0].model, "Author");
        assert!(db.allowed_email_taken("ann@corp.example", None).expect("taken"));
        assert!(!db.allowed_email_taken("ann@corp.example", Some(&user.id)).expect("not taken by others"));

        db.insert_identity("ann@corp.example", Some("Ann"), "hash", false).expect("identity");
        let linked = db.get_allowed_user(&user.id).expect("get").expect("exists");
        assert_eq!(linked.identity.map(|identity| identity.name), Some(Some("Ann".to_string())));

        assert_eq!(db.delete_allowed_users(&[user.id.clone(), "missing".to_string()]).expect("delete"), 1);
        assert_eq!(db.count_allowed_users().expect("count"), 0);
    }

    #[test]
    fn settings_merge_updates() {
        let (_dir, db) = open();
        assert_eq!(db.get_settings().expect("settings").theme, "system");
        let updated = db.update_settings(json!({ "defaultTake": 25 })).expect("update");
        assert_eq!(updated.default_take, Some(25));
        assert_eq!(updated.theme, "system");
        assert!(db.update_settings(json!({ "theme": 5 })).is_err());
    }

    #[test]
    fn merge_json_is_deep() {
        let mut target = json!({ "a": { "b": 1, "c": 2 }, "d": 3 });
        merge_json(&mut target, json!({ "a": { "b": 9 } }));
        assert_eq!(target, json!({ "a": { "b": 9, "c": 2 }, "d": 3 }));
    }
}
