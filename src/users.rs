use crate::catalog::ModelCatalog;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{AllowedUserRecord, PermissionSet, UserAction, UserActionResponse};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

/// Trims and lowercases an email, rejecting blanks and obvious garbage.
pub fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err(AppError::Validation("Email is required".to_string()));
    }
    if !EMAIL_RE.is_match(&email) {
        return Err(AppError::Validation(format!("Invalid email address: {}", raw.trim())));
    }
    Ok(email)
}

fn check_permission_models(catalog: &ModelCatalog, permissions: &BTreeMap<String, PermissionSet>) -> AppResult<()> {
    let unknown: Vec<&str> = permissions
        .keys()
        .filter(|model| !catalog.models.contains_key(model.as_str()))
        .map(String::as_str)
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Unknown models in permissions: {}", unknown.join(", "))))
    }
}

pub fn create_allowed_user(
    db: &Database,
    catalog: &ModelCatalog,
    email: &str,
    permissions: &BTreeMap<String, PermissionSet>,
) -> AppResult<AllowedUserRecord> {
    let email = normalize_email(email)?;
    check_permission_models(catalog, permissions)?;
    if db.allowed_email_taken(&email, None)? {
        return Err(AppError::Conflict("User with this email already exists".to_string()));
    }
    let user = db.insert_allowed_user(&email, permissions)?;
    tracing::info!(user_id = %user.id, email = %user.email, models = permissions.len(), "allowed user created");
    Ok(user)
}

pub fn update_allowed_user(
    db: &Database,
    catalog: &ModelCatalog,
    id: &str,
    email: &str,
    permissions: &BTreeMap<String, PermissionSet>,
) -> AppResult<AllowedUserRecord> {
    if id.trim().is_empty() {
        return Err(AppError::Validation("User id is required".to_string()));
    }
    let email = normalize_email(email)?;
    check_permission_models(catalog, permissions)?;
    if db.allowed_email_taken(&email, Some(id))? {
        return Err(AppError::Conflict("Another user with this email already exists".to_string()));
    }
    let user = db
        .update_allowed_user(id, &email, permissions)?
        .ok_or_else(|| AppError::NotFound(format!("Allowed user {} not found", id)))?;
    tracing::info!(user_id = %user.id, email = %user.email, models = permissions.len(), "allowed user updated");
    Ok(user)
}

pub fn delete_allowed_users(db: &Database, ids: &[String]) -> AppResult<usize> {
    if ids.is_empty() {
        return Err(AppError::Validation("No users selected".to_string()));
    }
    let deleted = db.delete_allowed_users(ids)?;
    tracing::info!(requested = ids.len(), deleted, "allowed users deleted");
    Ok(deleted)
}

/// Dispatches a settings-screen form submission.
pub fn apply_user_action(db: &Database, catalog: &ModelCatalog, action: UserAction) -> AppResult<UserActionResponse> {
    match action {
        UserAction::Create { email, permissions } => {
            let user = create_allowed_user(db, catalog, &email, &permissions)?;
            Ok(UserActionResponse {
                success: true,
                message: "User created successfully".to_string(),
                data: Some(user),
                deleted_count: None,
            })
        }
        UserAction::Update { id, email, permissions } => {
            let user = update_allowed_user(db, catalog, &id, &email, &permissions)?;
            Ok(UserActionResponse {
                success: true,
                message: "User updated successfully".to_string(),
                data: Some(user),
                deleted_count: None,
            })
        }
        UserAction::DeleteSingle { id } => {
            let deleted = delete_allowed_users(db, std::slice::from_ref(&id))?;
            if deleted == 0 {
                return Err(AppError::NotFound(format!("Allowed user {} not found", id)));
            }
            Ok(UserActionResponse {
                success: true,
                message: "User deleted successfully".to_string(),
                data: None,
                deleted_count: Some(deleted),
            })
        }
        UserAction::DeleteBulk { ids } => {
            let deleted = delete_allowed_users(db, &ids)?;
            Ok(UserActionResponse {
                success: true,
                message: format!("{} users deleted successfully", deleted),
                data: None,
                deleted_count: Some(deleted),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_user_action, normalize_email};
    use crate::catalog::{ModelCatalog, ModelMetadata};
    use crate::db::Database;
    use crate::models::{PermissionSet, UserAction};
    use std::collections::BTreeMap;

    fn catalog() -> ModelCatalog {
        let mut catalog = ModelCatalog::default();
        for name in ["Post", "Author"] {
            catalog.models.insert(
                name.to_string(),
                ModelMetadata {
                    name: name.to_string(),
                    db_name: None,
                    primary_key: Some("id".to_string()),
                    unique_fields: Vec::new(),
                    fields: Vec::new(),
                },
            );
        }
        catalog
    }

    fn read_only() -> BTreeMap<String, PermissionSet> {
        BTreeMap::from([(
            "Post".to_string(),
            PermissionSet {
                read: true,
                ..PermissionSet::default()
            },
        )])
    }

    #[test]
    fn emails_are_normalized() {
        assert_eq!(normalize_email("  Ann@Example.COM ").expect("email"), "ann@example.com");
        assert!(normalize_email("").is_err());
        assert!(normalize_email("not-an-email").is_err());
    }

    #[test]
    fn create_update_and_delete_flow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("admin.db")).expect("db");
        let catalog = catalog();

        let created = apply_user_action(
            &db,
            &catalog,
            UserAction::Create {
                email: "Ann@example.com".to_string(),
                permissions: read_only(),
            },
        )
        .expect("create");
        let ann = created.data.expect("user");
        assert_eq!(ann.email, "ann@example.com");

        let duplicate = apply_user_action(
            &db,
            &catalog,
            UserAction::Create {
                email: "ann@example.com".to_string(),
                permissions: BTreeMap::new(),
            },
        )
        .expect_err("duplicate");
        assert!(duplicate.to_string().starts_with("CONFLICT"));

        let bob = apply_user_action(
            &db,
            &catalog,
            UserAction::Create {
                email: "bob@example.com".to_string(),
                permissions: BTreeMap::new(),
            },
        )
        .expect("bob")
        .data
        .expect("user");

        let clash = apply_user_action(
            &db,
            &catalog,
            UserAction::Update {
                id: bob.id.clone(),
                email: "ann@example.com".to_string(),
                permissions: BTreeMap::new(),
            },
        )
        .expect_err("email clash");
        assert!(clash.to_string().starts_with("CONFLICT"));

        let unknown = apply_user_action(
            &db,
            &catalog,
            UserAction::Update {
                id: bob.id.clone(),
                email: "bob@example.com".to_string(),
                permissions: BTreeMap::from([("Ghost".to_string(), PermissionSet::default())]),
            },
        )
        .expect_err("unknown model");
        assert!(unknown.to_string().contains("Ghost"));

        let bulk = apply_user_action(
            &db,
            &catalog,
            UserAction::DeleteBulk {
                ids: vec![ann.id, bob.id],
            },
        )
        .expect("bulk");
        assert_eq!(bulk.deleted_count, Some(2));
    }

    #[test]
    fn deleting_missing_user_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("admin.db")).expect("db");
        let error = apply_user_action(
            &db,
            &catalog(),
            UserAction::DeleteSingle {
                id: "missing".to_string(),
            },
        )
        .expect_err("missing");
        assert!(error.to_string().starts_with("NOT_FOUND"));
    }
}
