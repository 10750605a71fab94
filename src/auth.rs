use crate::catalog::ModelCatalog;
use crate::config::SessionConfig;
use crate::db::{Database, StoredIdentity};
use crate::errors::{AppError, AppResult};
use crate::models::{
    LoginPayload, ModelAction, PermissionSet, RegisterPayload, RegistrationState, SessionResponse, SessionUser,
};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

const MIN_PASSWORD_LEN: usize = 8;

/// Checked against on unknown emails so every login pays for one Argon2 verify.
static DUMMY_PASSWORD_HASH: Lazy<String> =
    Lazy::new(|| hash_password("unknown-identity-placeholder").unwrap_or_default());

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|error| AppError::Internal(format!("Failed to hash password: {}", error)))
}

pub fn verify_password(password: &str, hash: &str) -> AppResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|error| AppError::Internal(format!("Invalid password hash: {}", error)))?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

fn new_session_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn open_session(db: &Database, identity: &StoredIdentity, config: &SessionConfig) -> AppResult<SessionResponse> {
    let token = new_session_token();
    let expires_at = Utc::now() + Duration::hours(config.ttl_hours);
    db.insert_session(&token, &identity.id, expires_at)?;
    Ok(SessionResponse {
        token,
        expires_at,
        user: identity.session_user(),
    })
}

pub fn registration_state(db: &Database) -> AppResult<RegistrationState> {
    Ok(RegistrationState {
        is_super_admin_registration: db.count_identities()? == 0,
    })
}

/// Creates an identity and signs it in. The very first identity becomes the
/// root admin; later ones must match an allowed user email.
pub fn register(db: &Database, payload: &RegisterPayload, config: &SessionConfig) -> AppResult<SessionResponse> {
    let email = crate::users::normalize_email(&payload.email)?;
    if payload.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    let name = payload
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());

    let first_identity = db.count_identities()? == 0;
    if !first_identity && db.find_allowed_user_by_email(&email)?.is_none() {
        return Err(AppError::Policy("Registration is limited to allowed users".to_string()));
    }

    let password_hash = hash_password(&payload.password)?;
    let identity = db.insert_identity(&email, name, &password_hash, first_identity)?;
    tracing::info!(
        identity_id = %identity.id,
        email = %identity.email,
        root_admin = identity.is_root_admin,
        "identity registered"
    );
    open_session(db, &identity, config)
}

pub fn login(db: &Database, payload: &LoginPayload, config: &SessionConfig) -> AppResult<SessionResponse> {
    let invalid = || AppError::Unauthorized("Invalid email or password".to_string());
    let email = payload.email.trim().to_lowercase();
    let Some(identity) = db.find_identity_by_email(&email)? else {
        let _ = verify_password(&payload.password, &DUMMY_PASSWORD_HASH);
        tracing::warn!(email = %email, "login for unknown email");
        return Err(invalid());
    };
    if !verify_password(&payload.password, &identity.password_hash)? {
        tracing::warn!(email = %email, "failed login attempt");
        return Err(invalid());
    }
    tracing::info!(identity_id = %identity.id, "session opened");
    open_session(db, &identity, config)
}

pub fn logout(db: &Database, token: &str) -> AppResult<bool> {
    db.delete_session(token)
}

pub fn session_user(db: &Database, token: &str) -> AppResult<SessionUser> {
    db.find_session(token, Utc::now())?
        .map(|(user, _)| user)
        .ok_or_else(|| AppError::Unauthorized("Session expired or invalid".to_string()))
}

pub fn purge_expired_sessions(db: &Database) -> AppResult<usize> {
    let purged = db.purge_expired_sessions(Utc::now())?;
    if purged > 0 {
        tracing::info!(purged, "expired sessions purged");
    }
    Ok(purged)
}

// ─── Access control ─────────────────────────────────────────────────────────

/// What a signed-in user may do.
#[derive(Debug, Clone)]
pub enum Principal {
    RootAdmin(SessionUser),
    AllowedUser {
        user: SessionUser,
        permissions: BTreeMap<String, PermissionSet>,
    },
}

impl Principal {
    pub fn user(&self) -> &SessionUser {
        match self {
            Self::RootAdmin(user) => user,
            Self::AllowedUser { user, .. } => user,
        }
    }

    pub fn is_root_admin(&self) -> bool {
        matches!(self, Self::RootAdmin(_))
    }

    pub fn authorize(&self, model: &str, action: ModelAction) -> AppResult<()> {
        match self {
            Self::RootAdmin(_) => Ok(()),
            Self::AllowedUser { user, permissions } => {
                if permissions.get(model).is_some_and(|set| set.allows(action)) {
                    Ok(())
                } else {
                    tracing::warn!(email = %user.email, model, action = action.as_str(), "model access denied");
                    Err(AppError::Policy(format!(
                        "You do not have {} permission on {}",
                        action.as_str(),
                        model
                    )))
                }
            }
        }
    }

    pub fn require_root_admin(&self) -> AppResult<()> {
        if self.is_root_admin() {
            Ok(())
        } else {
            Err(AppError::Policy("Only the root administrator can do this".to_string()))
        }
    }

    /// Models shown in the sidebar: everything for root, readable models otherwise.
    pub fn visible_models(&self, catalog: &ModelCatalog) -> Vec<String> {
        catalog
            .model_names()
            .into_iter()
            .filter(|model| self.authorize_quietly(model, ModelAction::Read))
            .collect()
    }

    fn authorize_quietly(&self, model: &str, action: ModelAction) -> bool {
        match self {
            Self::RootAdmin(_) => true,
            Self::AllowedUser { permissions, .. } => permissions.get(model).is_some_and(|set| set.allows(action)),
        }
    }
}

/// Resolves a session token into a principal. Allowed users removed after
/// signing in lose access immediately.
pub fn resolve_principal(db: &Database, token: &str) -> AppResult<Principal> {
    let user = session_user(db, token)?;
    if user.is_root_admin {
        return Ok(Principal::RootAdmin(user));
    }
    let allowed = db
        .find_allowed_user_by_email(&user.email)?
        .ok_or_else(|| AppError::Policy("Your access to this console has been revoked".to_string()))?;
    let permissions = allowed
        .permissions
        .iter()
        .map(|record| (record.model.clone(), record.as_set()))
        .collect();
    Ok(Principal::AllowedUser { user, permissions })
}
