//! Authentication route handlers
//!
//! Provides login, register, refresh, and current-user endpoints, plus the
//! admin switch that enables or disables an account.

use crate::audit::{AuditEvent, AuditEventType};
use crate::auth::{
    check_password_strength, hash_password, require_role, verify_password, Claims, Role,
    TokenPair, TokenType,
};
use crate::error::{not_found_error, ApiResult, AppError};
use crate::state::SharedState;
use crate::users::{User, UserResponse};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

// ============================================
// Request/Response Types
// ============================================

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email)]
    pub email: String,
    pub password: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(alias = "refresh_token")]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UserStatusRequest {
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub user: UserResponse,
    pub tokens: TokenPair,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub success: bool,
    pub tokens: TokenPair,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub success: bool,
    pub user: UserResponse,
}

// ============================================
// Route Handlers
// ============================================

/// POST /v1/auth/login
///
/// Authenticate with email and password, receive JWT tokens.
pub async fn login(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    req.validate()?;

    let user = match state.users.find_by_email(&req.email).await {
        Some(user) => user,
        None => return Err(login_failed(&state, &req.email, "unknown_user").await),
    };
    if !verify_password(&req.password, &user.password_hash)? {
        return Err(login_failed(&state, &req.email, "bad_password").await);
    }

    if !user.is_active {
        state
            .audit
            .record(
                AuditEvent::new(AuditEventType::LoginFailed, "user")
                    .actor(format!("user:{}", user.id))
                    .resource(user.id.to_string())
                    .details(json!({ "reason": "account_disabled" })),
            )
            .await;
        return Err(AppError::Authorization("Account is disabled".to_string()));
    }

    let tokens = state.jwt.create_tokens(&user)?;

    state
        .audit
        .record(
            AuditEvent::new(AuditEventType::UserLogin, "user")
                .actor(format!("user:{}", user.id))
                .resource(user.id.to_string()),
        )
        .await;
    info!("User {} logged in", user.email);

    Ok(Json(AuthResponse {
        success: true,
        user: UserResponse::from(&user),
        tokens,
    }))
}

/// Record the failed attempt without revealing which half was wrong
async fn login_failed(state: &SharedState, email: &str, reason: &str) -> AppError {
    state.metrics.record_auth_failure();
    state
        .audit
        .record(
            AuditEvent::new(AuditEventType::LoginFailed, "user")
                .actor(format!("email:{}", email.trim().to_lowercase()))
                .details(json!({ "reason": reason })),
        )
        .await;
    AppError::Authentication("Invalid email or password".to_string())
}

/// POST /v1/auth/register
///
/// Register a new account. New users get the Analyst role with low clearance.
pub async fn register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    req.validate()?;
    check_password_strength(&req.password, state.password_min_length)?;

    let password_hash = hash_password(&req.password)?;
    let user = User::new(&req.email, &password_hash, req.name.trim(), Role::Analyst);
    let created = state.users.create(user).await?;

    let tokens = state.jwt.create_tokens(&created)?;
    info!("Registered user {}", created.email);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            success: true,
            user: UserResponse::from(&created),
            tokens,
        }),
    ))
}

/// POST /v1/auth/refresh
///
/// Exchange a refresh token for a new token pair.
pub async fn refresh(
    State(state): State<SharedState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let claims = state.jwt.decode_typed(&req.refresh_token, TokenType::Refresh)?;

    // Role or clearance may have changed since the token was issued
    let user = state
        .users
        .find_by_id(claims.sub)
        .await
        .ok_or_else(|| AppError::Authentication("User no longer exists".to_string()))?;
    if !user.is_active {
        return Err(AppError::Authorization("Account is disabled".to_string()));
    }

    Ok(Json(TokenResponse {
        success: true,
        tokens: state.jwt.create_tokens(&user)?,
    }))
}

/// GET /v1/auth/me
pub async fn me(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<MeResponse>> {
    let user = state
        .users
        .find_by_id(claims.sub)
        .await
        .ok_or_else(|| not_found_error("User not found"))?;

    Ok(Json(MeResponse {
        success: true,
        user: UserResponse::from(&user),
    }))
}

/// POST /v1/admin/users/{id}/status
///
/// Enable or disable an account. Disabled accounts cannot log in or refresh.
pub async fn set_user_status(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<UserStatusRequest>,
) -> ApiResult<Json<MeResponse>> {
    require_role(&claims, Role::Admin)?;
    if id == claims.sub && !req.active {
        return Err(AppError::Validation(
            "Administrators cannot disable their own account".to_string(),
        ));
    }

    let user = state.users.set_active(id, req.active).await?;

    state
        .audit
        .record(
            AuditEvent::new(AuditEventType::UserStatusChanged, "user")
                .actor(format!("user:{}", claims.sub))
                .resource(user.id.to_string())
                .details(json!({ "active": user.is_active })),
        )
        .await;
    info!(
        "User {} {} by {}",
        user.email,
        if user.is_active { "enabled" } else { "disabled" },
        claims.email
    );

    Ok(Json(MeResponse {
        success: true,
        user: UserResponse::from(&user),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DatasetCatalog;
    use crate::config::Settings;
    use crate::query::DetachedEngine;
    use crate::ratelimit::InMemoryCounterStore;
    use crate::state::AppState;
    use std::sync::Arc;

    fn state() -> SharedState {
        Arc::new(AppState::new(
            &Settings::default(),
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(DetachedEngine),
            DatasetCatalog::builtin(),
        ))
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let state = state();
        let (status, Json(registered)) = register(
            State(state.clone()),
            Json(RegisterRequest {
                email: "New.Analyst@bank.example".to_string(),
                password: "correct-horse-42".to_string(),
                name: "New Analyst".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(registered.user.email, "new.analyst@bank.example");
        assert_eq!(registered.user.role, Role::Analyst);

        let Json(logged_in) = login(
            State(state.clone()),
            Json(LoginRequest {
                email: "new.analyst@bank.example".to_string(),
                password: "correct-horse-42".to_string(),
            }),
        )
        .await
        .unwrap();
        let claims = state
            .jwt
            .decode_typed(&logged_in.tokens.access_token, TokenType::Access)
            .unwrap();
        assert_eq!(claims.sub, registered.user.id);

        let Json(refreshed) = refresh(
            State(state.clone()),
            Json(RefreshRequest {
                refresh_token: logged_in.tokens.refresh_token,
            }),
        )
        .await
        .unwrap();
        assert!(refreshed.success);
    }

    #[tokio::test]
    async fn test_weak_password_rejected() {
        let err = register(
            State(state()),
            Json(RegisterRequest {
                email: "weak@bank.example".to_string(),
                password: "short1".to_string(),
                name: "Weak".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_disabled_account_is_forbidden() {
        let state = state();
        let user = User::new(
            "gone@bank.example",
            &hash_password("correct-horse-42").unwrap(),
            "Gone",
            Role::Analyst,
        );
        let user = state.users.create(user).await.unwrap();
        state.users.set_active(user.id, false).await.unwrap();

        let err = login(
            State(state.clone()),
            Json(LoginRequest {
                email: "gone@bank.example".to_string(),
                password: "correct-horse-42".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
    }

    async fn access_claims(state: &SharedState, user: &User) -> Claims {
        let tokens = state.jwt.create_tokens(user).unwrap();
        state
            .jwt
            .decode_typed(&tokens.access_token, TokenType::Access)
            .unwrap()
    }

    #[tokio::test]
    async fn test_admin_disables_and_reenables_account() {
        let state = state();
        let admin = User::new(
            "root@bank.example",
            &hash_password("correct-horse-42").unwrap(),
            "Root",
            Role::Admin,
        );
        let admin = state.users.create(admin).await.unwrap();
        let analyst = User::new(
            "leaving@bank.example",
            &hash_password("correct-horse-42").unwrap(),
            "Leaving",
            Role::Analyst,
        );
        let analyst = state.users.create(analyst).await.unwrap();
        let admin_claims = access_claims(&state, &admin).await;

        let Json(updated) = set_user_status(
            State(state.clone()),
            Extension(admin_claims.clone()),
            Path(analyst.id),
            Json(UserStatusRequest { active: false }),
        )
        .await
        .unwrap();
        assert!(!updated.user.is_active);

        let login_as_analyst = || {
            login(
                State(state.clone()),
                Json(LoginRequest {
                    email: "leaving@bank.example".to_string(),
                    password: "correct-horse-42".to_string(),
                }),
            )
        };
        let err = login_as_analyst().await.unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));

        set_user_status(
            State(state.clone()),
            Extension(admin_claims),
            Path(analyst.id),
            Json(UserStatusRequest { active: true }),
        )
        .await
        .unwrap();
        assert!(login_as_analyst().await.is_ok());

        let filter = crate::audit::AuditFilter {
            event_type: Some(AuditEventType::UserStatusChanged),
            ..Default::default()
        };
        assert_eq!(state.audit.query(&filter, 10, 0).await.total, 2);
    }

    #[tokio::test]
    async fn test_status_change_requires_admin() {
        let state = state();
        let analyst = User::new(
            "plain@bank.example",
            &hash_password("correct-horse-42").unwrap(),
            "Plain",
            Role::Analyst,
        );
        let analyst = state.users.create(analyst).await.unwrap();
        let claims = access_claims(&state, &analyst).await;

        let err = set_user_status(
            State(state.clone()),
            Extension(claims.clone()),
            Path(analyst.id),
            Json(UserStatusRequest { active: false }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
        assert!(state.users.find_by_id(analyst.id).await.unwrap().is_active);

        let missing = set_user_status(
            State(state.clone()),
            Extension(Claims {
                role: Role::Admin,
                ..claims
            }),
            Path(Uuid::new_v4()),
            Json(UserStatusRequest { active: false }),
        )
        .await
        .unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));
    }
}
