//! Authentication middleware
//!
//! Extracts and validates JWT tokens from requests.

use crate::auth::{Claims, Role, TokenType};
use crate::error::AppError;
use crate::state::SharedState;
use axum::http::header::AUTHORIZATION;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

/// Validate the bearer token and insert its claims into request extensions
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let claims = match bearer_claims(&state, &request) {
        Ok(claims) => claims,
        Err(e) => {
            state.metrics.record_auth_failure();
            debug!("rejected request to {}: {}", request.uri().path(), e);
            return Err(e);
        }
    };

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}

fn bearer_claims(state: &SharedState, request: &Request) -> Result<Claims, AppError> {
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Authentication("Missing authorization header".to_string()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Authentication("Invalid authorization format".to_string()))?;

    state.jwt.decode_typed(token, TokenType::Access)
}

/// Require specific role
pub fn require_role(claims: &Claims, required: Role) -> Result<(), AppError> {
    let has_permission = match required {
        Role::Viewer => true,
        Role::Analyst => claims.role.can_query(),
        Role::Approver => claims.role.can_approve(),
        Role::Admin => claims.role.is_admin(),
    };

    if !has_permission {
        return Err(AppError::Authorization(format!(
            "Requires {} role, you have {}",
            required, claims.role
        )));
    }

    Ok(())
}
