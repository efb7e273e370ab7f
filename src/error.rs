//! Error handling module
//!
//! Provides unified error types and handling for the entire application.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// Which pipeline stage turned a query down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFailureKind {
    SqlValidation,
    UnknownDataset,
    PolicyDenied,
    ApprovalRejected,
    Execution,
}

impl QueryFailureKind {
    pub fn code(&self) -> &'static str {
        match self {
            QueryFailureKind::SqlValidation => "SQL_VALIDATION_FAILED",
            QueryFailureKind::UnknownDataset => "UNKNOWN_DATASET",
            QueryFailureKind::PolicyDenied => "POLICY_DENIED",
            QueryFailureKind::ApprovalRejected => "APPROVAL_REJECTED",
            QueryFailureKind::Execution => "QUERY_EXECUTION_FAILED",
        }
    }
}

/// A terminal query failure. Always tied to an execution and its evidence.
#[derive(Debug, Clone)]
pub struct QueryFailure {
    pub execution_id: Uuid,
    pub kind: QueryFailureKind,
    pub message: String,
    pub evidence_hash: String,
    pub reasons: Vec<String>,
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Counter store error: {0}")]
    CounterStore(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Forbidden: {0}")]
    Authorization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded for {class}: {limit} per window")]
    RateLimited {
        class: String,
        limit: u64,
        retry_after_secs: u64,
    },

    #[error("Query {} failed: {}", .0.execution_id, .0.message)]
    Query(Box<QueryFailure>),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

impl ErrorResponse {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: code.to_string(),
            message: message.into(),
            execution_id: None,
            details: None,
            correlation_id: None,
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Authorization(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) | AppError::Query(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_)
            | AppError::CounterStore(_)
            | AppError::Internal(_)
            | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log an unexpected failure under a fresh correlation id and return a body
    /// that carries no internals.
    fn opaque(&self, code: &str) -> ErrorResponse {
        let correlation_id = Uuid::new_v4();
        error!(%correlation_id, "{}", self);
        ErrorResponse {
            correlation_id: Some(correlation_id),
            ..ErrorResponse::new(code, "An internal error occurred")
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut retry_after = None;

        let body = match &self {
            AppError::Authentication(msg) => ErrorResponse::new("AUTHENTICATION_FAILED", msg.clone()),
            AppError::Authorization(msg) => ErrorResponse::new("FORBIDDEN", msg.clone()),
            AppError::Validation(msg) => ErrorResponse::new("VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => ErrorResponse::new("NOT_FOUND", msg.clone()),
            AppError::Conflict(msg) => ErrorResponse::new("CONFLICT", msg.clone()),
            AppError::RateLimited {
                class,
                limit,
                retry_after_secs,
            } => {
                retry_after = Some(*retry_after_secs);
                ErrorResponse {
                    details: Some(serde_json::json!({
                        "class": class,
                        "limit": limit,
                        "retry_after": retry_after_secs,
                    })),
                    ..ErrorResponse::new(
                        "RATE_LIMIT_EXCEEDED",
                        format!("Too many requests, retry in {} seconds", retry_after_secs),
                    )
                }
            }
            AppError::Query(failure) => {
                warn!(
                    execution_id = %failure.execution_id,
                    code = failure.kind.code(),
                    "query failed: {}",
                    failure.message
                );
                ErrorResponse {
                    execution_id: Some(failure.execution_id),
                    details: Some(serde_json::json!({
                        "evidence_hash": failure.evidence_hash,
                        "reasons": failure.reasons,
                    })),
                    ..ErrorResponse::new(failure.kind.code(), failure.message.clone())
                }
            }
            AppError::Pool(_) => self.opaque("SERVICE_UNAVAILABLE"),
            AppError::Database(_) | AppError::CounterStore(_) | AppError::Internal(_) => {
                self.opaque("INTERNAL_ERROR")
            }
            AppError::Config(_) => self.opaque("CONFIG_ERROR"),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> AppError {
    AppError::NotFound(msg.into())
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}
