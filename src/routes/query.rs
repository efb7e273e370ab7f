//! Query Routes
//!
//! Submission, polling and history of governed queries.

use super::Pagination;
use crate::approval::ApprovalRequest;
use crate::auth::{require_role, Claims, Principal, Role};
use crate::error::{not_found_error, ApiResult};
use crate::query::{QueryExecution, QueryOutcome, QueryRequest, QueryResult};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize)]
pub struct CompletedResponse {
    pub success: bool,
    #[serde(flatten)]
    pub result: QueryResult,
}

#[derive(Debug, Serialize)]
pub struct PendingApprovalResponse {
    pub success: bool,
    pub status: &'static str,
    pub execution_id: Uuid,
    pub approval_request_id: Uuid,
    pub message: String,
    pub approval: ApprovalRequest,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub success: bool,
    pub execution: QueryExecution,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub executions: Vec<QueryExecution>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// POST /v1/query/execute
///
/// 200 with rows and evidence, or 202 while the dataset awaits approval.
pub async fn execute(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Response> {
    require_role(&claims, Role::Analyst)?;
    req.validate()?;

    let principal = Principal::from(&claims);
    let response = match state.orchestrator.submit(&principal, req).await? {
        QueryOutcome::Completed(result) => (
            StatusCode::OK,
            Json(CompletedResponse {
                success: true,
                result: *result,
            }),
        )
            .into_response(),
        QueryOutcome::PendingApproval { execution, approval } => (
            StatusCode::ACCEPTED,
            Json(PendingApprovalResponse {
                success: true,
                status: "pending_approval",
                execution_id: execution.id,
                approval_request_id: approval.id,
                message: format!(
                    "Dataset '{}' holds high-PII data; the query runs once request {} is approved",
                    execution.dataset_id, approval.id
                ),
                approval,
            }),
        )
            .into_response(),
    };
    Ok(response)
}

/// GET /v1/query/{id}
///
/// Other users' executions are invisible unless the caller is an admin.
pub async fn get_execution(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionResponse>> {
    let execution = state.executions.get(id).await?;
    if execution.user_id != claims.sub && !claims.role.is_admin() {
        return Err(not_found_error(format!("Query execution {} not found", id)));
    }

    Ok(Json(ExecutionResponse {
        success: true,
        execution,
    }))
}

/// GET /v1/query?limit&offset
pub async fn history(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<HistoryResponse>> {
    page.validate()?;
    let (executions, total) = state
        .executions
        .list_for_user(claims.sub, page.limit(), page.offset())
        .await;

    Ok(Json(HistoryResponse {
        success: true,
        executions,
        total,
        limit: page.limit(),
        offset: page.offset(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DatasetCatalog, PiiLevel};
    use crate::config::Settings;
    use crate::error::AppError;
    use crate::query::DetachedEngine;
    use crate::ratelimit::InMemoryCounterStore;
    use crate::state::AppState;
    use crate::auth::TokenType;
    use std::sync::Arc;

    fn state() -> SharedState {
        Arc::new(AppState::new(
            &Settings::default(),
            Arc::new(InMemoryCounterStore::new()),
            Arc::new(DetachedEngine),
            DatasetCatalog::builtin(),
        ))
    }

    fn claims(role: Role) -> Claims {
        Claims {
            sub: Uuid::new_v4(),
            email: "someone@bank.example".to_string(),
            role,
            clearance: PiiLevel::Medium,
            jurisdiction: "US".to_string(),
            exp: 0,
            iat: 0,
            token_type: TokenType::Access,
        }
    }

    fn loans_query() -> QueryRequest {
        QueryRequest {
            sql: "SELECT * FROM loans".to_string(),
            dataset_id: "loan_portfolio".to_string(),
            purpose: "credit_risk_reporting".to_string(),
            natural_language: None,
            requested_by: None,
        }
    }

    #[tokio::test]
    async fn test_viewers_cannot_submit() {
        let err = execute(
            State(state()),
            Extension(claims(Role::Viewer)),
            Json(loans_query()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_poll_hides_other_users_executions() {
        let state = state();
        let owner = claims(Role::Analyst);

        // No engine configured, so the execution ends in error but is still recorded
        let err = execute(State(state.clone()), Extension(owner.clone()), Json(loans_query()))
            .await
            .unwrap_err();
        let execution_id = match err {
            AppError::Query(failure) => failure.execution_id,
            other => panic!("expected query failure, got {:?}", other),
        };

        let Json(own) = get_execution(State(state.clone()), Extension(owner.clone()), Path(execution_id))
            .await
            .unwrap();
        assert_eq!(own.execution.id, execution_id);

        let stranger = get_execution(State(state.clone()), Extension(claims(Role::Analyst)), Path(execution_id)).await;
        assert!(matches!(stranger, Err(AppError::NotFound(_))));

        let admin = get_execution(State(state.clone()), Extension(claims(Role::Admin)), Path(execution_id)).await;
        assert!(admin.is_ok());

        let Json(history) = history(State(state), Extension(owner), Query(Pagination::default()))
            .await
            .unwrap();
        assert_eq!(history.total, 1);
        assert_eq!(history.limit, 50);
    }
}
