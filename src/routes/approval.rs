//! Approval Routes
//!
//! Request, inspect and decide access to high-PII datasets. Deciding a request
//! releases the executions parked on it.

use crate::approval::{ApprovalAction, ApprovalRequest, ApprovalStatus, CreateApprovalRequest};
use crate::audit::{AuditEvent, AuditEventType};
use crate::auth::{require_role, Claims, Role};
use crate::error::{not_found_error, validation_error, ApiResult, AppError};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActionQuery {
    pub action: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequestResponse {
    pub success: bool,
    pub request: ApprovalRequest,
}

#[derive(Debug, Serialize)]
pub struct RequestListResponse {
    pub success: bool,
    pub requests: Vec<ApprovalRequest>,
    pub total: usize,
}

/// Approvers see every request, everyone else only their own
fn can_see(claims: &Claims, request: &ApprovalRequest) -> bool {
    request.requested_by == claims.sub || claims.role.can_approve()
}

/// POST /v1/approvals/requests
pub async fn create_request(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateApprovalRequest>,
) -> ApiResult<(StatusCode, Json<RequestResponse>)> {
    req.validate()?;

    let dataset = state
        .catalog
        .get(&req.dataset_id)
        .await
        .ok_or_else(|| not_found_error(format!("Dataset '{}' not found", req.dataset_id)))?;

    let request = state
        .approvals
        .create(ApprovalRequest::new(&dataset.id, claims.sub, req.justification))
        .await;

    state.metrics.record_approval_requested();
    state
        .audit
        .record(
            AuditEvent::new(AuditEventType::ApprovalRequested, "approval_request")
                .actor(claims.identity())
                .resource(request.id.to_string())
                .details(json!({ "dataset_id": request.dataset_id })),
        )
        .await;
    info!("Approval request {} opened for {}", request.id, request.dataset_id);

    Ok((
        StatusCode::CREATED,
        Json(RequestResponse {
            success: true,
            request,
        }),
    ))
}

/// GET /v1/approvals/requests?status=
pub async fn list_requests(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<RequestListResponse>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ApprovalStatus>)
        .transpose()?;

    let requests: Vec<ApprovalRequest> = state
        .approvals
        .list(status)
        .await
        .into_iter()
        .filter(|r| can_see(&claims, r))
        .collect();

    Ok(Json(RequestListResponse {
        success: true,
        total: requests.len(),
        requests,
    }))
}

/// GET /v1/approvals/requests/{id}
pub async fn get_request(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RequestResponse>> {
    let request = state.approvals.get(id).await?;
    if !can_see(&claims, &request) {
        return Err(not_found_error(format!("Approval request {} not found", id)));
    }

    Ok(Json(RequestResponse {
        success: true,
        request,
    }))
}

/// POST /v1/approvals/requests/{id}/action?action=approve|reject&comment=
pub async fn act_on_request(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Query(query): Query<ActionQuery>,
) -> ApiResult<Json<RequestResponse>> {
    require_role(&claims, Role::Approver)?;

    let action: ApprovalAction = query
        .action
        .as_deref()
        .ok_or_else(|| validation_error("Missing 'action' parameter"))?
        .parse()?;

    let decided = state
        .approvals
        .act(id, claims.sub, action, query.comment)
        .await?;

    let event_type = match decided.status {
        ApprovalStatus::Approved => AuditEventType::ApprovalApproved,
        ApprovalStatus::Rejected => AuditEventType::ApprovalRejected,
        ApprovalStatus::Pending => {
            return Err(AppError::Internal(format!(
                "Approval request {} is still pending after a decision",
                id
            )))
        }
    };
    state
        .audit
        .record(
            AuditEvent::new(event_type, "approval_request")
                .actor(claims.identity())
                .resource(decided.id.to_string())
                .details(json!({
                    "dataset_id": decided.dataset_id,
                    "requested_by": decided.requested_by,
                    "comment": decided.comment,
                })),
        )
        .await;
    info!("Approval request {} {} by {}", decided.id, decided.status, claims.sub);

    let orchestrator = state.orchestrator.clone();
    let released = decided.clone();
    tokio::spawn(async move {
        let resumed = orchestrator.resume_parked(&released).await;
        if resumed > 0 {
            info!("Released {} parked queries for request {}", resumed, released.id);
        }
    });

    Ok(Json(RequestResponse {
        success: true,
        request: decided,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenType;
    use crate::catalog::{DatasetCatalog, PiiLevel};
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

    fn claims(role: Role) -> Claims {
        Claims {
            sub: Uuid::new_v4(),
            email: "someone@bank.example".to_string(),
            role,
            clearance: PiiLevel::High,
            jurisdiction: "US".to_string(),
            exp: 0,
            iat: 0,
            token_type: TokenType::Access,
        }
    }

    async fn open(state: &SharedState, requester: &Claims) -> ApprovalRequest {
        let (status, Json(created)) = create_request(
            State(state.clone()),
            Extension(requester.clone()),
            Json(CreateApprovalRequest {
                dataset_id: "customer_master".to_string(),
                justification: Some("quarterly KYC refresh".to_string()),
                requested_by: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        created.request
    }

    fn action(action: &str) -> Query<ActionQuery> {
        Query(ActionQuery {
            action: Some(action.to_string()),
            comment: None,
        })
    }

    #[tokio::test]
    async fn test_self_approval_is_forbidden() {
        let state = state();
        let approver = claims(Role::Approver);
        let request = open(&state, &approver).await;

        let err = act_on_request(
            State(state.clone()),
            Extension(approver),
            Path(request.id),
            action("approve"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
        assert_eq!(
            state.approvals.get(request.id).await.unwrap().status,
            ApprovalStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_action_errors() {
        let state = state();
        let analyst = claims(Role::Analyst);
        let approver = claims(Role::Approver);
        let request = open(&state, &analyst).await;

        let invalid = act_on_request(
            State(state.clone()),
            Extension(approver.clone()),
            Path(request.id),
            action("escalate"),
        )
        .await;
        assert!(matches!(invalid, Err(AppError::Validation(_))));

        let missing = act_on_request(
            State(state.clone()),
            Extension(approver.clone()),
            Path(Uuid::new_v4()),
            action("approve"),
        )
        .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));

        act_on_request(
            State(state.clone()),
            Extension(approver.clone()),
            Path(request.id),
            action("reject"),
        )
        .await
        .unwrap();
        let again = act_on_request(
            State(state.clone()),
            Extension(approver),
            Path(request.id),
            action("approve"),
        )
        .await;
        assert!(matches!(again, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_listing_is_scoped() {
        let state = state();
        let analyst = claims(Role::Analyst);
        open(&state, &analyst).await;
        open(&state, &claims(Role::Analyst)).await;

        let Json(own) = list_requests(
            State(state.clone()),
            Extension(analyst),
            Query(ListQuery { status: None }),
        )
        .await
        .unwrap();
        assert_eq!(own.total, 1);

        let Json(all) = list_requests(
            State(state.clone()),
            Extension(claims(Role::Approver)),
            Query(ListQuery {
                status: Some("pending".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(all.total, 2);

        let bad = list_requests(
            State(state),
            Extension(claims(Role::Approver)),
            Query(ListQuery {
                status: Some("someday".to_string()),
            }),
        )
        .await;
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn test_unknown_dataset_is_not_found() {
        let err = create_request(
            State(state()),
            Extension(claims(Role::Analyst)),
            Json(CreateApprovalRequest {
                dataset_id: "nope".to_string(),
                justification: None,
                requested_by: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
