//! Audit Routes
//!
//! Read access to the audit trail and to sealed evidence packs.

use super::Pagination;
use crate::audit::{AuditEvent, AuditEventType, AuditFilter};
use crate::auth::{require_role, Claims, Role};
use crate::error::{not_found_error, validation_error, ApiResult};
use crate::evidence::{EvidencePack, Verification};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct TrailQuery {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TrailResponse {
    pub success: bool,
    pub events: Vec<AuditEvent>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct EvidenceResponse {
    pub success: bool,
    pub execution_id: Uuid,
    pub evidence: EvidencePack,
    pub content_hash: String,
    pub signature: String,
    pub verification: Verification,
    pub download_url: String,
    pub stored_at: DateTime<Utc>,
}

/// GET /v1/audit/trail?start_date&end_date&event_type&limit&offset
///
/// Approvers and admins only.
pub async fn trail(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<TrailQuery>,
) -> ApiResult<Json<TrailResponse>> {
    require_role(&claims, Role::Approver)?;
    let page = Pagination {
        limit: query.limit,
        offset: query.offset,
    };
    page.validate()?;

    if let (Some(start), Some(end)) = (query.start_date, query.end_date) {
        if start > end {
            return Err(validation_error("start_date must not be after end_date"));
        }
    }

    let event_type = query
        .event_type
        .as_deref()
        .map(str::parse::<AuditEventType>)
        .transpose()
        .map_err(validation_error)?;

    let filter = AuditFilter {
        start: query.start_date,
        end: query.end_date,
        event_type,
    };
    let limit = page.limit();
    let offset = page.offset();
    let found = state.audit.query(&filter, limit, offset).await;

    Ok(Json(TrailResponse {
        success: true,
        events: found.events,
        total: found.total,
        limit,
        offset,
    }))
}

/// GET /v1/audit/evidence/{id}
///
/// The pack for one execution with a fresh hash and signature check.
pub async fn evidence(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<EvidenceResponse>> {
    let record = state.evidence.get(execution_id).await?;
    if record.pack.user_id != claims.sub && !claims.role.can_approve() {
        return Err(not_found_error(format!(
            "Evidence for execution {} not found",
            execution_id
        )));
    }

    let verification = state.evidence.verify(&record)?;
    if !verification.is_valid() {
        warn!(
            "evidence for {} failed verification (hash: {}, signature: {})",
            execution_id, verification.hash_valid, verification.signature_valid
        );
    }

    Ok(Json(EvidenceResponse {
        success: true,
        execution_id,
        verification,
        content_hash: record.content_hash,
        signature: record.signature,
        download_url: record.object_ref,
        stored_at: record.stored_at,
        evidence: record.pack,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenType;
    use crate::catalog::{DatasetCatalog, PiiLevel};
    use crate::config::Settings;
    use crate::error::AppError;
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
            email: "auditor@bank.example".to_string(),
            role,
            clearance: PiiLevel::Low,
            jurisdiction: "US".to_string(),
            exp: 0,
            iat: 0,
            token_type: TokenType::Access,
        }
    }

    fn query(event_type: Option<&str>) -> Query<TrailQuery> {
        Query(TrailQuery {
            start_date: None,
            end_date: None,
            event_type: event_type.map(str::to_string),
            limit: None,
            offset: None,
        })
    }

    #[tokio::test]
    async fn test_trail_filters_by_type() {
        let state = state();
        state
            .audit
            .record(AuditEvent::new(AuditEventType::UserLogin, "user"))
            .await;
        state
            .audit
            .record(AuditEvent::new(AuditEventType::QueryFailed, "query_execution"))
            .await;

        let Json(all) = trail(State(state.clone()), Extension(claims(Role::Approver)), query(None))
            .await
            .unwrap();
        assert_eq!(all.total, 2);

        let Json(logins) = trail(
            State(state.clone()),
            Extension(claims(Role::Admin)),
            query(Some("user_login")),
        )
        .await
        .unwrap();
        assert_eq!(logins.total, 1);
        assert_eq!(logins.events[0].event_type, AuditEventType::UserLogin);

        let bad = trail(
            State(state.clone()),
            Extension(claims(Role::Admin)),
            query(Some("coffee_break")),
        )
        .await;
        assert!(matches!(bad, Err(AppError::Validation(_))));

        let denied = trail(State(state), Extension(claims(Role::Analyst)), query(None)).await;
        assert!(matches!(denied, Err(AppError::Authorization(_))));
    }

    #[tokio::test]
    async fn test_missing_evidence_is_not_found() {
        let err = evidence(
            State(state()),
            Extension(claims(Role::Admin)),
            Path(Uuid::new_v4()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
