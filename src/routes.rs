//! Route definitions and router setup
//!
//! Every route belongs to one rate limiting class. Protected routes run the
//! auth middleware before their rate limiting stage so budgets are keyed by
//! principal rather than address.

mod approval;
mod audit;
mod auth;
mod dataset;
mod query;

use crate::auth::{auth_middleware, require_role, Claims, Role};
use crate::config::Settings;
use crate::error::AppError;
use crate::metrics::{track_requests, MetricsSnapshot};
use crate::ratelimit::{enforce_rate_limit, EndpointClass};
use crate::state::SharedState;
use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;
use validator::Validate;

const DEFAULT_PAGE_SIZE: usize = 50;

/// `?limit&offset` shared by the list endpoints
#[derive(Debug, Default, Deserialize, Validate)]
pub struct Pagination {
    #[validate(range(min = 1, max = 1000))]
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Pagination {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    let cors = build_cors_layer(settings);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let middleware_stack = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    let limiter = &state.limiter;

    // Unauthenticated, budgeted per client address
    let auth_routes = Router::new()
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/register", post(auth::register))
        .route("/v1/auth/refresh", post(auth::refresh))
        .route_layer(middleware::from_fn_with_state(
            limiter.stage(EndpointClass::Auth),
            enforce_rate_limit,
        ));

    let query_routes = Router::new()
        .route("/v1/query/execute", post(query::execute))
        .route_layer(middleware::from_fn_with_state(
            limiter.stage(EndpointClass::Query),
            enforce_rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let sensitive_routes = Router::new()
        .route(
            "/v1/approvals/requests/{id}/action",
            post(approval::act_on_request),
        )
        .route("/v1/admin/users/{id}/status", post(auth::set_user_status))
        .route_layer(middleware::from_fn_with_state(
            limiter.stage(EndpointClass::Sensitive),
            enforce_rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let general_routes = Router::new()
        .route("/v1/auth/me", get(auth::me))
        .route("/v1/query", get(query::history))
        .route("/v1/query/{id}", get(query::get_execution))
        .route(
            "/v1/approvals/requests",
            post(approval::create_request).get(approval::list_requests),
        )
        .route("/v1/approvals/requests/{id}", get(approval::get_request))
        .route("/v1/audit/trail", get(audit::trail))
        .route("/v1/audit/evidence/{id}", get(audit::evidence))
        .route("/v1/datasets", get(dataset::list_datasets))
        .route("/v1/datasets/{id}", get(dataset::get_dataset))
        .route("/v1/metrics", get(metrics_snapshot))
        .route_layer(middleware::from_fn_with_state(
            limiter.stage(EndpointClass::General),
            enforce_rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .merge(auth_routes)
        .merge(query_routes)
        .merge(sensitive_routes)
        .merge(general_routes)
        .layer(middleware::from_fn_with_state(
            state.metrics.clone(),
            track_requests,
        ))
        .layer(middleware_stack)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let layer = if origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        CorsLayer::new().allow_origin(origins)
    };

    layer
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .expose_headers([
            header::RETRY_AFTER,
            header::HeaderName::from_static("x-ratelimit-limit"),
            header::HeaderName::from_static("x-ratelimit-remaining"),
            header::HeaderName::from_static("x-request-id"),
        ])
        .max_age(Duration::from_secs(3600))
}

/// Health check endpoint
async fn health_check(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "stores": {
            "audit_events": state.audit.count().await,
            "evidence_packs": state.evidence.count().await,
            "approval_requests": state.approvals.count().await,
        }
    }))
}

/// GET /v1/metrics (admin only)
async fn metrics_snapshot(
    State(state): State<SharedState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MetricsSnapshot>, AppError> {
    require_role(&claims, Role::Admin)?;
    Ok(Json(state.metrics.snapshot()))
}
