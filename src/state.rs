//! Application state management
//!
//! Contains shared state accessible across all handlers. Stores are
//! constructed once at startup and injected here.

use crate::approval::ApprovalStore;
use crate::audit::AuditLog;
use crate::auth::JwtKeys;
use crate::catalog::DatasetCatalog;
use crate::config::Settings;
use crate::evidence::EvidenceStore;
use crate::guard::PolicyGuard;
use crate::metrics::Metrics;
use crate::query::{ExecutionStore, QueryEngine, QueryOrchestrator};
use crate::ratelimit::{CounterStore, RateLimiter};
use crate::users::UserStore;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Token signing and verification
    pub jwt: JwtKeys,

    pub users: UserStore,

    /// Dataset metadata used by the policy guard
    pub catalog: Arc<DatasetCatalog>,

    /// Append-only audit trail
    pub audit: Arc<AuditLog>,

    pub metrics: Arc<Metrics>,

    pub approvals: Arc<ApprovalStore>,

    /// Sealed evidence packs keyed by execution id
    pub evidence: Arc<EvidenceStore>,

    pub executions: Arc<ExecutionStore>,

    /// Single entry point for query submission
    pub orchestrator: QueryOrchestrator,

    /// Builds the per-class rate limiting stages
    pub limiter: RateLimiter,

    pub password_min_length: usize,
}

impl AppState {
    pub fn new(
        settings: &Settings,
        counters: Arc<dyn CounterStore>,
        engine: Arc<dyn QueryEngine>,
        catalog: DatasetCatalog,
    ) -> Self {
        let audit = Arc::new(AuditLog::new());
        let metrics = Arc::new(Metrics::new());
        let catalog = Arc::new(catalog);
        let approvals = Arc::new(ApprovalStore::new());
        let evidence = Arc::new(EvidenceStore::new(&settings.evidence));
        let executions = Arc::new(ExecutionStore::new());

        let guard = Arc::new(PolicyGuard::new(
            counters.clone(),
            audit.clone(),
            settings.policy.daily_query_budget,
        ));

        let orchestrator = QueryOrchestrator {
            catalog: catalog.clone(),
            guard,
            approvals: approvals.clone(),
            evidence: evidence.clone(),
            executions: executions.clone(),
            engine,
            audit: audit.clone(),
            metrics: metrics.clone(),
            approval_ttl: chrono::Duration::hours(settings.policy.approval_ttl_hours),
        };

        let limiter = RateLimiter::new(
            counters,
            settings.rate_limits.clone(),
            metrics.clone(),
            audit.clone(),
        );

        Self {
            jwt: JwtKeys::new(&settings.jwt),
            users: UserStore::new(),
            catalog,
            audit,
            metrics,
            approvals,
            evidence,
            executions,
            orchestrator,
            limiter,
            password_min_length: settings.security.password_min_length,
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
