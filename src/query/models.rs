//! Query execution models

use crate::approval::ApprovalRequest;
use crate::auth::Principal;
use crate::evidence::EvidenceRecord;
use crate::guard::PolicyDecision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryStatus::Success | QueryStatus::Error)
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStatus::Pending => write!(f, "pending"),
            QueryStatus::Running => write!(f, "running"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

/// Body of `POST /v1/query/execute`
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct QueryRequest {
    #[validate(length(min = 1, max = 100000))]
    pub sql: String,
    #[validate(length(min = 1, max = 128))]
    pub dataset_id: String,
    #[validate(length(min = 1, max = 256))]
    pub purpose: String,
    #[validate(length(max = 4000))]
    pub natural_language: Option<String>,
    /// Ignored; executions always run as the authenticated principal
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryExecution {
    pub id: Uuid,
    pub user_id: Uuid,
    pub sql: String,
    pub natural_language: Option<String>,
    pub dataset_id: String,
    pub purpose: String,
    pub submitted_at: DateTime<Utc>,
    pub status: QueryStatus,
    pub row_count: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub approval_request_id: Option<Uuid>,
    pub evidence_hash: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Latest guard decision for this execution
    pub policy_decision: Option<PolicyDecision>,
    #[serde(skip)]
    pub principal: Principal,
}

impl QueryExecution {
    pub fn new(principal: &Principal, request: &QueryRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: principal.id,
            sql: request.sql.clone(),
            natural_language: request.natural_language.clone(),
            dataset_id: request.dataset_id.clone(),
            purpose: request.purpose.clone(),
            submitted_at: Utc::now(),
            status: QueryStatus::Pending,
            row_count: None,
            duration_ms: None,
            error: None,
            approval_request_id: None,
            evidence_hash: None,
            completed_at: None,
            policy_decision: None,
            principal: principal.clone(),
        }
    }
}

/// Terminal fields written once by the orchestrator
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: QueryStatus,
    pub row_count: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub evidence_hash: String,
}

/// Rows produced by the execution engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
}

/// Evidence reference returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceSummary {
    pub content_hash: String,
    pub signature: String,
    pub download_url: String,
}

impl From<&EvidenceRecord> for EvidenceSummary {
    fn from(record: &EvidenceRecord) -> Self {
        Self {
            content_hash: record.content_hash.clone(),
            signature: record.signature.clone(),
            download_url: record.object_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub execution_id: Uuid,
    pub status: QueryStatus,
    pub columns: Vec<String>,
    pub data: Vec<Value>,
    pub row_count: u64,
    /// Seconds
    pub execution_time: f64,
    pub evidence: EvidenceSummary,
    pub policy_decision: PolicyDecision,
}

/// What a pipeline pass ended with, short of a failure
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Completed(Box<QueryResult>),
    PendingApproval {
        execution: Box<QueryExecution>,
        approval: ApprovalRequest,
    },
}
