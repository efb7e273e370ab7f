//! Evidence pack builder
//!
//! One pack per terminal execution, describing what was asked, by whom, the
//! policy outcome per dimension and what the engine returned.

use crate::guard::{PolicyDecision, Verdict};
use crate::guard::policy::{
    CHECK_ALLOWED_TABLES, CHECK_CROSS_BORDER, CHECK_PII_ACCESS, CHECK_PURPOSE, CHECK_QUERY_BUDGET,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const RESULT_PASSED: &str = "passed";
pub const RESULT_FAILED: &str = "failed";
pub const RESULT_NOT_EVALUATED: &str = "not_evaluated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryBlock {
    pub sql: String,
    pub natural_language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionBlock {
    pub row_count: u64,
    /// Seconds
    pub execution_time: f64,
    pub status: String,
    pub error: Option<String>,
    /// Whether the statement reached the execution engine
    pub attempted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckEntry {
    pub result: String,
    pub rationale: String,
}

impl CheckEntry {
    fn new(result: &str, rationale: impl Into<String>) -> Self {
        Self {
            result: result.to_string(),
            rationale: rationale.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub source_dataset: String,
    pub query_dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePack {
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: Uuid,
    pub dataset_id: String,
    pub query: QueryBlock,
    pub execution: ExecutionBlock,
    pub policy_checks: BTreeMap<String, CheckEntry>,
    pub lineage: Lineage,
    pub metadata: BTreeMap<String, Value>,
}

impl EvidencePack {
    pub fn is_error(&self) -> bool {
        self.execution.error.is_some()
    }
}

/// SQL gate result as seen by the builder
#[derive(Debug, Clone, PartialEq)]
pub enum SqlGateOutcome {
    Passed,
    Rejected { reason: String, message: String },
}

/// Inputs gathered over one pipeline pass
#[derive(Debug, Clone)]
pub struct EvidenceInput<'a> {
    pub execution_id: Uuid,
    pub user_id: Uuid,
    pub dataset_id: &'a str,
    pub sql: &'a str,
    pub natural_language: Option<&'a str>,
    pub purpose: &'a str,
    pub row_count: u64,
    pub elapsed_secs: f64,
    pub sql_gate: SqlGateOutcome,
    pub decision: Option<&'a PolicyDecision>,
    pub tables: &'a [String],
    pub attempted: bool,
    pub error: Option<String>,
}

fn approval_entry(decision: Option<&PolicyDecision>, error: Option<&str>) -> CheckEntry {
    let Some(decision) = decision else {
        return CheckEntry::new(RESULT_NOT_EVALUATED, "policy guard not reached");
    };
    match (&decision.approval, decision.verdict) {
        (Some(approval), _) => CheckEntry::new(
            "approved",
            format!(
                "approval request {} granted by {}",
                approval.request_id,
                approval
                    .approver_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        ),
        (None, Verdict::RequireApproval) => match error {
            Some(e) => CheckEntry::new("rejected", e),
            None => CheckEntry::new("pending", "high PII dataset requires sign-off"),
        },
        (None, _) => CheckEntry::new("not_required", "dataset does not require sign-off"),
    }
}

/// Assemble the evidence pack. `execution.status` is `error` exactly when an
/// error is supplied, in which case the row count is forced to zero.
pub fn build_evidence_pack(input: EvidenceInput<'_>) -> EvidencePack {
    let mut checks = BTreeMap::new();

    let (sql_result, sql_rationale) = match &input.sql_gate {
        SqlGateOutcome::Passed => (RESULT_PASSED, "single read-only SELECT".to_string()),
        SqlGateOutcome::Rejected { reason, message } => {
            (RESULT_FAILED, format!("{}: {}", reason, message))
        }
    };
    checks.insert("sql_validation".to_string(), CheckEntry::new(sql_result, sql_rationale.clone()));
    checks.insert("read_only".to_string(), CheckEntry::new(sql_result, sql_rationale));

    for name in [
        CHECK_ALLOWED_TABLES,
        CHECK_PII_ACCESS,
        CHECK_CROSS_BORDER,
        CHECK_PURPOSE,
        CHECK_QUERY_BUDGET,
    ] {
        let entry = input
            .decision
            .and_then(|d| d.checks.get(name))
            .map(|outcome| {
                CheckEntry::new(
                    if outcome.passed { RESULT_PASSED } else { RESULT_FAILED },
                    outcome.rationale.clone(),
                )
            })
            .unwrap_or_else(|| CheckEntry::new(RESULT_NOT_EVALUATED, "policy guard not reached"));
        checks.insert(name.to_string(), entry);
    }
    checks.insert(
        "approval".to_string(),
        approval_entry(input.decision, input.error.as_deref()),
    );

    let mut metadata = BTreeMap::new();
    metadata.insert("purpose".to_string(), json!(input.purpose));
    metadata.insert("gateway_version".to_string(), json!(env!("CARGO_PKG_VERSION")));
    if let Some(decision) = input.decision {
        metadata.insert("verdict".to_string(), json!(decision.verdict));
        metadata.insert("reasons".to_string(), json!(decision.reasons));
        metadata.insert("policy_audit_event_id".to_string(), json!(decision.audit_event_id));
        metadata.insert("budget".to_string(), json!(decision.budget));
        metadata.insert("pii_level".to_string(), json!(decision.pii_level));
    }

    let is_error = input.error.is_some();
    EvidencePack {
        execution_id: input.execution_id,
        timestamp: Utc::now(),
        user_id: input.user_id,
        dataset_id: input.dataset_id.to_string(),
        query: QueryBlock {
            sql: input.sql.to_string(),
            natural_language: input.natural_language.map(str::to_string),
        },
        execution: ExecutionBlock {
            row_count: if is_error { 0 } else { input.row_count },
            execution_time: input.elapsed_secs,
            status: if is_error { "error" } else { "success" }.to_string(),
            error: input.error,
            attempted: input.attempted,
        },
        policy_checks: checks,
        lineage: Lineage {
            source_dataset: input.dataset_id.to_string(),
            query_dependencies: input.tables.to_vec(),
        },
        metadata,
    }
}
