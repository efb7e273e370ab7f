//! Query orchestrator
//!
//! One pipeline pass: SQL gate, dataset lookup, policy guard, optional
//! approval parking, execution and evidence. Every terminal outcome seals
//! exactly one evidence pack; nothing after a failing step runs. An execution
//! gets one guard decision; resuming it after approval settles that decision
//! instead of asking the guard again.

use super::engine::EngineError;
use super::{
    Completion, EvidenceSummary, ExecutionStore, QueryEngine, QueryExecution, QueryOutcome,
    QueryRequest, QueryResult, QueryStatus,
};
use crate::approval::{ApprovalRef, ApprovalRequest, ApprovalStatus, ApprovalStore};
use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::auth::Principal;
use crate::catalog::{Dataset, DatasetCatalog, PiiLevel};
use crate::error::{AppError, QueryFailure, QueryFailureKind};
use crate::evidence::{build_evidence_pack, EvidenceInput, EvidenceRecord, EvidenceStore, SqlGateOutcome};
use crate::guard::sql::referenced_tables;
use crate::guard::{validate_sql, PolicyDecision, PolicyGuard, PolicyInput, ValidatedSql, Verdict};
use crate::metrics::Metrics;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct QueryOrchestrator {
    pub catalog: Arc<DatasetCatalog>,
    pub guard: Arc<PolicyGuard>,
    pub approvals: Arc<ApprovalStore>,
    pub evidence: Arc<EvidenceStore>,
    pub executions: Arc<ExecutionStore>,
    pub engine: Arc<dyn QueryEngine>,
    pub audit: Arc<AuditLog>,
    pub metrics: Arc<Metrics>,
    pub approval_ttl: chrono::Duration,
}

/// What the evidence pack records about a pass that reached a terminal state
struct Terminal<'a> {
    sql_gate: SqlGateOutcome,
    decision: Option<&'a PolicyDecision>,
    tables: &'a [String],
    attempted: bool,
    row_count: u64,
    elapsed: Duration,
    /// Internal error text kept in evidence and audit but not returned to callers
    detail: Option<String>,
}

impl<'a> Terminal<'a> {
    /// Stopped before anything reached the engine
    fn not_attempted(
        sql_gate: SqlGateOutcome,
        decision: Option<&'a PolicyDecision>,
        tables: &'a [String],
        elapsed: Duration,
    ) -> Self {
        Self {
            sql_gate,
            decision,
            tables,
            attempted: false,
            row_count: 0,
            elapsed,
            detail: None,
        }
    }
}

/// Text returned to the caller for an engine failure. Database errors can
/// name schema objects, so only their category leaves the gateway.
fn public_engine_message(e: &EngineError) -> String {
    match e {
        EngineError::Timeout(_) | EngineError::Unavailable => {
            format!("Query execution failed: {}", e)
        }
        EngineError::Database(_) => "Query execution failed: the database rejected the statement".to_string(),
        EngineError::Pool(_) => "Query execution failed: no database connection available".to_string(),
    }
}

impl QueryOrchestrator {
    /// Register a new execution for `principal` and run it through the pipeline
    pub async fn submit(
        &self,
        principal: &Principal,
        request: QueryRequest,
    ) -> Result<QueryOutcome, AppError> {
        let execution = QueryExecution::new(principal, &request);
        info!(
            "query {} submitted by {} against {}",
            execution.id, principal.id, execution.dataset_id
        );
        self.executions.insert(execution.clone()).await;
        self.run_pipeline(execution).await
    }

    /// SQL gate and dataset lookup. Failures are sealed before returning.
    async fn admit(
        &self,
        execution: &QueryExecution,
        started: Instant,
    ) -> Result<(ValidatedSql, Dataset), AppError> {
        let validated = match validate_sql(&execution.sql) {
            Ok(validated) => validated,
            Err(violation) => {
                if let Some(keyword) = violation.keyword() {
                    warn!("query {} uses disallowed keyword {}", execution.id, keyword);
                }
                let reason = violation.reason.code();
                let message = violation.message();
                return Err(self
                    .fail(
                        execution,
                        QueryFailureKind::SqlValidation,
                        message.clone(),
                        vec![reason.clone()],
                        Terminal::not_attempted(
                            SqlGateOutcome::Rejected { reason, message },
                            None,
                            &[],
                            started.elapsed(),
                        ),
                    )
                    .await);
            }
        };

        let Some(dataset) = self.catalog.get(&execution.dataset_id).await else {
            return Err(self
                .fail(
                    execution,
                    QueryFailureKind::UnknownDataset,
                    format!("Unknown dataset '{}'", execution.dataset_id),
                    vec!["unknown_dataset".to_string()],
                    Terminal::not_attempted(
                        SqlGateOutcome::Passed,
                        None,
                        &validated.tables,
                        started.elapsed(),
                    ),
                )
                .await);
        };

        Ok((validated, dataset))
    }

    async fn run_pipeline(&self, execution: QueryExecution) -> Result<QueryOutcome, AppError> {
        let started = Instant::now();
        let (validated, dataset) = self.admit(&execution, started).await?;

        let approval = if dataset.pii_level == PiiLevel::High {
            self.approvals
                .find_live_approval(&dataset.id, execution.user_id, self.approval_ttl)
                .await
                .map(|request| ApprovalRef::from(&request))
        } else {
            None
        };

        let evaluation = self
            .guard
            .evaluate(PolicyInput {
                execution_id: execution.id,
                dataset: &dataset,
                principal: &execution.principal,
                purpose: &execution.purpose,
                tables: &validated.tables,
                approval,
            })
            .await;
        let decision = match evaluation {
            Ok(decision) => decision,
            Err(e) => {
                error!("policy evaluation failed for {}: {}", execution.id, e);
                self.seal_unavailable(&execution, &validated.tables, started.elapsed(), &e)
                    .await;
                return Err(e);
            }
        };
        self.executions.set_decision(execution.id, &decision).await?;
        debug!(
            "query {} verdict {} (allowed: {})",
            execution.id,
            decision.verdict.as_str(),
            decision.is_allowed()
        );

        self.carry_out(&execution, &validated, &dataset, decision, started)
            .await
    }

    /// Act on a decision: refuse, park or execute
    async fn carry_out(
        &self,
        execution: &QueryExecution,
        validated: &ValidatedSql,
        dataset: &Dataset,
        decision: PolicyDecision,
        started: Instant,
    ) -> Result<QueryOutcome, AppError> {
        match decision.verdict {
            Verdict::Deny => {
                self.metrics.record_policy_denial();
                return Err(self
                    .fail(
                        execution,
                        QueryFailureKind::PolicyDenied,
                        format!(
                            "Access to dataset '{}' denied: {}",
                            dataset.id,
                            decision.reasons.join(", ")
                        ),
                        decision.reasons.clone(),
                        Terminal::not_attempted(
                            SqlGateOutcome::Passed,
                            Some(&decision),
                            &validated.tables,
                            started.elapsed(),
                        ),
                    )
                    .await);
            }
            Verdict::RequireApproval => return self.park(execution).await,
            Verdict::Allow => {}
        }

        self.executions.try_start(execution.id).await?;
        let run_started = Instant::now();
        let result = self.engine.run(&validated.sql).await;
        let elapsed = run_started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        match result {
            Ok(output) => {
                let row_count = output.rows.len() as u64;
                let record = self
                    .seal(
                        execution,
                        Terminal {
                            sql_gate: SqlGateOutcome::Passed,
                            decision: Some(&decision),
                            tables: &validated.tables,
                            attempted: true,
                            row_count,
                            elapsed,
                            detail: None,
                        },
                        None,
                    )
                    .await?;

                self.metrics.record_query(&dataset.id, true, row_count, elapsed_ms);
                self.audit
                    .record(
                        AuditEvent::new(AuditEventType::QueryExecuted, "query_execution")
                            .actor(execution.principal.identity())
                            .resource(execution.id.to_string())
                            .details(json!({
                                "dataset_id": dataset.id,
                                "row_count": row_count,
                                "duration_ms": elapsed_ms,
                                "evidence_hash": record.content_hash,
                            })),
                    )
                    .await;
                info!(
                    "query {} returned {} rows in {}ms",
                    execution.id, row_count, elapsed_ms
                );

                Ok(QueryOutcome::Completed(Box::new(QueryResult {
                    execution_id: execution.id,
                    status: QueryStatus::Success,
                    columns: output.columns,
                    data: output.rows,
                    row_count,
                    execution_time: elapsed.as_secs_f64(),
                    evidence: EvidenceSummary::from(&record),
                    policy_decision: decision,
                })))
            }
            Err(e) => {
                warn!("query {} failed in the engine: {}", execution.id, e);
                self.metrics.record_query(&dataset.id, false, 0, elapsed_ms);
                Err(self
                    .fail(
                        execution,
                        QueryFailureKind::Execution,
                        public_engine_message(&e),
                        vec!["execution_error".to_string()],
                        Terminal {
                            sql_gate: SqlGateOutcome::Passed,
                            decision: Some(&decision),
                            tables: &validated.tables,
                            attempted: true,
                            row_count: 0,
                            elapsed,
                            detail: Some(format!("Query execution failed: {}", e)),
                        },
                    )
                    .await)
            }
        }
    }

    /// Hold the execution until a human decides. Reuses an open request.
    async fn park(&self, execution: &QueryExecution) -> Result<QueryOutcome, AppError> {
        let (request, created) = self
            .approvals
            .open_or_reuse(
                &execution.dataset_id,
                execution.user_id,
                Some(execution.purpose.clone()),
            )
            .await;

        if created {
            self.metrics.record_approval_requested();
            self.audit
                .record(
                    AuditEvent::new(AuditEventType::ApprovalRequested, "approval_request")
                        .actor(execution.principal.identity())
                        .resource(request.id.to_string())
                        .details(json!({
                            "dataset_id": request.dataset_id,
                            "execution_id": execution.id,
                        })),
                )
                .await;
        }

        let parked = self.executions.park(execution.id, request.id).await?;
        info!(
            "query {} parked on approval request {}",
            execution.id, request.id
        );
        Ok(QueryOutcome::PendingApproval {
            execution: Box::new(parked),
            approval: request,
        })
    }

    /// Continue every execution parked on `approval` now that it is decided.
    /// Returns how many executions were processed.
    pub async fn resume_parked(&self, approval: &ApprovalRequest) -> usize {
        let parked = self.executions.parked_on(approval.id).await;
        let count = parked.len();

        for execution in parked {
            let id = execution.id;
            match approval.status {
                ApprovalStatus::Approved => match self.resume_approved(execution, approval).await {
                    Ok(QueryOutcome::Completed(_)) => info!("parked query {} completed", id),
                    Ok(QueryOutcome::PendingApproval { .. }) => {
                        warn!("parked query {} still awaits approval", id)
                    }
                    Err(e) => warn!("parked query {} failed on resume: {}", id, e),
                },
                ApprovalStatus::Rejected => {
                    let tables = referenced_tables(&execution.sql).unwrap_or_default();
                    let decision = execution.policy_decision.clone();
                    let err = self
                        .fail(
                            &execution,
                            QueryFailureKind::ApprovalRejected,
                            format!("Approval request {} was rejected", approval.id),
                            vec!["approval_rejected".to_string()],
                            Terminal::not_attempted(
                                SqlGateOutcome::Passed,
                                decision.as_ref(),
                                &tables,
                                Duration::ZERO,
                            ),
                        )
                        .await;
                    match err {
                        AppError::Query(_) => info!("parked query {} closed as rejected", id),
                        other => error!("could not close rejected query {}: {}", id, other),
                    }
                }
                ApprovalStatus::Pending => {}
            }
        }
        count
    }

    /// Settle the parked execution's own decision with the approval and run it
    async fn resume_approved(
        &self,
        execution: QueryExecution,
        approval: &ApprovalRequest,
    ) -> Result<QueryOutcome, AppError> {
        let Some(original) = execution.policy_decision.clone() else {
            // Parked without a recorded decision; evaluate it now
            return self.run_pipeline(execution).await;
        };

        let started = Instant::now();
        let (validated, dataset) = self.admit(&execution, started).await?;
        let decision = original.with_approval(ApprovalRef::from(approval));
        debug!(
            "query {} settled by approval {} as {}",
            execution.id,
            approval.id,
            decision.verdict.as_str()
        );
        self.carry_out(&execution, &validated, &dataset, decision, started)
            .await
    }

    /// Seal the pass when the guard could not be consulted. The caller still
    /// receives the underlying error.
    async fn seal_unavailable(
        &self,
        execution: &QueryExecution,
        tables: &[String],
        elapsed: Duration,
        cause: &AppError,
    ) {
        let message = "policy evaluation unavailable".to_string();
        let terminal = Terminal::not_attempted(SqlGateOutcome::Passed, None, tables, elapsed);
        match self.seal(execution, terminal, Some(message.clone())).await {
            Ok(record) => {
                self.record_failure(
                    execution,
                    "POLICY_UNAVAILABLE",
                    &message,
                    Some(cause.to_string()),
                    &["policy_unavailable".to_string()],
                    &record,
                )
                .await
            }
            Err(seal_error) => {
                error!("could not seal evidence for {}: {}", execution.id, seal_error)
            }
        }
    }

    /// Build and store the evidence pack, then mark the execution terminal
    async fn seal(
        &self,
        execution: &QueryExecution,
        terminal: Terminal<'_>,
        error: Option<String>,
    ) -> Result<EvidenceRecord, AppError> {
        let status = if error.is_some() {
            QueryStatus::Error
        } else {
            QueryStatus::Success
        };

        let pack = build_evidence_pack(EvidenceInput {
            execution_id: execution.id,
            user_id: execution.user_id,
            dataset_id: &execution.dataset_id,
            sql: &execution.sql,
            natural_language: execution.natural_language.as_deref(),
            purpose: &execution.purpose,
            row_count: terminal.row_count,
            elapsed_secs: terminal.elapsed.as_secs_f64(),
            sql_gate: terminal.sql_gate,
            decision: terminal.decision,
            tables: terminal.tables,
            attempted: terminal.attempted,
            error: error.clone(),
        });
        let row_count = pack.execution.row_count;
        let record = self.evidence.append(pack).await?;

        self.executions
            .finish(
                execution.id,
                Completion {
                    status,
                    row_count,
                    duration_ms: terminal.elapsed.as_millis() as u64,
                    error,
                    evidence_hash: record.content_hash.clone(),
                },
            )
            .await?;
        Ok(record)
    }

    /// Seal a failed pass and turn it into the error returned to the caller
    async fn fail(
        &self,
        execution: &QueryExecution,
        kind: QueryFailureKind,
        message: String,
        reasons: Vec<String>,
        mut terminal: Terminal<'_>,
    ) -> AppError {
        let detail = terminal.detail.take();
        let recorded = detail.clone().unwrap_or_else(|| message.clone());
        let record = match self.seal(execution, terminal, Some(recorded)).await {
            Ok(record) => record,
            Err(e) => return e,
        };

        self.record_failure(execution, kind.code(), &message, detail, &reasons, &record)
            .await;

        AppError::Query(Box::new(QueryFailure {
            execution_id: execution.id,
            kind,
            message,
            evidence_hash: record.content_hash,
            reasons,
        }))
    }

    async fn record_failure(
        &self,
        execution: &QueryExecution,
        code: &str,
        message: &str,
        detail: Option<String>,
        reasons: &[String],
        record: &EvidenceRecord,
    ) {
        self.audit
            .record(
                AuditEvent::new(AuditEventType::QueryFailed, "query_execution")
                    .actor(execution.principal.identity())
                    .resource(execution.id.to_string())
                    .details(json!({
                        "dataset_id": execution.dataset_id,
                        "error": code,
                        "message": message,
                        "detail": detail,
                        "reasons": reasons,
                        "evidence_hash": record.content_hash,
                    })),
            )
            .await;
    }
}
