//! Query execution storage

use super::{Completion, QueryExecution, QueryStatus};
use crate::error::AppError;
use crate::guard::PolicyDecision;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Thread-safe execution store
pub struct ExecutionStore {
    executions: RwLock<HashMap<Uuid, QueryExecution>>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, execution: QueryExecution) {
        self.executions.write().await.insert(execution.id, execution);
    }

    pub async fn get(&self, id: Uuid) -> Result<QueryExecution, AppError> {
        let executions = self.executions.read().await;
        executions
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Query execution {} not found", id)))
    }

    /// Record the guard decision. An execution is decided once.
    pub async fn set_decision(&self, id: Uuid, decision: &PolicyDecision) -> Result<(), AppError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Query execution {} not found", id)))?;
        if execution.policy_decision.is_some() {
            return Err(AppError::Conflict(format!(
                "Query execution {} already has a policy decision",
                id
            )));
        }
        execution.policy_decision = Some(decision.clone());
        Ok(())
    }

    /// Leave the execution pending until the approval request is decided
    pub async fn park(&self, id: Uuid, approval_request_id: Uuid) -> Result<QueryExecution, AppError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Query execution {} not found", id)))?;
        execution.approval_request_id = Some(approval_request_id);
        Ok(execution.clone())
    }

    /// `pending -> running`, at most once
    pub async fn try_start(&self, id: Uuid) -> Result<(), AppError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Query execution {} not found", id)))?;
        if execution.status != QueryStatus::Pending {
            return Err(AppError::Conflict(format!(
                "Query execution {} is already {}",
                id, execution.status
            )));
        }
        execution.status = QueryStatus::Running;
        Ok(())
    }

    /// Write terminal fields. Terminal executions never change again.
    pub async fn finish(&self, id: Uuid, completion: Completion) -> Result<QueryExecution, AppError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Query execution {} not found", id)))?;
        if execution.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Query execution {} already finished as {}",
                id, execution.status
            )));
        }
        execution.status = completion.status;
        execution.row_count = Some(completion.row_count);
        execution.duration_ms = Some(completion.duration_ms);
        execution.error = completion.error;
        execution.evidence_hash = Some(completion.evidence_hash);
        execution.completed_at = Some(Utc::now());
        Ok(execution.clone())
    }

    /// Executions still waiting on an approval request
    pub async fn parked_on(&self, approval_request_id: Uuid) -> Vec<QueryExecution> {
        let executions = self.executions.read().await;
        let mut parked: Vec<QueryExecution> = executions
            .values()
            .filter(|e| {
                e.status == QueryStatus::Pending && e.approval_request_id == Some(approval_request_id)
            })
            .cloned()
            .collect();
        parked.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        parked
    }

    /// A user's history, newest first. Returns the page and the total.
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> (Vec<QueryExecution>, usize) {
        let executions = self.executions.read().await;
        let mut mine: Vec<&QueryExecution> =
            executions.values().filter(|e| e.user_id == user_id).collect();
        mine.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        let total = mine.len();
        (
            mine.into_iter().skip(offset).take(limit).cloned().collect(),
            total,
        )
    }
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}
