//! Approval request storage
//!
//! Transitions are compare-and-swap under the write lock, so two approvers
//! racing on the same request see exactly one winner.

use super::{ApprovalAction, ApprovalRequest, ApprovalStatus};
use crate::error::AppError;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Thread-safe approval store
pub struct ApprovalStore {
    requests: Arc<RwLock<HashMap<Uuid, ApprovalRequest>>>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a new request
    pub async fn create(&self, request: ApprovalRequest) -> ApprovalRequest {
        let mut requests = self.requests.write().await;
        requests.insert(request.id, request.clone());
        request
    }

    /// Return the requester's pending request for a dataset, creating one if
    /// none exists. The flag is `true` when a new request was created.
    pub async fn open_or_reuse(
        &self,
        dataset_id: &str,
        requested_by: Uuid,
        justification: Option<String>,
    ) -> (ApprovalRequest, bool) {
        let mut requests = self.requests.write().await;
        if let Some(existing) = requests.values().find(|r| {
            r.status == ApprovalStatus::Pending
                && r.dataset_id == dataset_id
                && r.requested_by == requested_by
        }) {
            return (existing.clone(), false);
        }
        let request = ApprovalRequest::new(dataset_id, requested_by, justification);
        requests.insert(request.id, request.clone());
        (request, true)
    }

    /// Get a request by ID
    pub async fn get(&self, id: Uuid) -> Result<ApprovalRequest, AppError> {
        let requests = self.requests.read().await;
        requests
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Approval request {} not found", id)))
    }

    /// List requests newest first, optionally filtered by status
    pub async fn list(&self, status: Option<ApprovalStatus>) -> Vec<ApprovalRequest> {
        let requests = self.requests.read().await;
        let mut list: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Apply an approver's decision. Only `pending` requests transition, once.
    pub async fn act(
        &self,
        id: Uuid,
        approver_id: Uuid,
        action: ApprovalAction,
        comment: Option<String>,
    ) -> Result<ApprovalRequest, AppError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Approval request {} not found", id)))?;

        if request.requested_by == approver_id {
            return Err(AppError::Authorization(
                "Requesters cannot act on their own approval requests".to_string(),
            ));
        }

        if request.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Approval request {} is already {}",
                id, request.status
            )));
        }

        let now = Utc::now();
        request.status = action.target_status();
        request.approver_id = Some(approver_id);
        request.comment = comment;
        request.acted_at = Some(now);
        request.updated_at = now;
        Ok(request.clone())
    }

    /// Most recent approval for this dataset and requester that is still usable
    pub async fn find_live_approval(
        &self,
        dataset_id: &str,
        requested_by: Uuid,
        ttl: Duration,
    ) -> Option<ApprovalRequest> {
        let now = Utc::now();
        let requests = self.requests.read().await;
        requests
            .values()
            .filter(|r| {
                r.dataset_id == dataset_id
                    && r.requested_by == requested_by
                    && r.is_live_approval(ttl, now)
            })
            .max_by_key(|r| r.acted_at)
            .cloned()
    }

    pub async fn count(&self) -> usize {
        self.requests.read().await.len()
    }
}

impl Default for ApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transition_happens_once() {
        let store = ApprovalStore::new();
        let requester = Uuid::new_v4();
        let approver = Uuid::new_v4();
        let request = store
            .create(ApprovalRequest::new("customer_master", requester, None))
            .await;

        let approved = store
            .act(request.id, approver, ApprovalAction::Approve, Some("ok".into()))
            .await
            .unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(approved.approver_id, Some(approver));
        assert!(approved.acted_at.is_some());

        let err = store
            .act(request.id, approver, ApprovalAction::Reject, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(store.get(request.id).await.unwrap().status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_self_approval_forbidden() {
        let store = ApprovalStore::new();
        let requester = Uuid::new_v4();
        let request = store
            .create(ApprovalRequest::new("aml_alerts", requester, None))
            .await;
        let err = store
            .act(request.id, requester, ApprovalAction::Approve, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
        assert_eq!(store.get(request.id).await.unwrap().status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_request_not_found() {
        let store = ApprovalStore::new();
        let err = store
            .act(Uuid::new_v4(), Uuid::new_v4(), ApprovalAction::Approve, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_actions_have_one_winner() {
        let store = Arc::new(ApprovalStore::new());
        let request = store
            .create(ApprovalRequest::new("customer_master", Uuid::new_v4(), None))
            .await;
        let id = request.id;

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                let action = if i % 2 == 0 {
                    ApprovalAction::Approve
                } else {
                    ApprovalAction::Reject
                };
                tokio::spawn(async move { store.act(id, Uuid::new_v4(), action, None).await })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_open_or_reuse_and_live_lookup() {
        let store = ApprovalStore::new();
        let requester = Uuid::new_v4();
        let (first, created) = store.open_or_reuse("customer_master", requester, None).await;
        assert!(created);
        let (second, created) = store.open_or_reuse("customer_master", requester, None).await;
        assert!(!created);
        assert_eq!(first.id, second.id);

        let ttl = Duration::hours(24);
        assert!(store.find_live_approval("customer_master", requester, ttl).await.is_none());
        store
            .act(first.id, Uuid::new_v4(), ApprovalAction::Approve, None)
            .await
            .unwrap();
        let live = store.find_live_approval("customer_master", requester, ttl).await.unwrap();
        assert_eq!(live.id, first.id);
        assert!(store.find_live_approval("aml_alerts", requester, ttl).await.is_none());
        assert_eq!(store.list(Some(ApprovalStatus::Pending)).await.len(), 0);
        assert_eq!(store.count().await, 1);
    }
}
