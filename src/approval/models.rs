//! Approval request models

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(AppError::Validation(format!("Unknown approval status '{}'", other))),
        }
    }
}

/// Approver's decision token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Approve,
    Reject,
}

impl ApprovalAction {
    pub fn target_status(&self) -> ApprovalStatus {
        match self {
            ApprovalAction::Approve => ApprovalStatus::Approved,
            ApprovalAction::Reject => ApprovalStatus::Rejected,
        }
    }
}

impl std::str::FromStr for ApprovalAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(ApprovalAction::Approve),
            "reject" => Ok(ApprovalAction::Reject),
            other => Err(AppError::Validation(format!(
                "Invalid action '{}', expected 'approve' or 'reject'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub dataset_id: String,
    pub requested_by: Uuid,
    pub approver_id: Option<Uuid>,
    pub status: ApprovalStatus,
    /// Why access is needed
    pub justification: Option<String>,
    /// Approver's note
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acted_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(dataset_id: &str, requested_by: Uuid, justification: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            dataset_id: dataset_id.to_string(),
            requested_by,
            approver_id: None,
            status: ApprovalStatus::Pending,
            justification,
            comment: None,
            created_at: now,
            updated_at: now,
            acted_at: None,
        }
    }

    /// Approved and acted on within `ttl`
    pub fn is_live_approval(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Approved
            && self.acted_at.map_or(false, |at| now - at < ttl)
    }
}

/// Reference to the approval that satisfied a `require_approval` verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRef {
    pub request_id: Uuid,
    pub approver_id: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl From<&ApprovalRequest> for ApprovalRef {
    fn from(request: &ApprovalRequest) -> Self {
        Self {
            request_id: request.id,
            approver_id: request.approver_id,
            approved_at: request.acted_at,
        }
    }
}

/// Body of `POST /v1/approvals/requests`
#[derive(Debug, Deserialize, Validate)]
pub struct CreateApprovalRequest {
    #[validate(length(min = 1, max = 128))]
    pub dataset_id: String,
    #[validate(length(max = 2000))]
    pub justification: Option<String>,
    /// Accepted for compatibility; the authenticated principal is always used
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_tokens() {
        assert_eq!("approve".parse::<ApprovalAction>().unwrap(), ApprovalAction::Approve);
        assert_eq!("reject".parse::<ApprovalAction>().unwrap(), ApprovalAction::Reject);
        assert!(matches!(
            "APPROVE".parse::<ApprovalAction>(),
            Err(AppError::Validation(_))
        ));
        assert!("maybe".parse::<ApprovalAction>().is_err());
    }

    #[test]
    fn test_live_approval_expires() {
        let mut request = ApprovalRequest::new("customer_master", Uuid::new_v4(), None);
        let now = Utc::now();
        assert!(!request.is_live_approval(chrono::Duration::hours(24), now));

        request.status = ApprovalStatus::Approved;
        request.acted_at = Some(now - chrono::Duration::hours(2));
        assert!(request.is_live_approval(chrono::Duration::hours(24), now));
        assert!(!request.is_live_approval(chrono::Duration::hours(1), now));
    }
}
