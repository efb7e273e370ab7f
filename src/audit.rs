//! Audit trail
//!
//! Append-only log of governance events. Every entry is also emitted on the
//! `audit` tracing target, which is where the external audit sink picks it up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Authentication
    UserLogin,
    UserStatusChanged,
    LoginFailed,

    // Query pipeline
    PolicyDecision,
    QueryExecuted,
    QueryFailed,

    // Approval workflow
    ApprovalRequested,
    ApprovalApproved,
    ApprovalRejected,

    // Rate limiting
    RateLimitExceeded,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::UserLogin => "user_login",
            AuditEventType::UserStatusChanged => "user_status_changed",
            AuditEventType::LoginFailed => "login_failed",
            AuditEventType::PolicyDecision => "policy_decision",
            AuditEventType::QueryExecuted => "query_executed",
            AuditEventType::QueryFailed => "query_failed",
            AuditEventType::ApprovalRequested => "approval_requested",
            AuditEventType::ApprovalApproved => "approval_approved",
            AuditEventType::ApprovalRejected => "approval_rejected",
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
        }
    }
}

impl std::str::FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_login" => Ok(AuditEventType::UserLogin),
            "user_status_changed" => Ok(AuditEventType::UserStatusChanged),
            "login_failed" => Ok(AuditEventType::LoginFailed),
            "policy_decision" => Ok(AuditEventType::PolicyDecision),
            "query_executed" => Ok(AuditEventType::QueryExecuted),
            "query_failed" => Ok(AuditEventType::QueryFailed),
            "approval_requested" => Ok(AuditEventType::ApprovalRequested),
            "approval_approved" => Ok(AuditEventType::ApprovalApproved),
            "approval_rejected" => Ok(AuditEventType::ApprovalRejected),
            "rate_limit_exceeded" => Ok(AuditEventType::RateLimitExceeded),
            other => Err(format!("Unknown event type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    /// Acting identity (`user:<id>` / `ip:<addr>` style keys are kept verbatim)
    pub actor: Option<String>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, resource_type: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            actor: None,
            resource_type: resource_type.into(),
            resource_id: None,
            details: serde_json::Value::Null,
        }
    }

    /// Use a pre-allocated id so callers can correlate before recording
    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Filter for audit trail queries
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub event_type: Option<AuditEventType>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.start.map_or(true, |s| event.timestamp >= s)
            && self.end.map_or(true, |e| event.timestamp <= e)
            && self.event_type.map_or(true, |t| event.event_type == t)
    }
}

/// One page of the audit trail
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub events: Vec<AuditEvent>,
    pub total: usize,
}

pub struct AuditLog {
    events: RwLock<Vec<AuditEvent>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }

    /// Record an event and forward it to the audit sink. Returns the event id.
    pub async fn record(&self, event: AuditEvent) -> Uuid {
        let event_id = event.event_id;
        info!(
            target: "audit",
            event_id = %event.event_id,
            event_type = event.event_type.as_str(),
            actor = event.actor.as_deref().unwrap_or("anonymous"),
            resource_type = %event.resource_type,
            resource_id = event.resource_id.as_deref().unwrap_or(""),
            details = %event.details,
            "audit event"
        );
        self.events.write().await.push(event);
        event_id
    }

    /// Most recent first, paginated
    pub async fn query(&self, filter: &AuditFilter, limit: usize, offset: usize) -> AuditPage {
        let events = self.events.read().await;
        let matching: Vec<&AuditEvent> = events.iter().rev().filter(|e| filter.matches(e)).collect();
        AuditPage {
            total: matching.len(),
            events: matching.into_iter().skip(offset).take(limit).cloned().collect(),
        }
    }

    pub async fn get(&self, event_id: Uuid) -> Option<AuditEvent> {
        let events = self.events.read().await;
        events.iter().find(|e| e.event_id == event_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
