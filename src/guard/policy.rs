//! Policy guard
//!
//! Evaluates a query against the dataset's sensitivity metadata and decides
//! whether it may run, must be refused, or needs human sign-off.

use crate::approval::ApprovalRef;
use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::auth::Principal;
use crate::catalog::{Dataset, PiiLevel};
use crate::error::AppError;
use crate::ratelimit::CounterStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const BUDGET_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

pub const CHECK_PII_ACCESS: &str = "pii_access";
pub const CHECK_CROSS_BORDER: &str = "cross_border";
pub const CHECK_PURPOSE: &str = "purpose_limitation";
pub const CHECK_ALLOWED_TABLES: &str = "allowed_tables";
pub const CHECK_QUERY_BUDGET: &str = "query_budget";

const REASON_APPROVAL_REQUIRED: &str = "high_pii_requires_approval";
const REASON_PII_CLEARANCE: &str = "pii_clearance_insufficient";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    RequireApproval,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::RequireApproval => "require_approval",
        }
    }
}

/// Result of one policy dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub rationale: String,
}

impl CheckOutcome {
    fn pass(rationale: impl Into<String>) -> Self {
        Self {
            passed: true,
            rationale: rationale.into(),
        }
    }

    fn fail(rationale: impl Into<String>) -> Self {
        Self {
            passed: false,
            rationale: rationale.into(),
        }
    }
}

/// The budget counter a decision consumed from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRef {
    pub key: String,
    pub consumed: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub dataset_id: String,
    pub pii_level: PiiLevel,
    /// Requester sits outside the dataset's home jurisdiction
    pub cross_border: bool,
    /// Stated purpose is on the dataset's allow-list
    pub purpose_allowed: bool,
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    pub checks: BTreeMap<String, CheckOutcome>,
    pub budget: BudgetRef,
    pub audit_event_id: Uuid,
    pub approval: Option<ApprovalRef>,
    pub decided_at: DateTime<Utc>,
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    /// Settle a `require_approval` decision with the approval that was granted.
    /// The checks, budget reference and audit event id are carried over
    /// unchanged; only the PII requirement on high-PII data is waived.
    pub fn with_approval(&self, approval: ApprovalRef) -> PolicyDecision {
        let mut settled = self.clone();
        let waives_pii = self.pii_level == PiiLevel::High;
        settled
            .reasons
            .retain(|r| r != REASON_APPROVAL_REQUIRED && !(waives_pii && r == REASON_PII_CLEARANCE));
        settled.verdict = if settled.reasons.is_empty() {
            Verdict::Allow
        } else {
            Verdict::Deny
        };
        settled.approval = Some(approval);
        settled
    }
}

/// Everything the guard looks at for one pipeline pass
pub struct PolicyInput<'a> {
    pub execution_id: Uuid,
    pub dataset: &'a Dataset,
    pub principal: &'a Principal,
    pub purpose: &'a str,
    pub tables: &'a [String],
    /// A live approval for this dataset and requester, if one exists
    pub approval: Option<ApprovalRef>,
}

pub struct PolicyGuard {
    counters: Arc<dyn CounterStore>,
    audit: Arc<AuditLog>,
    daily_budget: u64,
}

pub fn budget_key(principal: &Principal) -> String {
    format!("budget:{}", principal.identity())
}

impl PolicyGuard {
    pub fn new(counters: Arc<dyn CounterStore>, audit: Arc<AuditLog>, daily_budget: u64) -> Self {
        Self {
            counters,
            audit,
            daily_budget,
        }
    }

    /// Run every check, consume one budget unit and record the decision.
    pub async fn evaluate(&self, input: PolicyInput<'_>) -> Result<PolicyDecision, AppError> {
        let dataset = input.dataset;
        let principal = input.principal;
        let mut checks = BTreeMap::new();
        let mut reasons = Vec::new();

        let pii_ok = principal.clearance >= dataset.pii_level;
        checks.insert(
            CHECK_PII_ACCESS.to_string(),
            if pii_ok {
                CheckOutcome::pass(format!(
                    "clearance {} covers {} PII",
                    principal.clearance, dataset.pii_level
                ))
            } else {
                CheckOutcome::fail(format!(
                    "clearance {} is below {} PII",
                    principal.clearance, dataset.pii_level
                ))
            },
        );

        let cross_border = !dataset.jurisdiction.eq_ignore_ascii_case(&principal.jurisdiction);
        let border_ok = dataset.permits_jurisdiction(&principal.jurisdiction);
        checks.insert(
            CHECK_CROSS_BORDER.to_string(),
            if border_ok {
                CheckOutcome::pass(format!(
                    "{} may read {} data",
                    principal.jurisdiction, dataset.jurisdiction
                ))
            } else {
                CheckOutcome::fail(format!(
                    "{} data may not leave for {}",
                    dataset.jurisdiction, principal.jurisdiction
                ))
            },
        );

        let purpose_allowed = dataset.permits_purpose(input.purpose);
        checks.insert(
            CHECK_PURPOSE.to_string(),
            if purpose_allowed {
                CheckOutcome::pass(format!("purpose '{}' is allow-listed", input.purpose.trim()))
            } else {
                CheckOutcome::fail(format!(
                    "purpose '{}' is not in [{}]",
                    input.purpose.trim(),
                    dataset.allowed_purposes.join(", ")
                ))
            },
        );

        let foreign = dataset.foreign_tables(input.tables);
        checks.insert(
            CHECK_ALLOWED_TABLES.to_string(),
            if foreign.is_empty() {
                CheckOutcome::pass("all referenced tables belong to the dataset")
            } else {
                CheckOutcome::fail(format!("tables outside the dataset: {}", foreign.join(", ")))
            },
        );

        let key = budget_key(principal);
        let hit = self.counters.hit(&key, self.daily_budget, BUDGET_WINDOW).await?;
        checks.insert(
            CHECK_QUERY_BUDGET.to_string(),
            if hit.admitted {
                CheckOutcome::pass(format!("{} of {} daily queries used", hit.count, self.daily_budget))
            } else {
                CheckOutcome::fail(format!("daily budget of {} exhausted", self.daily_budget))
            },
        );

        // An approval stands in for missing clearance on high-PII data only
        let approval_covers_pii = dataset.pii_level == PiiLevel::High && input.approval.is_some();

        if !pii_ok && !approval_covers_pii {
            reasons.push(REASON_PII_CLEARANCE.to_string());
        }
        if !border_ok {
            reasons.push("cross_border_not_permitted".to_string());
        }
        if !purpose_allowed {
            reasons.push("purpose_not_allowed".to_string());
        }
        if !foreign.is_empty() {
            reasons.push("table_not_in_dataset".to_string());
        }
        if !hit.admitted {
            reasons.push("query_budget_exhausted".to_string());
        }

        let verdict = if dataset.pii_level == PiiLevel::High && input.approval.is_none() {
            reasons.insert(0, REASON_APPROVAL_REQUIRED.to_string());
            Verdict::RequireApproval
        } else if !reasons.is_empty() {
            Verdict::Deny
        } else {
            Verdict::Allow
        };

        let audit_event_id = Uuid::new_v4();
        let decision = PolicyDecision {
            dataset_id: dataset.id.clone(),
            pii_level: dataset.pii_level,
            cross_border,
            purpose_allowed,
            verdict,
            reasons,
            checks,
            budget: BudgetRef {
                key,
                consumed: hit.count,
                limit: self.daily_budget,
            },
            audit_event_id,
            approval: input.approval,
            decided_at: Utc::now(),
        };

        debug!(
            "policy {} for {} on {}: {:?}",
            decision.verdict.as_str(),
            principal.id,
            dataset.id,
            decision.reasons
        );

        self.audit
            .record(
                AuditEvent::new(AuditEventType::PolicyDecision, "query_execution")
                    .with_id(audit_event_id)
                    .actor(principal.identity())
                    .resource(input.execution_id.to_string())
                    .details(json!({
                        "dataset_id": decision.dataset_id,
                        "verdict": decision.verdict,
                        "reasons": decision.reasons,
                        "pii_level": decision.pii_level,
                        "cross_border": decision.cross_border,
                        "purpose_allowed": decision.purpose_allowed,
                        "budget_consumed": decision.budget.consumed,
                    })),
            )
            .await;

        if decision.verdict != Verdict::Allow {
            info!(
                "query {} on {} -> {}",
                input.execution_id,
                dataset.id,
                decision.verdict.as_str()
            );
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::catalog::DatasetCatalog;
    use crate::ratelimit::InMemoryCounterStore;
    use pretty_assertions::assert_eq;

    fn guard(budget: u64) -> (PolicyGuard, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new());
        (
            PolicyGuard::new(Arc::new(InMemoryCounterStore::new()), audit.clone(), budget),
            audit,
        )
    }

    fn analyst(clearance: PiiLevel, jurisdiction: &str) -> Principal {
        Principal {
            id: Uuid::new_v4(),
            email: "analyst@bank.example".to_string(),
            role: Role::Analyst,
            clearance,
            jurisdiction: jurisdiction.to_string(),
        }
    }

    async fn dataset(id: &str) -> Dataset {
        DatasetCatalog::builtin().get(id).await.unwrap()
    }

    fn input<'a>(dataset: &'a Dataset, principal: &'a Principal, purpose: &'a str, tables: &'a [String]) -> PolicyInput<'a> {
        PolicyInput {
            execution_id: Uuid::new_v4(),
            dataset,
            principal,
            purpose,
            tables,
            approval: None,
        }
    }

    #[tokio::test]
    async fn test_medium_pii_with_clearance_is_allowed() {
        let (guard, audit) = guard(10);
        let loans = dataset("loan_portfolio").await;
        let principal = analyst(PiiLevel::Medium, "US");
        let tables = vec!["loans".to_string()];

        let decision = guard
            .evaluate(input(&loans, &principal, "credit_risk_reporting", &tables))
            .await
            .unwrap();

        assert_eq!(decision.verdict, Verdict::Allow);
        assert!(decision.reasons.is_empty());
        assert!(!decision.cross_border);
        assert!(decision.purpose_allowed);
        assert_eq!(decision.budget.consumed, 1);
        assert_eq!(decision.budget.key, format!("budget:user:{}", principal.id));
        assert_eq!(decision.checks.len(), 5);

        let event = audit.get(decision.audit_event_id).await.unwrap();
        assert_eq!(event.event_type, AuditEventType::PolicyDecision);
        assert_eq!(audit.count().await, 1);
    }

    #[tokio::test]
    async fn test_high_pii_requires_approval_even_with_clearance() {
        let (guard, _) = guard(10);
        let customers = dataset("customer_master").await;
        let principal = analyst(PiiLevel::High, "US");
        let decision = guard
            .evaluate(input(&customers, &principal, "kyc_review", &[]))
            .await
            .unwrap();
        assert_eq!(decision.verdict, Verdict::RequireApproval);
        assert_eq!(decision.reasons[0], "high_pii_requires_approval");
    }

    #[tokio::test]
    async fn test_approval_satisfies_high_pii() {
        let (guard, _) = guard(10);
        let customers = dataset("customer_master").await;
        let principal = analyst(PiiLevel::Low, "US");
        let mut request = input(&customers, &principal, "kyc_review", &[]);
        request.approval = Some(ApprovalRef {
            request_id: Uuid::new_v4(),
            approver_id: Some(Uuid::new_v4()),
            approved_at: Some(Utc::now()),
        });
        let decision = guard.evaluate(request).await.unwrap();
        assert_eq!(decision.verdict, Verdict::Allow);
        assert!(decision.approval.is_some());
        assert!(!decision.checks[CHECK_PII_ACCESS].passed);
    }

    #[tokio::test]
    async fn test_settling_with_approval_keeps_budget_and_audit_id() {
        let (guard, audit) = guard(10);
        let customers = dataset("customer_master").await;
        let principal = analyst(PiiLevel::Low, "US");
        let pending = guard
            .evaluate(input(&customers, &principal, "kyc_review", &[]))
            .await
            .unwrap();
        assert_eq!(pending.verdict, Verdict::RequireApproval);

        let settled = pending.with_approval(ApprovalRef {
            request_id: Uuid::new_v4(),
            approver_id: Some(Uuid::new_v4()),
            approved_at: Some(Utc::now()),
        });
        assert_eq!(settled.verdict, Verdict::Allow);
        assert!(settled.reasons.is_empty());
        assert_eq!(settled.audit_event_id, pending.audit_event_id);
        assert_eq!(settled.budget, pending.budget);
        assert_eq!(audit.count().await, 1);

        // Other failed checks still deny after approval
        let abroad = analyst(PiiLevel::High, "SG");
        let pending = guard
            .evaluate(input(&customers, &abroad, "marketing", &[]))
            .await
            .unwrap();
        let settled = pending.with_approval(ApprovalRef {
            request_id: Uuid::new_v4(),
            approver_id: None,
            approved_at: None,
        });
        assert_eq!(settled.verdict, Verdict::Deny);
        assert!(settled.reasons.contains(&"purpose_not_allowed".to_string()));
        assert!(!settled.reasons.contains(&REASON_APPROVAL_REQUIRED.to_string()));
    }

    #[tokio::test]
    async fn test_failed_checks_deny_with_reasons() {
        let (guard, audit) = guard(10);
        let loans = dataset("loan_portfolio").await;
        let principal = analyst(PiiLevel::Low, "EU");
        let tables = vec!["customers".to_string()];
        let decision = guard
            .evaluate(input(&loans, &principal, "marketing", &tables))
            .await
            .unwrap();

        assert_eq!(decision.verdict, Verdict::Deny);
        assert_eq!(
            decision.reasons,
            vec![
                "pii_clearance_insufficient".to_string(),
                "cross_border_not_permitted".to_string(),
                "purpose_not_allowed".to_string(),
                "table_not_in_dataset".to_string(),
            ]
        );
        assert!(decision.cross_border);
        assert!(!decision.purpose_allowed);
        // Denials are audited too
        assert_eq!(audit.count().await, 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_denies() {
        let (guard, _) = guard(1);
        let ledger = dataset("gl_balances").await;
        let principal = analyst(PiiLevel::None, "US");

        let first = guard
            .evaluate(input(&ledger, &principal, "financial_reporting", &[]))
            .await
            .unwrap();
        assert_eq!(first.verdict, Verdict::Allow);

        let second = guard
            .evaluate(input(&ledger, &principal, "financial_reporting", &[]))
            .await
            .unwrap();
        assert_eq!(second.verdict, Verdict::Deny);
        assert_eq!(second.reasons, vec!["query_budget_exhausted".to_string()]);
        assert_ne!(first.audit_event_id, second.audit_event_id);
    }
}
