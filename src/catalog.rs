//! Dataset catalog
//!
//! Sensitivity metadata for every governed dataset: PII level, jurisdiction
//! rules, allow-listed purposes and the physical tables a dataset exposes.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

/// Declared sensitivity tier of a dataset (or the clearance of a user)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiiLevel {
    None,
    Low,
    Medium,
    High,
}

impl Default for PiiLevel {
    fn default() -> Self {
        PiiLevel::None
    }
}

impl std::fmt::Display for PiiLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PiiLevel::None => write!(f, "none"),
            PiiLevel::Low => write!(f, "low"),
            PiiLevel::Medium => write!(f, "medium"),
            PiiLevel::High => write!(f, "high"),
        }
    }
}

/// Business domain a dataset belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    CreditRisk,
    AmlFcc,
    Finance,
    Treasury,
    Retail,
    Ops,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub domain: Domain,
    pub owner: String,
    #[serde(default)]
    pub description: String,
    pub pii_level: PiiLevel,
    /// Home jurisdiction (e.g. "US", "EU")
    pub jurisdiction: String,
    /// Foreign jurisdictions allowed to read this dataset
    #[serde(default)]
    pub permitted_jurisdictions: Vec<String>,
    /// Purposes this dataset may be queried for
    #[serde(default)]
    pub allowed_purposes: Vec<String>,
    /// Physical tables exposed through this dataset. Empty means unrestricted.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Dataset {
    pub fn permits_jurisdiction(&self, jurisdiction: &str) -> bool {
        self.jurisdiction.eq_ignore_ascii_case(jurisdiction)
            || self
                .permitted_jurisdictions
                .iter()
                .any(|j| j.eq_ignore_ascii_case(jurisdiction))
    }

    pub fn permits_purpose(&self, purpose: &str) -> bool {
        let purpose = purpose.trim();
        !purpose.is_empty()
            && self
                .allowed_purposes
                .iter()
                .any(|p| p.eq_ignore_ascii_case(purpose))
    }

    /// Returns the referenced tables this dataset does not expose
    pub fn foreign_tables<'a>(&self, referenced: &'a [String]) -> Vec<&'a str> {
        if self.tables.is_empty() {
            return Vec::new();
        }
        referenced
            .iter()
            .filter(|table| {
                let bare = table.rsplit('.').next().unwrap_or(table.as_str());
                !self
                    .tables
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(table) || t.eq_ignore_ascii_case(bare))
            })
            .map(|t| t.as_str())
            .collect()
    }
}

/// Thread-safe dataset catalog
pub struct DatasetCatalog {
    datasets: RwLock<HashMap<String, Dataset>>,
}

impl DatasetCatalog {
    pub fn new(datasets: Vec<Dataset>) -> Self {
        Self {
            datasets: RwLock::new(datasets.into_iter().map(|d| (d.id.clone(), d)).collect()),
        }
    }

    /// Load the catalog from a JSON array file
    pub async fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Config(format!("Failed to read dataset catalog {}: {}", path.display(), e))
        })?;
        let datasets: Vec<Dataset> = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("Invalid dataset catalog: {}", e)))?;
        info!("Loaded {} datasets from {}", datasets.len(), path.display());
        Ok(Self::new(datasets))
    }

    pub async fn get(&self, id: &str) -> Option<Dataset> {
        self.datasets.read().await.get(id).cloned()
    }

    /// List datasets ordered by id
    pub async fn list(&self) -> Vec<Dataset> {
        let datasets = self.datasets.read().await;
        let mut list: Vec<Dataset> = datasets.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Built-in banking catalog used when no catalog file is configured
    pub fn builtin() -> Self {
        Self::new(vec![
            builtin_entry(
                "loan_portfolio",
                "Loan Portfolio",
                Domain::CreditRisk,
                "credit-risk-team",
                PiiLevel::Medium,
                "US",
                &["credit_risk_reporting", "regulatory_reporting"],
                &["loans", "loan_payments"],
            ),
            builtin_entry(
                "customer_master",
                "Customer Master",
                Domain::Retail,
                "retail-data-office",
                PiiLevel::High,
                "US",
                &["kyc_review", "regulatory_reporting"],
                &["customers", "customer_addresses"],
            ),
            builtin_entry(
                "aml_alerts",
                "AML Alerts",
                Domain::AmlFcc,
                "fcc-ops",
                PiiLevel::High,
                "EU",
                &["aml_investigation"],
                &["alerts", "alert_dispositions"],
            ),
            builtin_entry(
                "gl_balances",
                "General Ledger Balances",
                Domain::Finance,
                "finance-controllers",
                PiiLevel::None,
                "US",
                &["financial_reporting", "regulatory_reporting"],
                &["gl_balances"],
            ),
        ])
    }
}

#[allow(clippy::too_many_arguments)]
fn builtin_entry(
    id: &str,
    name: &str,
    domain: Domain,
    owner: &str,
    pii_level: PiiLevel,
    jurisdiction: &str,
    purposes: &[&str],
    tables: &[&str],
) -> Dataset {
    Dataset {
        id: id.to_string(),
        name: name.to_string(),
        domain,
        owner: owner.to_string(),
        description: String::new(),
        pii_level,
        jurisdiction: jurisdiction.to_string(),
        permitted_jurisdictions: Vec::new(),
        allowed_purposes: purposes.iter().map(|p| p.to_string()).collect(),
        tables: tables.iter().map(|t| t.to_string()).collect(),
        tags: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pii_levels_are_ordered() {
        assert!(PiiLevel::None < PiiLevel::Low);
        assert!(PiiLevel::Low < PiiLevel::Medium);
        assert!(PiiLevel::Medium < PiiLevel::High);
    }

    #[tokio::test]
    async fn test_builtin_catalog_lookup() {
        let catalog = DatasetCatalog::builtin();
        let loans = catalog.get("loan_portfolio").await.unwrap();
        assert_eq!(loans.pii_level, PiiLevel::Medium);
        assert!(loans.permits_purpose("Credit_Risk_Reporting"));
        assert!(!loans.permits_purpose(""));
        assert!(loans.permits_jurisdiction("us"));
        assert!(!loans.permits_jurisdiction("EU"));
        assert_eq!(catalog.list().await.len(), 4);
    }

    #[tokio::test]
    async fn test_foreign_tables_respects_schema_qualification() {
        let catalog = DatasetCatalog::builtin();
        let loans = catalog.get("loan_portfolio").await.unwrap();
        let referenced = vec!["public.loans".to_string(), "customers".to_string()];
        assert_eq!(loans.foreign_tables(&referenced), vec!["customers"]);
    }
}
