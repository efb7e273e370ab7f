//! Append-only evidence storage
//!
//! Records are content-addressed by the SHA-256 of the canonical pack and
//! sealed with an HMAC so later tampering is detectable.

use super::canonical::{canonical_json, hmac_hex, sha256_hex, verify_hmac_hex};
use super::EvidencePack;
use crate::config::EvidenceConfig;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceRecord {
    pub pack: EvidencePack,
    pub content_hash: String,
    pub signature: String,
    /// Object-store location of the pack
    pub object_ref: String,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub hash_valid: bool,
    pub signature_valid: bool,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        self.hash_valid && self.signature_valid
    }
}

pub struct EvidenceStore {
    records: RwLock<HashMap<Uuid, EvidenceRecord>>,
    signing_key: String,
    bucket: String,
}

impl EvidenceStore {
    pub fn new(config: &EvidenceConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            signing_key: config.signing_key.clone(),
            bucket: config.bucket.clone(),
        }
    }

    fn object_ref(&self, execution_id: Uuid, hash: &str) -> String {
        format!("s3://{}/evidence/{}/{}.json", self.bucket, execution_id, hash)
    }

    /// Seal and store a pack. A second pack for the same execution is a conflict.
    pub async fn append(&self, pack: EvidencePack) -> Result<EvidenceRecord, AppError> {
        let canonical = canonical_json(&pack)?;
        let content_hash = sha256_hex(&canonical);
        let signature = hmac_hex(&canonical, &self.signing_key)?;

        let mut records = self.records.write().await;
        if records.contains_key(&pack.execution_id) {
            return Err(AppError::Conflict(format!(
                "Evidence for execution {} already exists",
                pack.execution_id
            )));
        }

        let record = EvidenceRecord {
            object_ref: self.object_ref(pack.execution_id, &content_hash),
            content_hash,
            signature,
            stored_at: Utc::now(),
            pack,
        };
        info!(
            "evidence sealed for {} ({}, error: {})",
            record.pack.execution_id,
            record.content_hash,
            record.pack.is_error()
        );
        records.insert(record.pack.execution_id, record.clone());
        Ok(record)
    }

    pub async fn get(&self, execution_id: Uuid) -> Result<EvidenceRecord, AppError> {
        let records = self.records.read().await;
        records
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Evidence for {} not found", execution_id)))
    }

    /// Recompute hash and signature over the stored pack
    pub fn verify(&self, record: &EvidenceRecord) -> Result<Verification, AppError> {
        let canonical = canonical_json(&record.pack)?;
        Ok(Verification {
            hash_valid: sha256_hex(&canonical) == record.content_hash,
            signature_valid: verify_hmac_hex(&canonical, &record.signature, &self.signing_key),
        })
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{build_evidence_pack, EvidenceInput, SqlGateOutcome};

    fn pack() -> EvidencePack {
        build_evidence_pack(EvidenceInput {
            execution_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            dataset_id: "gl_balances",
            sql: "SELECT * FROM gl_balances",
            natural_language: None,
            purpose: "financial_reporting",
            row_count: 3,
            elapsed_secs: 0.01,
            sql_gate: SqlGateOutcome::Passed,
            decision: None,
            tables: &[],
            attempted: true,
            error: None,
        })
    }

    fn store() -> EvidenceStore {
        EvidenceStore::new(&EvidenceConfig {
            signing_key: "test-signing-key".to_string(),
            bucket: "audit-bucket".to_string(),
        })
    }

    #[tokio::test]
    async fn test_append_is_content_addressed_and_verifiable() {
        let store = store();
        let pack = pack();
        let record = store.append(pack.clone()).await.unwrap();

        assert_eq!(record.content_hash.len(), 64);
        assert_eq!(
            record.object_ref,
            format!("s3://audit-bucket/evidence/{}/{}.json", pack.execution_id, record.content_hash)
        );
        assert!(store.verify(&record).unwrap().is_valid());

        let fetched = store.get(pack.execution_id).await.unwrap();
        assert_eq!(fetched.content_hash, record.content_hash);
    }

    #[tokio::test]
    async fn test_second_pack_for_execution_conflicts() {
        let store = store();
        let pack = pack();
        store.append(pack.clone()).await.unwrap();
        let err = store.append(pack).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let store = store();
        let mut record = store.append(pack()).await.unwrap();
        record.pack.execution.row_count = 9999;
        let verification = store.verify(&record).unwrap();
        assert!(!verification.hash_valid);
        assert!(!verification.signature_valid);
    }
}
