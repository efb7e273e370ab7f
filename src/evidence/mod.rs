//! Tamper-evident evidence packs

pub mod canonical;
mod pack;
mod store;

pub use pack::{build_evidence_pack, EvidenceInput, EvidencePack, SqlGateOutcome};
pub use store::{EvidenceRecord, EvidenceStore, Verification};
