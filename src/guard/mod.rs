//! Query gates: the read-only SQL check and the dataset policy guard

pub mod policy;
pub mod sql;

pub use policy::{PolicyDecision, PolicyGuard, PolicyInput, Verdict};
pub use sql::{validate_sql, ValidatedSql};
