//! Governed query execution

pub mod engine;
mod models;
mod orchestrator;
mod store;

pub use engine::{DetachedEngine, PostgresEngine, QueryEngine};
pub use models::{
    Completion, EvidenceSummary, QueryExecution, QueryOutcome, QueryOutput, QueryRequest,
    QueryResult, QueryStatus,
};
pub use orchestrator::QueryOrchestrator;
pub use store::ExecutionStore;
