//! Human sign-off for sensitive datasets
//!
//! A request starts `pending` and moves exactly once to `approved` or
//! `rejected`. An approval stays usable by its requester until it expires.

mod models;
mod store;

pub use models::{
    ApprovalAction, ApprovalRef, ApprovalRequest, ApprovalStatus, CreateApprovalRequest,
};
pub use store::ApprovalStore;
