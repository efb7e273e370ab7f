//! Authentication and authorization module
//!
//! Provides JWT-based authentication and role-based access control.

mod jwt;
mod middleware;
mod password;

pub use jwt::{Claims, JwtKeys, TokenPair, TokenType};
pub use middleware::{auth_middleware, require_role};
pub use password::{check_password_strength, hash_password, verify_password};

use crate::catalog::PiiLevel;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authenticated identity a query runs on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub clearance: PiiLevel,
    pub jurisdiction: String,
}

impl Principal {
    pub fn identity(&self) -> String {
        format!("user:{}", self.id)
    }
}

impl From<&Claims> for Principal {
    fn from(claims: &Claims) -> Self {
        Self {
            id: claims.sub,
            email: claims.email.clone(),
            role: claims.role,
            clearance: claims.clearance,
            jurisdiction: claims.jurisdiction.clone(),
        }
    }
}

/// User roles for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Can browse the catalog and own query history
    Viewer,
    /// Can submit governed queries
    Analyst,
    /// Can act on approval requests raised by others
    Approver,
    /// Everything, including metrics and other users' executions
    Admin,
}

impl Role {
    pub fn can_query(&self) -> bool {
        matches!(self, Role::Analyst | Role::Approver | Role::Admin)
    }

    pub fn can_approve(&self) -> bool {
        matches!(self, Role::Approver | Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Viewer
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Viewer => write!(f, "viewer"),
            Role::Analyst => write!(f, "analyst"),
            Role::Approver => write!(f, "approver"),
            Role::Admin => write!(f, "admin"),
        }
    }
}
