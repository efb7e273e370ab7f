//! User management module
//!
//! Handles user storage and retrieval.

use crate::auth::{hash_password, Role};
use crate::catalog::PiiLevel;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// User model
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub role: Role,
    pub clearance: PiiLevel,
    pub jurisdiction: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: &str, password_hash: &str, name: &str, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: normalize_email(email),
            password_hash: password_hash.to_string(),
            name: name.to_string(),
            role,
            clearance: PiiLevel::Low,
            jurisdiction: "US".to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_clearance(mut self, clearance: PiiLevel, jurisdiction: &str) -> Self {
        self.clearance = clearance;
        self.jurisdiction = jurisdiction.to_uppercase();
        self
    }
}

/// User response (without sensitive data)
#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub clearance: PiiLevel,
    pub jurisdiction: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        UserResponse {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
            clearance: user.clearance,
            jurisdiction: user.jurisdiction.clone(),
            is_active: user.is_active,
            created_at: user.created_at,
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// In-memory user store
pub struct UserStore {
    users: Arc<RwLock<HashMap<Uuid, User>>>,
    email_index: Arc<RwLock<HashMap<String, Uuid>>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            email_index: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a new user
    pub async fn create(&self, user: User) -> Result<User, AppError> {
        let mut users = self.users.write().await;
        let mut email_index = self.email_index.write().await;

        if email_index.contains_key(&user.email) {
            return Err(AppError::Conflict("Email already registered".to_string()));
        }

        email_index.insert(user.email.clone(), user.id);
        users.insert(user.id, user.clone());

        Ok(user)
    }

    /// Find user by email (case-insensitive)
    pub async fn find_by_email(&self, email: &str) -> Option<User> {
        let email_index = self.email_index.read().await;
        let users = self.users.read().await;

        email_index
            .get(&normalize_email(email))
            .and_then(|id| users.get(id).cloned())
    }

    /// Find user by ID
    pub async fn find_by_id(&self, id: Uuid) -> Option<User> {
        let users = self.users.read().await;
        users.get(&id).cloned()
    }

    /// Enable or disable an account
    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<User, AppError> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
        user.is_active = active;
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    /// Seed an administrator from configuration. Existing accounts are left alone.
    pub async fn bootstrap_admin(&self, email: &str, password: &str) -> Result<(), AppError> {
        if self.find_by_email(email).await.is_some() {
            return Ok(());
        }
        let admin = User::new(email, &hash_password(password)?, "Administrator", Role::Admin)
            .with_clearance(PiiLevel::High, "US");
        self.create(admin).await?;
        info!("Bootstrap admin {} created", email);
        Ok(())
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_email_is_conflict() {
        let store = UserStore::new();
        store.create(User::new("A@Bank.example", "h", "A", Role::Analyst)).await.unwrap();
        let err = store
            .create(User::new("a@bank.example", "h", "A", Role::Analyst))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert!(store.find_by_email(" a@BANK.example ").await.is_some());
    }

    #[tokio::test]
    async fn test_set_active() {
        let store = UserStore::new();
        let user = store.create(User::new("b@bank.example", "h", "B", Role::Viewer)).await.unwrap();
        let updated = store.set_active(user.id, false).await.unwrap();
        assert!(!updated.is_active);
        assert!(store.set_active(Uuid::new_v4(), true).await.is_err());
    }
}
