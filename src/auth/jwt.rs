//! JWT token management
//!
//! Handles creation, validation, and refresh of JWT tokens.

use crate::auth::Role;
use crate::catalog::PiiLevel;
use crate::config::JwtConfig;
use crate::error::AppError;
use crate::users::User;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    pub email: String,
    pub role: Role,
    /// Highest PII tier the holder may read without approval
    pub clearance: PiiLevel,
    /// Jurisdiction the holder operates from
    pub jurisdiction: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    pub token_type: TokenType,
}

impl Claims {
    /// Counter identity used by the rate limiter and the query budget
    pub fn identity(&self) -> String {
        format!("user:{}", self.sub)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Token pair response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Signing material and lifetimes, built once from settings
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    access_minutes: i64,
    refresh_days: i64,
}

impl JwtKeys {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            algorithm: config.algorithm,
            access_minutes: config.access_token_minutes,
            refresh_days: config.refresh_token_days,
        }
    }

    fn sign(&self, user: &User, token_type: TokenType, lifetime: Duration) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id,
            email: user.email.clone(),
            role: user.role,
            clearance: user.clearance,
            jurisdiction: user.jurisdiction.clone(),
            exp: (now + lifetime).timestamp(),
            iat: now.timestamp(),
            token_type,
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("Failed to create token: {}", e)))
    }

    /// Create access and refresh tokens for a user
    pub fn create_tokens(&self, user: &User) -> Result<TokenPair, AppError> {
        let access_token = self.sign(user, TokenType::Access, Duration::minutes(self.access_minutes))?;
        let refresh_token = self.sign(user, TokenType::Refresh, Duration::days(self.refresh_days))?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_minutes * 60,
        })
    }

    /// Decode and validate a JWT token
    pub fn decode_token(&self, token: &str) -> Result<Claims, AppError> {
        let token_data = decode::<Claims>(token, &self.decoding, &Validation::new(self.algorithm))
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AppError::Authentication("Token expired".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidToken => {
                    AppError::Authentication("Invalid token".to_string())
                }
                _ => AppError::Authentication(format!("Token validation failed: {}", e)),
            })?;

        Ok(token_data.claims)
    }

    /// Decode a token and insist on its type
    pub fn decode_typed(&self, token: &str, expected: TokenType) -> Result<Claims, AppError> {
        let claims = self.decode_token(token)?;
        if claims.token_type != expected {
            return Err(AppError::Authentication("Invalid token type".to_string()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(algorithm: Algorithm) -> JwtKeys {
        JwtKeys::new(&JwtConfig {
            secret: "unit-test-secret-0123456789".to_string(),
            algorithm,
            access_token_minutes: 15,
            refresh_token_days: 1,
        })
    }

    fn user() -> User {
        User::new("analyst@bank.example", "hash", "Ana", Role::Analyst)
            .with_clearance(PiiLevel::Medium, "US")
    }

    #[test]
    fn test_tokens_round_trip_claims() {
        let keys = keys(Algorithm::HS384);
        let user = user();
        let pair = keys.create_tokens(&user).unwrap();
        assert_eq!(pair.expires_in, 900);

        let claims = keys.decode_typed(&pair.access_token, TokenType::Access).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.clearance, PiiLevel::Medium);
        assert_eq!(claims.jurisdiction, "US");
        assert_eq!(claims.identity(), format!("user:{}", user.id));
    }

    #[test]
    fn test_refresh_token_cannot_be_used_as_access() {
        let keys = keys(Algorithm::HS256);
        let pair = keys.create_tokens(&user()).unwrap();
        let err = keys.decode_typed(&pair.refresh_token, TokenType::Access).unwrap_err();
        assert!(matches!(err, AppError::Authentication(_)));
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let pair = keys(Algorithm::HS256).create_tokens(&user()).unwrap();
        let other = JwtKeys::new(&JwtConfig {
            secret: "a-completely-different-secret".to_string(),
            ..JwtConfig::default()
        });
        assert!(other.decode_token(&pair.access_token).is_err());
    }
}
